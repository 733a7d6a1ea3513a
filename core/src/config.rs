//! Connection settings for `OpaClient`.
//!
//! # Design
//! `ClientConfig` is a plain value with builder-style setters. Nothing here
//! is validated; `OpaClient::new` parses the URL and reports `InvalidUrl`,
//! so a bad configuration fails at construction and never mid-call.

use std::fmt;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_URL: &str = "http://localhost:8181";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Wire name of the strict-builtin-errors evaluation flag. Older servers
/// only understand `strict`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrictParam {
    #[default]
    BuiltinErrors,
    Legacy,
}

impl StrictParam {
    pub fn as_str(self) -> &'static str {
        match self {
            StrictParam::BuiltinErrors => "strict-builtin-errors",
            StrictParam::Legacy => "strict",
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Verify the server's TLS certificate.
    pub verify: bool,
    pub token: Option<String>,
    pub retry: RetryPolicy,
    /// Applied to every attempt, not to the call as a whole.
    pub timeout: Duration,
    pub strict_param: StrictParam,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            verify: true,
            token: None,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            strict_param: StrictParam::default(),
        }
    }
}

// Keeps the bearer token out of logs.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("verify", &self.verify)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("strict_param", &self.strict_param)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self::default().with_url(url)
    }

    /// Defaults overlaid with `OPA_URL` and `OPA_TOKEN` when they are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("OPA_URL").filter(|v| !v.is_empty()) {
            config.url = url;
        }
        config.token = lookup("OPA_TOKEN").filter(|v| !v.is_empty());
        config
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry.retries = retries;
        self
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.retry.backoff_factor = backoff_factor;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_strict_param(mut self, strict_param: StrictParam) -> Self {
        self.strict_param = strict_param;
        self
    }
}

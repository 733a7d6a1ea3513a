//! Error types for the policy server client.
//!
//! # Design
//! Every failure surfaces as one `OpaError` variant; nothing is swallowed and
//! nothing leaks out as an untyped transport error. The status-code mapping
//! is per endpoint (see `client`), so the same HTTP status can land in
//! different variants: a 404 on a policy read is `PolicyNotFound`, a 404 on a
//! document delete is `DocumentNotFound`.
//!
//! Variants that carry a `serde_json::Value` hold the decoded server error
//! body. When the server sends something that is not JSON, the raw text is
//! kept as a JSON string so the caller still sees it.

use serde_json::Value;
use thiserror::Error;

/// Result alias used throughout the client.
pub type Result<T> = std::result::Result<T, OpaError>;

/// Errors returned by `OpaClient`.
#[derive(Debug, Error)]
pub enum OpaError {
    /// The configured base URL could not be parsed or is not http(s).
    /// Only raised at construction.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Transport failure after all retries, or a status code the endpoint
    /// has no specific mapping for.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server answered 401.
    #[error("unauthorized: {0}")]
    Unauthorized(Value),

    /// A policy module or ad-hoc query was rejected with 400.
    #[error("invalid policy: {0}")]
    InvalidPolicy(Value),

    /// A document was rejected with 400.
    #[error("invalid document: {0}")]
    InvalidDocument(Value),

    /// Policy evaluation returned a non-2xx status.
    #[error("policy request failed: {0}")]
    PolicyRequest(Value),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// A health rule name contained `/` or `.`. Raised before any request.
    #[error("invalid health rule name `{0}`: must not contain '/' or '.'")]
    InvalidRuleName(String),

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl OpaError {
    /// Status-agnostic "could not complete" error with the HTTP status
    /// appended, used for unmapped non-2xx responses.
    pub(crate) fn unexpected_status(action: &str, status: u16) -> Self {
        OpaError::Connection(format!("{action} (HTTP {status})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_includes_server_body() {
        let err = OpaError::Unauthorized(json!({"code": "unauthorized"}));
        assert_eq!(err.to_string(), r#"unauthorized: {"code":"unauthorized"}"#);
    }

    #[test]
    fn unexpected_status_is_a_connection_error() {
        let err = OpaError::unexpected_status("unable to get policy", 500);
        assert!(matches!(err, OpaError::Connection(ref msg) if msg == "unable to get policy (HTTP 500)"));
    }
}

//! Request construction and response interpretation for the policy server API.
//!
//! # Design
//! `OpaClient` holds the validated base URL, the optional bearer token, the
//! retry policy and a `Transport`. It carries no per-call state. Every
//! operation is split into a `build_*` method that produces an `HttpRequest`
//! and a `parse_*` method that maps an `HttpResponse` onto a typed result or
//! an `OpaError`. The high-level method runs `build_*`, then `execute` (auth
//! check, retries, 401 mapping), then `parse_*`.
//!
//! Status mapping is per endpoint and mirrors the server's conventions: the
//! data API answers 200 with an empty object for undefined documents, so
//! "not found" is detected from a missing `result` key there, while the
//! policy API uses 404.

use std::thread;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::address::{canonical, package_path, parse_base_url};
use crate::config::{ClientConfig, StrictParam};
use crate::error::{OpaError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::retry::RetryPolicy;
use crate::transport::{Transport, UreqTransport};
use crate::types::{
    EvaluationRequest, HealthOptions, Policy, PolicyOptions, QueryOptions, QueryRequest,
};

const JSON: &str = "application/json";
const TEXT: &str = "text/plain";

/// Package evaluated by `check_custom_health_rule`.
pub const HEALTH_PACKAGE: &str = "system.health";

/// Blocking client for a policy-decision server.
///
/// Safe to share between threads when the transport is; the default
/// `UreqTransport` pools connections internally.
#[derive(Debug, Clone)]
pub struct OpaClient<T = UreqTransport> {
    base: Url,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
    strict_param: StrictParam,
    transport: T,
}

impl OpaClient<UreqTransport> {
    /// Validate `config.url` and build a client on the default transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = UreqTransport::new(config.timeout, config.verify);
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> OpaClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Result<Self> {
        let base = parse_base_url(&config.url)?;
        let base_url = canonical(&base);
        debug!(url = %base_url, "configured policy server client");
        Ok(Self {
            base,
            base_url,
            token: config.token,
            retry: config.retry,
            strict_param: config.strict_param,
            transport,
        })
    }

    /// The canonical base URL, e.g. `http://localhost:8181`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // -----------------------------------------------------------------------
    // Request primitive
    // -----------------------------------------------------------------------

    /// Send `body` as JSON to `path` and return the response, whatever its
    /// status other than 401.
    ///
    /// `retries` replaces the configured retry count for this call only.
    pub fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, &str)],
        retries: Option<u32>,
    ) -> Result<HttpResponse> {
        let query = query
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let request = match body {
            Some(body) => self.json_request(method, path, query, body)?,
            None => self.build_request(method, path, query, None)?,
        };
        self.execute(&request, retries)
    }

    /// Assemble a request against the base URL. `body` is a content type and
    /// the encoded payload.
    pub fn build_request(
        &self,
        method: HttpMethod,
        path: &str,
        query: Vec<(String, String)>,
        body: Option<(&str, String)>,
    ) -> Result<HttpRequest> {
        let url = self
            .base
            .join(path)
            .map_err(|e| OpaError::Connection(format!("cannot build URL for `{path}`: {e}")))?;

        let mut headers = Vec::new();
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        let body = body.map(|(content_type, payload)| {
            headers.push(("Content-Type".to_string(), content_type.to_string()));
            payload
        });

        Ok(HttpRequest {
            method,
            url: url.to_string(),
            query,
            headers,
            body,
        })
    }

    /// Run `request` through the transport, retrying connection failures
    /// with backoff. A 401 becomes `Unauthorized`; every other status is
    /// returned as-is.
    pub fn execute(&self, request: &HttpRequest, retries: Option<u32>) -> Result<HttpResponse> {
        let policy = retries.map_or(self.retry, |n| self.retry.with_retries(n));
        let max_attempts = policy.max_attempts();
        let mut attempt = 1;

        loop {
            debug!(method = request.method.as_str(), url = %request.url, attempt, "sending request");
            match self.transport.send(request) {
                Ok(response) => {
                    debug!(status = response.status, url = %request.url, "received response");
                    check_auth(&response)?;
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, error = %err, url = %request.url, "connection failed, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(OpaError::Connection(format!(
                        "unable to reach policy server at {} after {attempt} attempt(s): {err}",
                        self.base_url
                    )));
                }
            }
        }
    }

    fn json_request<B: Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        path: &str,
        query: Vec<(String, String)>,
        body: &B,
    ) -> Result<HttpRequest> {
        let payload =
            serde_json::to_string(body).map_err(|e| OpaError::Serialization(e.to_string()))?;
        self.build_request(method, path, query, Some((JSON, payload)))
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// `true` when the server reports itself healthy.
    pub fn check_health(&self, options: &HealthOptions, retries: Option<u32>) -> Result<bool> {
        let request = self.build_check_health(options)?;
        self.parse_check_health(self.execute(&request, retries)?)
    }

    /// Evaluate `system.health.<rule>`. A missing rule and a false rule both
    /// yield `false`.
    pub fn check_custom_health_rule(&self, rule: &str) -> Result<bool> {
        let request = self.build_check_custom_health_rule(rule)?;
        self.parse_check_health(self.execute(&request, None)?)
    }

    pub fn check_liveness(&self) -> Result<bool> {
        self.check_custom_health_rule("live")
    }

    pub fn check_readiness(&self) -> Result<bool> {
        self.check_custom_health_rule("ready")
    }

    pub fn build_check_health(&self, options: &HealthOptions) -> Result<HttpRequest> {
        let mut query = Vec::new();
        if options.bundles {
            query.push(("bundles".to_string(), "true".to_string()));
        }
        if options.plugins {
            query.push(("plugins".to_string(), "true".to_string()));
        }
        for plugin in &options.exclude_plugins {
            query.push(("exclude-plugins".to_string(), plugin.clone()));
        }
        self.build_request(HttpMethod::Get, "/health", query, None)
    }

    pub fn build_check_custom_health_rule(&self, rule: &str) -> Result<HttpRequest> {
        if rule.is_empty() || rule.contains(['/', '.']) {
            return Err(OpaError::InvalidRuleName(rule.to_string()));
        }
        self.build_request(HttpMethod::Get, &format!("/health/{rule}"), Vec::new(), None)
    }

    /// Healthy means a 2xx with an empty or falsy body. Problems are
    /// reported as structured content, so a non-empty body is unhealthy.
    pub fn parse_check_health(&self, response: HttpResponse) -> Result<bool> {
        check_auth(&response)?;
        if !response.is_success() {
            return Ok(false);
        }
        Ok(match response.json() {
            Ok(None) => true,
            Ok(Some(report)) => is_falsy(&report),
            Err(_) => false,
        })
    }

    // -----------------------------------------------------------------------
    // Policy evaluation
    // -----------------------------------------------------------------------

    /// Evaluate the policy at `package` (dotted, may end in a rule name).
    ///
    /// Returns the decision's `result`, or the whole envelope when
    /// `options.effective_raw()` holds.
    pub fn check_policy(
        &self,
        package: &str,
        input: Option<&Value>,
        options: &PolicyOptions,
    ) -> Result<Value> {
        let request = self.build_check_policy(package, input, options)?;
        self.parse_check_policy(package, options, self.execute(&request, None)?)
    }

    pub fn build_check_policy(
        &self,
        package: &str,
        input: Option<&Value>,
        options: &PolicyOptions,
    ) -> Result<HttpRequest> {
        let mut query = Vec::new();
        if options.pretty {
            query.push(("pretty".to_string(), "true".to_string()));
        }
        if options.provenance {
            query.push(("provenance".to_string(), "true".to_string()));
        }
        if options.instrument {
            query.push(("instrument".to_string(), "true".to_string()));
        }
        if options.strict {
            query.push((self.strict_param.as_str().to_string(), "true".to_string()));
        }
        if let Some(explain) = options.explain {
            query.push(("explain".to_string(), explain.as_str().to_string()));
        }
        if options.metrics {
            query.push(("metrics".to_string(), "true".to_string()));
        }
        self.json_request(
            HttpMethod::Post,
            &self.data_path(package)?,
            query,
            &EvaluationRequest { input },
        )
    }

    pub fn parse_check_policy(
        &self,
        package: &str,
        options: &PolicyOptions,
        response: HttpResponse,
    ) -> Result<Value> {
        check_auth(&response)?;
        if !response.is_success() {
            return Err(OpaError::PolicyRequest(response.error_body()));
        }
        let decision = decode(&response)?;
        if options.effective_raw() {
            return Ok(decision);
        }
        // The server answers 200 with no `result` when nothing is defined at
        // the path.
        take_result(decision)
            .ok_or_else(|| OpaError::PolicyNotFound(format!("no policy matching '{package}'")))
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Create or replace the document at `package`.
    pub fn save_document<D: Serialize + ?Sized>(&self, package: &str, data: &D) -> Result<()> {
        let request = self.build_save_document(package, data)?;
        self.parse_save_document(self.execute(&request, None)?)
    }

    /// The full data tree.
    pub fn list_documents(&self) -> Result<Value> {
        let request = self.build_list_documents()?;
        self.parse_list_documents(self.execute(&request, None)?)
    }

    pub fn get_document(&self, package: &str) -> Result<Value> {
        let request = self.build_get_document(package)?;
        self.parse_get_document(package, self.execute(&request, None)?)
    }

    pub fn delete_document(&self, package: &str) -> Result<()> {
        let request = self.build_delete_document(package)?;
        self.parse_delete_document(package, self.execute(&request, None)?)
    }

    pub fn build_save_document<D: Serialize + ?Sized>(
        &self,
        package: &str,
        data: &D,
    ) -> Result<HttpRequest> {
        self.json_request(HttpMethod::Put, &self.data_path(package)?, Vec::new(), data)
    }

    pub fn build_list_documents(&self) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Get, "/v1/data", Vec::new(), None)
    }

    pub fn build_get_document(&self, package: &str) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Get, &self.data_path(package)?, Vec::new(), None)
    }

    pub fn build_delete_document(&self, package: &str) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Delete, &self.data_path(package)?, Vec::new(), None)
    }

    pub fn parse_save_document(&self, response: HttpResponse) -> Result<()> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => Ok(()),
            400 => Err(OpaError::InvalidDocument(response.error_body())),
            s => Err(OpaError::unexpected_status("unable to save document", s)),
        }
    }

    pub fn parse_list_documents(&self, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        if !response.is_success() {
            return Err(OpaError::unexpected_status("unable to list documents", response.status));
        }
        Ok(take_result(decode(&response)?).unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// A `result` key holding `null` is a document; a missing key is not.
    pub fn parse_get_document(&self, package: &str, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        if !response.is_success() {
            return Err(OpaError::unexpected_status("unable to get document", response.status));
        }
        take_result(decode(&response)?)
            .ok_or_else(|| OpaError::DocumentNotFound(format!("no document at '{package}'")))
    }

    pub fn parse_delete_document(&self, package: &str, response: HttpResponse) -> Result<()> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => Ok(()),
            404 => Err(OpaError::DocumentNotFound(format!("no document at '{package}'"))),
            s => Err(OpaError::unexpected_status("unable to delete document", s)),
        }
    }

    // -----------------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------------

    pub fn list_policies(&self) -> Result<Vec<Policy>> {
        let request = self.build_list_policies()?;
        self.parse_list_policies(self.execute(&request, None)?)
    }

    pub fn get_policy(&self, id: &str) -> Result<Policy> {
        let request = self.build_get_policy(id)?;
        self.parse_get_policy(self.execute(&request, None)?)
    }

    /// Evaluate the server's default decision (`POST /`).
    pub fn get_default_policy(&self) -> Result<Value> {
        let request = self.build_get_default_policy()?;
        self.parse_get_default_policy(self.execute(&request, None)?)
    }

    /// Upload policy source. A module that fails to compile, or conflicts
    /// with modules already loaded, is `InvalidPolicy`.
    pub fn save_policy(&self, id: &str, source: &str) -> Result<Value> {
        let request = self.build_save_policy(id, source)?;
        self.parse_save_policy(self.execute(&request, None)?)
    }

    pub fn delete_policy(&self, id: &str) -> Result<Value> {
        let request = self.build_delete_policy(id)?;
        self.parse_delete_policy(self.execute(&request, None)?)
    }

    pub fn build_list_policies(&self) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Get, "/v1/policies", Vec::new(), None)
    }

    pub fn build_get_policy(&self, id: &str) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Get, &self.policy_path(id)?, Vec::new(), None)
    }

    pub fn build_get_default_policy(&self) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Post, "/", Vec::new(), None)
    }

    /// The source goes over the wire as-is, not wrapped in JSON.
    pub fn build_save_policy(&self, id: &str, source: &str) -> Result<HttpRequest> {
        self.build_request(
            HttpMethod::Put,
            &self.policy_path(id)?,
            Vec::new(),
            Some((TEXT, source.to_string())),
        )
    }

    pub fn build_delete_policy(&self, id: &str) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Delete, &self.policy_path(id)?, Vec::new(), None)
    }

    pub fn parse_list_policies(&self, response: HttpResponse) -> Result<Vec<Policy>> {
        check_auth(&response)?;
        if !response.is_success() {
            return Err(OpaError::unexpected_status("unable to list policies", response.status));
        }
        let result = take_result(decode(&response)?)
            .ok_or_else(|| OpaError::Connection("policy listing without `result`".into()))?;
        serde_json::from_value(result).map_err(|e| malformed("policy listing", e))
    }

    pub fn parse_get_policy(&self, response: HttpResponse) -> Result<Policy> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => {
                let result = take_result(decode(&response)?)
                    .ok_or_else(|| OpaError::Connection("policy without `result`".into()))?;
                serde_json::from_value(result).map_err(|e| malformed("policy", e))
            }
            404 => Err(OpaError::PolicyNotFound(response.error_body().to_string())),
            s => Err(OpaError::unexpected_status("unable to get policy", s)),
        }
    }

    pub fn parse_get_default_policy(&self, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => decode(&response),
            404 => Err(OpaError::PolicyNotFound(response.error_body().to_string())),
            s => Err(OpaError::unexpected_status("unable to get default policy", s)),
        }
    }

    pub fn parse_save_policy(&self, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => decode(&response),
            400 => Err(OpaError::InvalidPolicy(response.error_body())),
            s => Err(OpaError::unexpected_status("unable to save policy", s)),
        }
    }

    pub fn parse_delete_policy(&self, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => decode(&response),
            404 => Err(OpaError::PolicyNotFound(response.error_body().to_string())),
            s => Err(OpaError::unexpected_status("unable to delete policy", s)),
        }
    }

    // -----------------------------------------------------------------------
    // Query and config
    // -----------------------------------------------------------------------

    /// Run an ad-hoc query. The returned body's `result` is a list of
    /// variable bindings, one object per solution.
    pub fn query(&self, query: &str, input: &Value, options: &QueryOptions) -> Result<Value> {
        let request = self.build_query(query, input, options)?;
        self.parse_query(self.execute(&request, None)?)
    }

    pub fn get_config(&self) -> Result<Value> {
        let request = self.build_get_config()?;
        self.parse_get_config(self.execute(&request, None)?)
    }

    pub fn build_query(
        &self,
        query: &str,
        input: &Value,
        options: &QueryOptions,
    ) -> Result<HttpRequest> {
        let mut params = Vec::new();
        if options.pretty {
            params.push(("pretty".to_string(), "true".to_string()));
        }
        if let Some(explain) = options.explain {
            params.push(("explain".to_string(), explain.as_str().to_string()));
        }
        if options.metrics {
            params.push(("metrics".to_string(), "true".to_string()));
        }
        self.json_request(
            HttpMethod::Post,
            "/v1/query",
            params,
            &QueryRequest { query, input },
        )
    }

    pub fn build_get_config(&self) -> Result<HttpRequest> {
        self.build_request(HttpMethod::Get, "/v1/config", Vec::new(), None)
    }

    pub fn parse_query(&self, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        match response.status {
            s if (200..300).contains(&s) => decode(&response),
            400 => Err(OpaError::InvalidPolicy(response.error_body())),
            s => Err(OpaError::unexpected_status("unable to evaluate query", s)),
        }
    }

    pub fn parse_get_config(&self, response: HttpResponse) -> Result<Value> {
        check_auth(&response)?;
        if !response.is_success() {
            return Err(OpaError::unexpected_status("unable to get configuration", response.status));
        }
        take_result(decode(&response)?)
            .ok_or_else(|| OpaError::Connection("configuration without `result`".into()))
    }

    /// `/v1/data/<package as path>`, each segment percent-encoded so `?` and
    /// `#` stay in the path.
    fn data_path(&self, package: &str) -> Result<String> {
        let package = package_path(package);
        self.segment_path(["v1", "data"].into_iter().chain(package.split('/')))
    }

    fn policy_path(&self, id: &str) -> Result<String> {
        self.segment_path(["v1", "policies", id])
    }

    fn segment_path<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<String> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| OpaError::InvalidUrl(format!("{} cannot carry a path", self.base_url)))?
            .clear()
            .extend(segments);
        Ok(url.path().to_string())
    }
}


fn check_auth(response: &HttpResponse) -> Result<()> {
    if response.status == 401 {
        return Err(OpaError::Unauthorized(response.error_body()));
    }
    Ok(())
}

/// Decode a success body. An empty body is `null`; anything that is not
/// JSON is a `Connection` error like any other failed exchange.
fn decode(response: &HttpResponse) -> Result<Value> {
    response
        .json()
        .map(Option::unwrap_or_default)
        .map_err(|e| malformed("response body", e))
}

fn malformed(what: &str, err: serde_json::Error) -> OpaError {
    OpaError::Connection(format!("malformed {what} from policy server: {err}"))
}

/// Pull `result` out of a response envelope. `None` when the key is absent,
/// even if other keys are present.
fn take_result(envelope: Value) -> Option<Value> {
    match envelope {
        Value::Object(mut map) => map.remove("result"),
        _ => None,
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

//! HTTP request and response values exchanged with a `Transport`.
//!
//! # Design
//! Requests and responses are plain data. `OpaClient::build_*` methods
//! produce an `HttpRequest` and `OpaClient::parse_*` methods consume an
//! `HttpResponse`; only the `Transport` touches the network. Every request is
//! built from scratch per call, so concurrent callers never share header or
//! body state.
//!
//! `url` is the fully joined target without a query string. Query parameters
//! stay in `query` as ordered pairs so they can be compared in tests and
//! encoded by the transport.

use serde_json::Value;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON. An empty body decodes to `None`.
    pub fn json(&self) -> Result<Option<Value>, serde_json::Error> {
        if self.body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.body).map(Some)
    }

    /// Decode the body for inclusion in an error. Anything that is not JSON
    /// is kept verbatim as a JSON string.
    pub fn error_body(&self) -> Value {
        match self.json() {
            Ok(Some(value)) => value,
            Ok(None) => Value::Null,
            Err(_) => Value::String(self.body.clone()),
        }
    }
}

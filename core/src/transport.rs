//! The only code that performs network I/O.
//!
//! # Design
//! `Transport` executes one `HttpRequest` and hands back the response as
//! data, whatever its status. It does not retry; `OpaClient::execute` owns
//! the retry loop so every transport gets the same policy. Failures are
//! split into `Connect` (worth retrying) and `Fatal` (not).

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;
use ureq::tls::TlsConfig;
use ureq::Agent;

use crate::http::{HttpMethod, HttpRequest, HttpResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS lookup, connect, or reset. Retried by the client.
    #[error("{0}")]
    Connect(String),
    /// Anything a retry will not fix: timeouts, TLS, malformed requests.
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connect(_))
    }
}

/// Executes a single HTTP exchange.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking transport backed by a pooled `ureq` agent.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration, verify: bool) -> Self {
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .tls_config(TlsConfig::builder().disable_verification(!verify).build())
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let result = match request.method {
            HttpMethod::Get | HttpMethod::Delete => {
                let mut builder = if request.method == HttpMethod::Get {
                    self.agent.get(&request.url)
                } else {
                    self.agent.delete(&request.url)
                };
                for (key, value) in &request.query {
                    builder = builder.query(key.as_str(), value.as_str());
                }
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder.call()
            }
            HttpMethod::Post | HttpMethod::Put => {
                let mut builder = if request.method == HttpMethod::Post {
                    self.agent.post(&request.url)
                } else {
                    self.agent.put(&request.url)
                };
                for (key, value) in &request.query {
                    builder = builder.query(key.as_str(), value.as_str());
                }
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                match &request.body {
                    Some(body) => builder.send(body.as_bytes()),
                    None => builder.send_empty(),
                }
            }
        };

        let mut response = result.map_err(|e| classify(request.method, e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| classify(request.method, e))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// A refused connection never reached the server, so it is retried for any
/// method. Other I/O failures may strike after the server got the request
/// and are only retried for methods that are safe to repeat.
fn classify(method: HttpMethod, err: ureq::Error) -> TransportError {
    match &err {
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => {
            TransportError::Connect(err.to_string())
        }
        ureq::Error::Io(io)
            if matches!(io.kind(), ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable) =>
        {
            TransportError::Connect(err.to_string())
        }
        ureq::Error::Io(_) if method != HttpMethod::Post => TransportError::Connect(err.to_string()),
        _ => TransportError::Fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_error(kind: ErrorKind) -> ureq::Error {
        ureq::Error::Io(io::Error::new(kind, "simulated"))
    }

    #[test]
    fn connect_failures_are_retryable_for_every_method() {
        for method in [HttpMethod::Get, HttpMethod::Post, HttpMethod::Put, HttpMethod::Delete] {
            assert!(classify(method, ureq::Error::HostNotFound).is_retryable());
            assert!(classify(method, ureq::Error::ConnectionFailed).is_retryable());
            assert!(classify(method, io_error(ErrorKind::ConnectionRefused)).is_retryable());
        }
    }

    #[test]
    fn reset_mid_exchange_is_not_retried_for_post() {
        let reset = || io_error(ErrorKind::ConnectionReset);
        assert!(!classify(HttpMethod::Post, reset()).is_retryable());
        assert!(classify(HttpMethod::Get, reset()).is_retryable());
        assert!(classify(HttpMethod::Put, reset()).is_retryable());
        assert!(classify(HttpMethod::Delete, reset()).is_retryable());
    }

    #[test]
    fn malformed_requests_are_fatal() {
        let err = classify(HttpMethod::Get, ureq::Error::BadUri("no host".to_string()));
        assert!(matches!(err, TransportError::Fatal(_)));
    }
}

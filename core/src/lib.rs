//! Blocking client for a policy-decision server's REST API.
//!
//! # Overview
//! Wraps policy CRUD, data document CRUD, policy evaluation, ad-hoc queries,
//! health checks and configuration retrieval. The client performs no policy
//! logic; it shapes requests and maps responses and status codes onto typed
//! results and `OpaError` variants.
//!
//! # Design
//! - `OpaClient` holds only immutable configuration and a `Transport`; all
//!   request state is built fresh per call.
//! - Each operation is split into `build_*` (produces an `HttpRequest`) and
//!   `parse_*` (consumes an `HttpResponse`), so URL joining, query mapping and
//!   status interpretation are testable without a server.
//! - Retries for connection failures live in one place, `OpaClient::execute`,
//!   driven by a `RetryPolicy`.
//!
//! ```no_run
//! use opa_client::{ClientConfig, OpaClient, PolicyOptions};
//! use serde_json::json;
//!
//! # fn main() -> opa_client::Result<()> {
//! let client = OpaClient::new(ClientConfig::new("localhost:8181"))?;
//! let allowed = client.check_policy(
//!     "authz.allow",
//!     Some(&json!({"user": "alice"})),
//!     &PolicyOptions::default(),
//! )?;
//! # let _ = allowed;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::OpaClient;
pub use config::{ClientConfig, StrictParam};
pub use error::{OpaError, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use retry::RetryPolicy;
pub use transport::{Transport, TransportError, UreqTransport};
pub use types::{Explain, HealthOptions, Policy, PolicyOptions, QueryOptions};

//! Option sets and value shapes for the policy server API.
//!
//! # Design
//! Decisions, documents, config and query results are arbitrary JSON and are
//! returned as `serde_json::Value`. Only the policy module listing has a
//! stable enough shape to deserialize into a struct.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Level of detail for evaluation explanations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Explain {
    Notes,
    Fails,
    Full,
    Debug,
}

impl Explain {
    pub fn as_str(self) -> &'static str {
        match self {
            Explain::Notes => "notes",
            Explain::Fails => "fails",
            Explain::Full => "full",
            Explain::Debug => "debug",
        }
    }
}

/// Flags for `OpaClient::check_policy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOptions {
    /// Return the whole response envelope instead of its `result`.
    pub raw: bool,
    pub pretty: bool,
    pub provenance: bool,
    pub instrument: bool,
    /// Treat built-in function errors as fatal.
    pub strict: bool,
    pub explain: Option<Explain>,
    pub metrics: bool,
}

impl PolicyOptions {
    /// Whether the caller gets the envelope back. Provenance, instrumentation,
    /// explanations and metrics live next to `result`, so asking for any of
    /// them implies `raw`.
    pub fn effective_raw(&self) -> bool {
        self.raw || self.provenance || self.instrument || self.explain.is_some() || self.metrics
    }
}

/// Flags for `OpaClient::check_health`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthOptions {
    /// Also require all bundles to be activated.
    pub bundles: bool,
    /// Also require all plugins to be in OK state.
    pub plugins: bool,
    /// Plugins ignored by the plugin check.
    pub exclude_plugins: Vec<String>,
}

/// Flags for `OpaClient::query`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub pretty: bool,
    pub explain: Option<Explain>,
    pub metrics: bool,
}

/// A policy module stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default)]
    pub ast: Value,
}

/// Request body for policy evaluation. `input` is left out entirely when
/// there is none.
#[derive(Debug, Serialize)]
pub(crate) struct EvaluationRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryRequest<'a> {
    pub query: &'a str,
    pub input: &'a Value,
}

//! In-memory stand-in for a policy-decision server's REST API.
//!
//! Serves the same paths, status codes and body shapes the client relies on:
//! the data API answers 200 with `{}` for undefined documents, the policy API
//! uses 404, compile failures are 400 with an `errors` list, and a configured
//! bearer token turns every unauthenticated request into a 401.
//!
//! Policies use the small constant-rule dialect in [`module`]; their rules
//! are merged into the data tree so they can be evaluated like documents.

pub mod module;
pub mod query;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};

use crate::module::{multiple_defaults, CompileError, Module};

/// Server options. The default is an open server.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub token: Option<String>,
    /// Plugins reported by `/health?plugins=true` unless excluded.
    pub degraded_plugins: Vec<String>,
}

impl MockConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_degraded_plugin(mut self, name: impl Into<String>) -> Self {
        self.degraded_plugins.push(name.into());
        self
    }
}

#[derive(Debug, Clone)]
struct StoredPolicy {
    raw: String,
    module: Module,
}

#[derive(Debug)]
pub struct Store {
    documents: Value,
    policies: BTreeMap<String, StoredPolicy>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            documents: Value::Object(Map::new()),
            policies: BTreeMap::new(),
        }
    }
}

impl Store {
    /// Documents with every policy rule merged in. Rules override
    /// documents; defaults only fill undefined paths.
    fn data(&self) -> Value {
        let mut data = self.documents.clone();
        for StoredPolicy { module, .. } in self.policies.values() {
            for rule in module.rules.iter().filter(|r| !r.default) {
                insert(&mut data, &rule_path(module, &rule.name), rule.value.clone());
            }
        }
        for StoredPolicy { module, .. } in self.policies.values() {
            for rule in module.rules.iter().filter(|r| r.default) {
                let path = rule_path(module, &rule.name);
                if lookup(&data, &path).is_none() {
                    insert(&mut data, &path, rule.value.clone());
                }
            }
        }
        data
    }
}

pub type Db = Arc<RwLock<Store>>;

#[derive(Clone)]
struct AppState {
    db: Db,
    token: Option<Arc<str>>,
    degraded_plugins: Arc<[String]>,
}

pub fn app() -> Router {
    app_with(MockConfig::default())
}

pub fn app_with(config: MockConfig) -> Router {
    let state = AppState {
        db: Arc::new(RwLock::new(Store::default())),
        token: config.token.map(Arc::from),
        degraded_plugins: config.degraded_plugins.into(),
    };
    Router::new()
        .route("/", post(default_decision))
        .route("/health", get(health))
        .route("/health/{rule}", get(health_rule))
        .route("/v1/data", get(list_documents))
        .route(
            "/v1/data/{*path}",
            get(get_document)
                .put(put_document)
                .post(evaluate)
                .delete(delete_document),
        )
        .route("/v1/policies", get(list_policies))
        .route(
            "/v1/policies/{id}",
            get(get_policy).put(put_policy).delete(delete_policy),
        )
        .route("/v1/query", post(run_query))
        .route("/v1/config", get(get_config))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with(listener, MockConfig::default()).await
}

pub async fn run_with(listener: TcpListener, config: MockConfig) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with(config)).await
}

/// Walk `path` through objects (by key) and arrays (by index).
pub fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set `value` at `path`, replacing anything in the way with objects.
fn insert(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for segment in parents {
        node = as_object(node)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(node).insert(last.clone(), value);
}

fn remove(root: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut node = root;
    for segment in parents {
        match node {
            Value::Object(map) => match map.get_mut(segment) {
                Some(child) => node = child,
                None => return false,
            },
            _ => return false,
        }
    }
    match node {
        Value::Object(map) => map.remove(last).is_some(),
        _ => false,
    }
}

fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}

fn rule_path(module: &Module, rule: &str) -> Vec<String> {
    module
        .package
        .iter()
        .cloned()
        .chain(std::iter::once(rule.to_string()))
        .collect()
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params.get(name).is_some_and(|v| v != "false")
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({"code": code, "message": message.into()}))).into_response()
}

fn compile_error(id: &str, err: CompileError) -> Response {
    let body = json!({
        "code": "invalid_parameter",
        "message": "error(s) occurred while compiling module(s)",
        "errors": [{
            "code": err.code,
            "message": err.message,
            "location": {"file": id, "row": err.row},
        }],
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn parse_json(body: &Bytes) -> Result<Option<Value>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body).map(Some).map_err(|e| {
        error(
            StatusCode::BAD_REQUEST,
            "invalid_parameter",
            format!("body contains malformed JSON: {e}"),
        )
    })
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    tracing::debug!(method = %request.method(), uri = %request.uri(), "request");
    if let Some(token) = &state.token {
        let expected = format!("Bearer {token}");
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "request rejected by administrative policy",
            );
        }
    }
    next.run(request).await
}

// --- health ---

/// `{}` when healthy. With `plugins=true`, degraded plugins that are not
/// listed in `exclude-plugins` are reported in the body.
async fn health(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Json<Value> {
    let checks_plugins = params.iter().any(|(k, v)| k == "plugins" && v != "false");
    if !checks_plugins {
        return Json(json!({}));
    }
    let degraded: Vec<&String> = state
        .degraded_plugins
        .iter()
        .filter(|name| !params.iter().any(|(k, v)| k == "exclude-plugins" && v == *name))
        .collect();
    if degraded.is_empty() {
        Json(json!({}))
    } else {
        Json(json!({"degraded_plugins": degraded}))
    }
}

async fn health_rule(State(state): State<AppState>, Path(rule): Path<String>) -> Response {
    let store = state.db.read().await;
    let path = segments(&format!("system/health/{rule}"));
    if lookup(&store.data(), &path) == Some(&Value::Bool(true)) {
        return Json(json!({})).into_response();
    }
    error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        format!("health check (data.system.health.{rule}) was undefined or false"),
    )
}

// --- data ---

async fn list_documents(State(state): State<AppState>) -> Json<Value> {
    let store = state.db.read().await;
    Json(json!({"result": store.data()}))
}

async fn get_document(State(state): State<AppState>, Path(path): Path<String>) -> Json<Value> {
    let store = state.db.read().await;
    match lookup(&store.data(), &segments(&path)) {
        Some(value) => Json(json!({"result": value})),
        None => Json(json!({})),
    }
}

async fn put_document(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    let value = match parse_json(&body) {
        Ok(Some(value)) => value,
        Ok(None) => {
            return error(StatusCode::BAD_REQUEST, "invalid_parameter", "request body is empty")
        }
        Err(response) => return response,
    };
    let mut store = state.db.write().await;
    insert(&mut store.documents, &segments(&path), value);
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_document(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let mut store = state.db.write().await;
    if remove(&mut store.documents, &segments(&path)) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error(
            StatusCode::NOT_FOUND,
            "resource_not_found",
            format!("storage_not_found_error: /{path}: document does not exist"),
        )
    }
}

async fn evaluate(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Err(response) = parse_json(&body) {
        return response;
    }
    let explain = params.get("explain").map(String::as_str);
    if let Some(level) = explain {
        if !matches!(level, "notes" | "fails" | "full" | "debug") {
            return error(
                StatusCode::BAD_REQUEST,
                "invalid_parameter",
                format!("unknown explain mode {level:?}"),
            );
        }
    }

    let store = state.db.read().await;
    let mut envelope = Map::new();
    if let Some(result) = lookup(&store.data(), &segments(&path)) {
        envelope.insert("result".to_string(), result.clone());
    }
    if flag(&params, "metrics") || flag(&params, "instrument") {
        envelope.insert(
            "metrics".to_string(),
            json!({"timer_rego_query_eval_ns": 1000, "timer_server_handler_ns": 2000}),
        );
    }
    if flag(&params, "provenance") {
        envelope.insert(
            "provenance".to_string(),
            json!({"version": env!("CARGO_PKG_VERSION"), "build_commit": "mock"}),
        );
    }
    if let Some(level) = explain {
        envelope.insert(
            "explanation".to_string(),
            json!([{"op": "eval", "query_id": 0, "mode": level}]),
        );
    }
    Json(Value::Object(envelope)).into_response()
}

async fn default_decision(State(state): State<AppState>) -> Response {
    let store = state.db.read().await;
    let path = segments("system/main");
    match lookup(&store.data(), &path) {
        Some(value) => Json(value.clone()).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            "undefined_document",
            "document missing: data.system.main",
        ),
    }
}

// --- policies ---

fn policy_json(id: &str, policy: &StoredPolicy) -> Value {
    json!({"id": id, "raw": policy.raw, "ast": policy.module.ast()})
}

fn policy_not_found(id: &str) -> Response {
    error(
        StatusCode::NOT_FOUND,
        "resource_not_found",
        format!("storage_not_found_error: policy id {id:?}"),
    )
}

async fn list_policies(State(state): State<AppState>) -> Json<Value> {
    let store = state.db.read().await;
    let result: Vec<Value> = store
        .policies
        .iter()
        .map(|(id, policy)| policy_json(id, policy))
        .collect();
    Json(json!({"result": result}))
}

async fn get_policy(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let store = state.db.read().await;
    match store.policies.get(&id) {
        Some(policy) => Json(json!({"result": policy_json(&id, policy)})).into_response(),
        None => policy_not_found(&id),
    }
}

async fn put_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    raw: String,
) -> Response {
    let module = match Module::parse(&raw) {
        Ok(module) => module,
        Err(err) => return compile_error(&id, err),
    };

    let mut store = state.db.write().await;
    let others: Vec<&Module> = store
        .policies
        .iter()
        .filter(|(other, _)| **other != id)
        .map(|(_, p)| &p.module)
        .collect();
    if let Some(rule) = module.duplicate_default(&others) {
        return compile_error(&id, multiple_defaults(rule));
    }

    let ast = module.ast();
    store.policies.insert(id.clone(), StoredPolicy { raw, module });
    Json(json!({"id": id, "ast": ast})).into_response()
}

async fn delete_policy(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let mut store = state.db.write().await;
    match store.policies.remove(&id) {
        Some(_) => Json(json!({})).into_response(),
        None => policy_not_found(&id),
    }
}

// --- query and config ---

async fn run_query(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let request = match parse_json(&body) {
        Ok(Some(request)) => request,
        Ok(None) => return error(StatusCode::BAD_REQUEST, "invalid_parameter", "missing query"),
        Err(response) => return response,
    };
    let Some(text) = request.get("query").and_then(Value::as_str) else {
        return error(StatusCode::BAD_REQUEST, "invalid_parameter", "missing query");
    };
    let input = request.get("input").cloned().unwrap_or(Value::Null);

    let store = state.db.read().await;
    let rows = match query::evaluate(text, &store.data(), &input) {
        Ok(rows) => rows,
        Err(message) => {
            return error(
                StatusCode::BAD_REQUEST,
                "invalid_parameter",
                format!("rego_parse_error: {message}"),
            )
        }
    };

    let mut envelope = Map::new();
    envelope.insert("result".to_string(), json!(rows));
    if flag(&params, "metrics") {
        envelope.insert("metrics".to_string(), json!({"timer_rego_query_eval_ns": 1000}));
    }
    if let Some(level) = params.get("explain") {
        envelope.insert("explanation".to_string(), json!([{"op": "eval", "mode": level}]));
    }
    Json(Value::Object(envelope)).into_response()
}

async fn get_config() -> Json<Value> {
    Json(json!({
        "result": {
            "labels": {"id": "mock-server", "version": env!("CARGO_PKG_VERSION")},
            "default_decision": "/system/main",
            "default_authorization_decision": "/system/authz/allow",
        }
    }))
}

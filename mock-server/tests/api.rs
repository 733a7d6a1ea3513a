use axum::http::{self, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mock_server::{app, app_with, MockConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn json_request(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .unwrap()
}

fn text_request(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(body.to_string())
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(String::new())
        .unwrap()
}

async fn send(app: &Router, request: Request<String>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

// --- health ---

#[tokio::test]
async fn health_is_empty_object() {
    let app = app();
    let resp = send(&app, empty_request("GET", "/health?bundles=true&plugins=true")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({}));
}

#[tokio::test]
async fn health_reports_degraded_plugins_unless_excluded() {
    let app = app_with(MockConfig::default().with_degraded_plugin("decision_logs"));

    let resp = send(&app, empty_request("GET", "/health")).await;
    assert_eq!(body_json(resp).await, json!({}));

    let resp = send(&app, empty_request("GET", "/health?plugins=true")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"degraded_plugins": ["decision_logs"]}));

    let resp = send(
        &app,
        empty_request("GET", "/health?plugins=true&exclude-plugins=decision_logs"),
    )
    .await;
    assert_eq!(body_json(resp).await, json!({}));
}

#[tokio::test]
async fn health_rule_follows_policy() {
    let app = app();
    let resp = send(&app, empty_request("GET", "/health/live")).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(resp).await["code"], "internal_error");

    let policy = "package system.health\ndefault live = true";
    let resp = send(&app, text_request("PUT", "/v1/policies/liveness", policy)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(&app, empty_request("GET", "/health/live")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({}));
}

// --- data ---

#[tokio::test]
async fn undefined_document_is_empty_object() {
    let app = app();
    let resp = send(&app, empty_request("GET", "/v1/data/nothing/here")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({}));
}

#[tokio::test]
async fn put_malformed_document_returns_400() {
    let app = app();
    let resp = send(&app, json_request("PUT", "/v1/data/a", "{not json")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["code"], "invalid_parameter");
}

#[tokio::test]
async fn delete_missing_document_returns_404() {
    let app = app();
    let resp = send(&app, empty_request("DELETE", "/v1/data/ghost")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["code"], "resource_not_found");
}

#[tokio::test]
async fn evaluate_adds_requested_diagnostics() {
    let app = app();
    let policy = "package opa.test\ndefault allow := false";
    send(&app, text_request("PUT", "/v1/policies/p", policy)).await;

    let resp = send(
        &app,
        json_request("POST", "/v1/data/opa/test/allow?metrics=true&explain=notes", r#"{"input":{}}"#),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["result"], false);
    assert!(body.get("metrics").is_some());
    assert!(body.get("explanation").is_some());
}

#[tokio::test]
async fn evaluate_rejects_unknown_explain_mode() {
    let app = app();
    let resp = send(&app, json_request("POST", "/v1/data/x?explain=everything", "{}")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// --- policies ---

#[tokio::test]
async fn empty_policy_is_rejected() {
    let app = app();
    let resp = send(&app, text_request("PUT", "/v1/policies/empty", "")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["errors"][0]["code"], "rego_parse_error");
    assert_eq!(body["errors"][0]["location"]["file"], "empty");
}

#[tokio::test]
async fn conflicting_default_across_policies_is_rejected() {
    let app = app();
    let resp = send(&app, text_request("PUT", "/v1/policies/one", "package a\ndefault allow = true")).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(&app, text_request("PUT", "/v1/policies/two", "package a\ndefault allow = false")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["errors"][0]["code"], "rego_type_error");

    // replacing the same id is not a conflict
    let resp = send(&app, text_request("PUT", "/v1/policies/one", "package a\ndefault allow = false")).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_policy_returns_404() {
    let app = app();
    let resp = send(&app, empty_request("GET", "/v1/policies/ghost")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = send(&app, empty_request("DELETE", "/v1/policies/ghost")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn default_decision_requires_system_main() {
    let app = app();
    let resp = send(&app, empty_request("POST", "/")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    send(&app, text_request("PUT", "/v1/policies/sys", "package system\nmain := {\"ok\": true}")).await;
    let resp = send(&app, empty_request("POST", "/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"ok": true}));
}

// --- query ---

#[tokio::test]
async fn query_binds_variables() {
    let app = app();
    let body = json!({"query": "name = input.servers.0.name", "input": {"servers": [{"name": "rivendell"}]}});
    let resp = send(&app, json_request("POST", "/v1/query", &body.to_string())).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["result"], json!([{"name": "rivendell"}]));
}

#[tokio::test]
async fn malformed_query_returns_400() {
    let app = app();
    let body = json!({"query": "this is not rego", "input": {}});
    let resp = send(&app, json_request("POST", "/v1/query", &body.to_string())).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// --- config ---

#[tokio::test]
async fn config_reports_labels() {
    let app = app_with(MockConfig::default());
    let resp = send(&app, empty_request("GET", "/v1/config")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["result"]["labels"]["id"], "mock-server");
}

// --- auth ---

#[tokio::test]
async fn token_is_enforced() {
    let app = app_with(MockConfig::default().with_token("secret"));
    let resp = send(&app, empty_request("GET", "/v1/policies")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["code"], "unauthorized");

    let req = Request::builder()
        .uri("/v1/policies")
        .header(http::header::AUTHORIZATION, "Bearer secret")
        .body(String::new())
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

// --- full document lifecycle ---

#[tokio::test]
async fn document_lifecycle() {
    let app = app();

    // put
    let resp = send(&app, json_request("PUT", "/v1/data/servers/prod", r#"["web","db"]"#)).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(body_bytes(resp).await.is_empty());

    // get
    let resp = send(&app, empty_request("GET", "/v1/data/servers/prod")).await;
    assert_eq!(body_json(resp).await, json!({"result": ["web", "db"]}));

    // list
    let resp = send(&app, empty_request("GET", "/v1/data")).await;
    assert_eq!(body_json(resp).await["result"]["servers"]["prod"], json!(["web", "db"]));

    // delete, then delete again
    let resp = send(&app, empty_request("DELETE", "/v1/data/servers/prod")).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = send(&app, empty_request("DELETE", "/v1/data/servers/prod")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

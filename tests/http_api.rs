//! HTTP API of the manager, driven in-process

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tabletloc::coordinator::http::{create_router, ManagerState};
use tabletloc::{Config, Instance};
use tower::ServiceExt;

async fn app() -> Router {
    let mut config = Config::default();
    config.manager.assignment_interval_ms = 20;
    config.admin.wait_timeout_ms = 10_000;
    let instance = Instance::start(config).await.unwrap();
    create_router(ManagerState { instance })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["mode"], "compaction");
    assert_eq!(body["tservers"], 1);
}

#[tokio::test]
async fn test_table_lifecycle() {
    let app = app().await;

    let (status, body) = call(&app, "POST", "/tables/t1", Some(json!({ "splits": ["m"] }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["tablets"], 2);

    let (status, _) = call(&app, "POST", "/tables/t1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(&app, "GET", "/tables", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tables"].as_array().unwrap().len(), 1);

    let (status, _) = call(&app, "POST", "/tables/t1/online?wait=true", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/tables/t1/locations", None).await;
    assert_eq!(status, StatusCode::OK);
    let tablets = body["tablets"].as_array().unwrap();
    assert_eq!(tablets.len(), 2);
    for tablet in tablets {
        assert!(tablet["current"].is_string());
        assert!(tablet["future"].is_null());
        assert!(tablet["last"].is_null());
    }

    let (status, body) = call(
        &app,
        "POST",
        "/tables/t1/rows",
        Some(json!({ "row": "a", "value": "1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let server = body["server"].clone();

    let (status, body) = call(&app, "POST", "/tables/t1/flush?end=m&wait=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tablets"], 1);
    assert_eq!(body["waited"], true);

    let (status, body) = call(&app, "GET", "/tables/t1/location?end=m", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"], server);
    assert_eq!(body["last"], server);

    let (_, body) = call(&app, "GET", "/tables/t1/location?start=m", None).await;
    assert!(body["last"].is_null());

    let (status, _) = call(&app, "POST", "/tables/t1/offline?wait=true", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, "GET", "/tables/t1/location?end=m", None).await;
    assert!(body["current"].is_null());
    assert!(body["future"].is_null());
    assert_eq!(body["last"], server);

    let (status, _) = call(&app, "DELETE", "/tables/t1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", "/tables/t1/locations", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_requests() {
    let app = app().await;

    let (status, body) = call(&app, "POST", "/tables/bad.name", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = call(&app, "GET", "/tables/missing/location", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    call(&app, "POST", "/tables/t2", None).await;
    let (status, _) = call(
        &app,
        "POST",
        "/tables/t2/rows",
        Some(json!({ "row": "r", "value": "v" })),
    )
    .await;
    assert!(status == StatusCode::OK || status == StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_watches_and_properties() {
    let app = app().await;
    call(&app, "POST", "/tables/w", None).await;

    let (status, body) = call(&app, "GET", "/admin/watches", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tables"], 1);
    assert_eq!(body["within_budget"], true);
    assert_eq!(body["processes"].as_array().unwrap().len(), 4);

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/properties/last-location-persistence-mode")
        .body(Body::from("assignment"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (_, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(body["mode"], "assignment");

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/properties/log.level")
        .body(Body::from("debug"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/properties/no.such.key")
        .body(Body::from("x"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

async fn put_property(app: &Router, key: &str, value: &str) -> StatusCode {
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/admin/properties/{}", key))
        .body(Body::from(value.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_runtime_properties_reach_every_role() {
    let app = app().await;
    let key = "tserver.memtable-max-entries";

    let (status, body) = call(&app, "GET", &format!("/admin/properties/{}", key), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "100000");

    assert_eq!(put_property(&app, key, "2").await, StatusCode::OK);
    let (_, body) = call(&app, "GET", &format!("/admin/properties/{}", key), None).await;
    assert_eq!(body["value"], "2");

    assert_eq!(put_property(&app, key, "0").await, StatusCode::BAD_REQUEST);
    assert_eq!(put_property(&app, key, "many").await, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "GET",
        "/admin/properties/last-location-persistence-mode",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "compaction");

    let (status, _) = call(&app, "GET", "/admin/properties/no.such.key", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("tabletloc_active_watches"));
    assert!(text.contains("tabletloc_transitions_total"));
}

//! HTTP API for the manager
//!
//! Table lifecycle, location queries, the wait-capable admin commands and
//! the observability endpoints (watch footprints, metrics).

use crate::common::metrics::METRICS;
use crate::common::{Error, RowRange, TableId};
use crate::instance::Instance;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct ManagerState {
    pub instance: Arc<Instance>,
}

/// Error body `{"error": ...}` with the status the error maps to
pub struct ApiError(StatusCode, String);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e.to_http_status(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn table_id(raw: &str) -> ApiResult<TableId> {
    TableId::new(raw).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct CreateTableRequest {
    #[serde(default)]
    splits: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlushQuery {
    start: Option<String>,
    end: Option<String>,
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    row: String,
    value: String,
}

pub fn create_router(state: ManagerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tables", get(list_tables))
        .route("/tables/:table", post(create_table).delete(delete_table))
        .route("/tables/:table/locations", get(locations))
        .route("/tables/:table/location", get(location))
        .route("/tables/:table/flush", post(flush))
        .route("/tables/:table/online", post(online))
        .route("/tables/:table/offline", post(offline))
        .route("/tables/:table/rows", post(write_row))
        .route("/admin/watches", get(watches))
        .route(
            "/admin/properties/:key",
            get(get_property).put(set_property),
        )
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<ManagerState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "instance": state.instance.config().instance_name,
        "mode": state.instance.mode(),
        "tservers": state.instance.tservers().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_tables(State(state): State<ManagerState>) -> ApiResult<impl IntoResponse> {
    let tables = state.instance.ops().tables()?;
    Ok(Json(json!({ "tables": tables })))
}

async fn create_table(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
    body: Option<Json<CreateTableRequest>>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let tablets = state.instance.create_table(&table, &request.splits).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "table": table, "tablets": tablets })),
    ))
}

async fn delete_table(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    state.instance.delete_table(&table).await?;
    Ok(Json(json!({ "table": table, "deleted": true })))
}

async fn locations(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    let tablets = state.instance.ops().locations(&table)?;
    Ok(Json(json!({ "table": table, "tablets": tablets })))
}

async fn location(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    let range = RowRange::new(query.start, query.end);
    let snapshot = state.instance.ops().location_state(&table, &range)?;
    Ok(Json(snapshot))
}

async fn flush(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
    Query(query): Query<FlushQuery>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    let outcome = state
        .instance
        .ops()
        .flush(&table, query.start.as_deref(), query.end.as_deref(), query.wait)
        .await?;
    Ok(Json(outcome))
}

async fn online(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    state.instance.ops().set_online(&table, query.wait).await?;
    Ok(Json(json!({ "table": table, "goal": "online", "waited": query.wait })))
}

async fn offline(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    state.instance.ops().set_offline(&table, query.wait).await?;
    Ok(Json(json!({ "table": table, "goal": "offline", "waited": query.wait })))
}

async fn write_row(
    State(state): State<ManagerState>,
    Path(table): Path<String>,
    Json(request): Json<WriteRequest>,
) -> ApiResult<impl IntoResponse> {
    let table = table_id(&table)?;
    let server = state
        .instance
        .ops()
        .write(&table, request.row, request.value.into_bytes())
        .await?;
    Ok(Json(json!({ "table": table, "server": server })))
}

async fn watches(State(state): State<ManagerState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.instance.watch_summary().await?))
}

async fn get_property(
    State(state): State<ManagerState>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let value = state.instance.property(&key)?;
    Ok(Json(json!({ "property": key, "value": value })))
}

async fn set_property(
    State(state): State<ManagerState>,
    Path(key): Path<String>,
    value: String,
) -> ApiResult<impl IntoResponse> {
    state.instance.set_property(&key, value.trim()).await?;
    Ok(Json(json!({ "property": key, "value": value.trim() })))
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

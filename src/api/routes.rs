//! API route definitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::error;

use super::state::AppState;
use crate::storage::StoreError;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/canary", get(canary))
        .route("/tests", get(list_tests))
        .route("/tests/ongoing", get(list_ongoing_tests))
        .route("/tests/{id}", get(find_test))
        .route("/metrics", get(metrics))
}

/// Failure of a store query, rendered as a JSON error body.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "store query failed");
        let status = match e {
            StoreError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn canary(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "name": state.canary.name,
            "tests": state.tests.as_slice(),
        },
        "meta": { "total": state.tests.len() }
    }))
}

async fn list_tests(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut runs = state.store.list_tests()?;
    runs.sort_by(|a, b| b.start_at.cmp(&a.start_at).then_with(|| a.id.cmp(&b.id)));
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

async fn list_ongoing_tests(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let runs = state.store.list_ongoing_tests()?;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

async fn find_test(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let run = match state.store.find_test_by_id(&id)? {
        Some(run) => run,
        None => state.store.load_test(&id)?.ok_or_else(|| ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("no test run with id {id:?}"),
        })?,
    };
    let ongoing = run.is_ongoing();
    Ok(Json(json!({ "data": run, "meta": { "ongoing": ongoing } })))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.metrics.snapshot();
    Json(json!({ "data": snapshot, "meta": { "tests": snapshot.len() } }))
}

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::Value;
use tracing::debug;

use graphex_core::RunId;
use graphex_graph::GraphDocument;

use crate::api::{self, ApiError, SubmitRequest};
use crate::connection;
use crate::state::AppState;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bind": state.config.bind,
        "node_types": state.registry.len(),
    }))
}

// GET /api/node-types
pub async fn list_node_types(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(api::node_types(&state))
}

// POST /api/graphs/validate
pub async fn validate_graph(
    State(state): State<Arc<AppState>>,
    Json(doc): Json<GraphDocument>,
) -> Result<Json<Value>, ApiError> {
    let validated = api::validate_graph(&state, &doc)?;
    Ok(Json(api::validation_report(&validated)))
}

// GET /api/runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(api::list_runs(&state))
}

// POST /api/runs
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run_id = api::submit(&state, body)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id })),
    ))
}

// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    api::run_state(&state, &RunId::from_string(&id)).map(Json)
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    api::cancel(&state, &RunId::from_string(&id)).map(Json)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("WebSocket upgrade");
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state))
}

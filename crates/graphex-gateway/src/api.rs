//! Operations shared by the REST routes and the WebSocket methods.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use graphex_core::node::NodeValues;
use graphex_core::{
    EngineError, ErrorKind, GraphexError, RunId, StructuralError, SubmitError, ValidationError,
};
use graphex_graph::{validate_with, GraphDocument, ValidatedGraph};

use crate::state::AppState;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_PARAMS: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INTERNAL_ERROR: i32 = -32603;
pub const GRAPH_REJECTED: i32 = -32001;
pub const SUBMIT_REJECTED: i32 = -32002;
pub const RUN_NOT_FOUND: i32 = -32004;

/// Error returned to a client, over either transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            kind: ErrorKind::Json,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl std::fmt::Display) -> Self {
        Self {
            code: PARSE_ERROR,
            kind: ErrorKind::Json,
            message: format!("Parse error: {}", message),
        }
    }

    pub fn internal() -> Self {
        Self {
            code: INTERNAL_ERROR,
            kind: ErrorKind::RunFatal,
            message: "Internal error".to_string(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            kind: ErrorKind::NotFound,
            message: format!("Unknown method: {}", method),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            PARSE_ERROR | INVALID_PARAMS | SUBMIT_REJECTED => StatusCode::BAD_REQUEST,
            GRAPH_REJECTED => StatusCode::UNPROCESSABLE_ENTITY,
            RUN_NOT_FOUND | METHOD_NOT_FOUND => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GraphexError> for ApiError {
    fn from(e: GraphexError) -> Self {
        let kind = e.kind();
        let code = match kind {
            ErrorKind::Structural
            | ErrorKind::CycleDetected
            | ErrorKind::UnsatisfiedInput
            | ErrorKind::TypeMismatch => GRAPH_REJECTED,
            ErrorKind::InvalidSubmission => SUBMIT_REJECTED,
            ErrorKind::NotFound => RUN_NOT_FOUND,
            ErrorKind::Json => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self {
            code,
            kind,
            message: e.to_string(),
        }
    }
}

macro_rules! via_graphex_error {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ApiError {
            fn from(e: $ty) -> Self {
                GraphexError::from(e).into()
            }
        })*
    };
}

via_graphex_error!(
    StructuralError,
    ValidationError,
    SubmitError,
    EngineError,
    serde_json::Error
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "kind": self.kind,
                "message": self.message,
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

/// Body of a run submission.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub graph: GraphDocument,
    #[serde(default)]
    pub inputs: NodeValues,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct GraphParams {
    pub graph: GraphDocument,
}

#[derive(Debug, Deserialize)]
pub struct RunParams {
    pub run_id: RunId,
}

pub fn params<T: DeserializeOwned>(params: &Value) -> Result<T, ApiError> {
    T::deserialize(params).map_err(|e| ApiError::invalid_params(e.to_string()))
}

/// Build a document against the registered node types and validate it.
pub fn validate_graph(state: &AppState, doc: &GraphDocument) -> Result<ValidatedGraph, ApiError> {
    let graph = doc.build(state.engine.catalog().as_ref())?;
    let validated = validate_with(graph, &state.engine.coercion())?;
    Ok(validated)
}

pub fn validation_report(graph: &ValidatedGraph) -> Value {
    let layers: Vec<_> = graph.topological_layers().collect();
    json!({
        "valid": true,
        "name": graph.name(),
        "node_count": graph.len(),
        "layers": layers,
    })
}

pub fn submit(state: &AppState, request: SubmitRequest) -> Result<RunId, ApiError> {
    let graph = validate_graph(state, &request.graph)?;
    let run_id = state
        .engine
        .submit_run(&graph, request.inputs, request.concurrency)?;
    info!(run_id = %run_id, graph = %graph.name(), "Run submitted via gateway");
    Ok(run_id)
}

pub fn run_state(state: &AppState, run_id: &RunId) -> Result<Value, ApiError> {
    let snapshot = state.engine.snapshot(run_id)?;
    Ok(serde_json::to_value(snapshot)?)
}

pub fn cancel(state: &AppState, run_id: &RunId) -> Result<Value, ApiError> {
    state.engine.cancel_run(run_id)?;
    debug!(run_id = %run_id, "Cancel requested via gateway");
    Ok(json!({"run_id": run_id, "cancelled": true}))
}

pub fn list_runs(state: &AppState) -> Value {
    json!({ "runs": state.engine.list_runs() })
}

pub fn node_types(state: &AppState) -> Value {
    json!({ "node_types": state.registry.definitions() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_kind() {
        let e: ApiError = SubmitError::InvalidConcurrency.into();
        assert_eq!(e.code, SUBMIT_REJECTED);
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);

        let e: ApiError = EngineError::RunNotFound(RunId::from_string("gone")).into();
        assert_eq!(e.kind, ErrorKind::NotFound);
        assert_eq!(e.status(), StatusCode::NOT_FOUND);

        let e: ApiError = StructuralError::DuplicateNode("a".into()).into();
        assert_eq!(e.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_params_reports_missing_fields() {
        let err = params::<RunParams>(&json!({})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(err.message.contains("run_id"));

        let ok: RunParams = params(&json!({"run_id": "abc"})).unwrap();
        assert_eq!(ok.run_id, RunId::from_string("abc"));
    }
}

use serde::{Deserialize, Serialize};

use graphex_core::event::Event;
use graphex_core::{ErrorKind, RunId};
use graphex_engine::RunAnnouncement;

use crate::api::ApiError;

/// A frame sent from the client.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[allow(dead_code)]
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A response frame sent to the client.
#[derive(Debug, Serialize)]
pub struct ServerResponse {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// An event frame pushed to the client.
#[derive(Debug, Serialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub run_id: RunId,
    pub event: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
}

impl ServerResponse {
    pub fn ok(id: String, result: serde_json::Value) -> Self {
        Self {
            frame_type: "response".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, error: ApiError) -> Self {
        Self {
            frame_type: "response".to_string(),
            id,
            result: None,
            error: Some(ErrorPayload {
                code: error.code,
                kind: error.kind,
                message: error.message,
            }),
        }
    }

    pub fn from_result(id: String, result: Result<serde_json::Value, ApiError>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(e) => Self::err(id, e),
        }
    }
}

impl ServerEvent {
    pub fn new(run_id: RunId, event: serde_json::Value) -> Self {
        Self {
            frame_type: "event".to_string(),
            run_id,
            event,
        }
    }

    /// Wrap one event from a run's stream.
    pub fn run_event(event: &Event) -> Self {
        Self::new(
            event.run_id.clone(),
            serde_json::to_value(event).unwrap_or_default(),
        )
    }

    pub fn announcement(announcement: &RunAnnouncement) -> Self {
        let run_id = match announcement {
            RunAnnouncement::RunStarted { run_id, .. }
            | RunAnnouncement::RunFinished { run_id, .. } => run_id.clone(),
        };
        Self::new(run_id, serde_json::to_value(announcement).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphex_core::{EventKind, RunStatus};
    use serde_json::json;

    #[test]
    fn test_client_frame_params_default_to_null() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"request","id":"7","method":"run.list"}"#).unwrap();
        assert_eq!(frame.id, "7");
        assert_eq!(frame.method, "run.list");
        assert!(frame.params.is_null());
    }

    #[test]
    fn test_error_response_shape() {
        let resp = ServerResponse::err("3".into(), ApiError::unknown_method("run.explode"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], "3");
        assert_eq!(value["error"]["code"], -32601);
        assert_eq!(value["error"]["kind"], "not_found");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_run_event_frame() {
        let event = Event::new(
            RunId::from_string("r1"),
            4,
            EventKind::RunFinished {
                status: RunStatus::Cancelled,
            },
        );
        let value = serde_json::to_value(ServerEvent::run_event(&event)).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["event"]["sequence"], 4);
    }

    #[test]
    fn test_announcement_frame() {
        let frame = ServerEvent::announcement(&RunAnnouncement::RunStarted {
            run_id: RunId::from_string("r2"),
            graph_name: "probe".into(),
        });
        let value = serde_json::to_value(frame).unwrap();
        assert_eq!(value["run_id"], "r2");
        assert_eq!(
            value["event"],
            json!({"kind": "run_started", "runId": "r2", "graphName": "probe"})
        );
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use graphex_core::event::EventStream;
use graphex_core::RunId;

use crate::api::{self, ApiError, GraphParams, RunParams, SubmitRequest};
use crate::lane::{LaneQueue, LaneResult};
use crate::protocol::{ClientFrame, ServerEvent, ServerResponse};
use crate::state::AppState;

const OUTBOX_CAPACITY: usize = 256;

/// Handle a single WebSocket connection (axum WebSocket).
pub async fn handle_connection(ws: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Everything written to the socket goes through one outbox
    let (outbox, mut outbox_rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Run lifecycle announcements go to every connection
    let mut announcements = state.engine.subscribe_runs();
    let announce_outbox = outbox.clone();
    let announce_task = tokio::spawn(async move {
        loop {
            match announcements.recv().await {
                Ok(announcement) => {
                    let frame = ServerEvent::announcement(&announcement);
                    if !send_json(&announce_outbox, &frame).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Announcement receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Create a lane for serial request processing
    let (lane, mut lane_rx) = LaneQueue::new(32);
    let mut connection = Connection::new(state, outbox.clone());
    let lane_task = tokio::spawn(async move {
        while let Some(item) = lane_rx.recv().await {
            let result = connection.process_request(&item.method, &item.params);
            let _ = item.respond.send(result);
        }
    });

    // Read incoming frames
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(text.as_str()) {
                    Ok(f) => f,
                    Err(e) => {
                        let resp = ServerResponse::err("0".to_string(), ApiError::parse_error(e));
                        send_json(&outbox, &resp).await;
                        continue;
                    }
                };

                let id = frame.id.clone();
                let resp = match lane.send(frame.method, frame.params).await {
                    Some(result) => ServerResponse::from_result(id, result),
                    None => ServerResponse::err(id, ApiError::internal()),
                };
                send_json(&outbox, &resp).await;
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let _ = outbox.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    announce_task.abort();
    lane_task.abort();
    writer_task.abort();
    debug!("Connection closed");
}

/// Serialize a frame into the outbox. `false` once the socket writer is gone.
async fn send_json<T: Serialize>(outbox: &mpsc::Sender<Message>, frame: &T) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => outbox.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize frame");
            true
        }
    }
}

/// Request state owned by one connection's lane.
struct Connection {
    state: Arc<AppState>,
    outbox: mpsc::Sender<Message>,
    subscriptions: HashMap<RunId, JoinHandle<()>>,
}

impl Connection {
    fn new(state: Arc<AppState>, outbox: mpsc::Sender<Message>) -> Self {
        Self {
            state,
            outbox,
            subscriptions: HashMap::new(),
        }
    }

    fn process_request(&mut self, method: &str, params: &Value) -> LaneResult {
        match method {
            "run.submit" => {
                let subscribe = params["subscribe"].as_bool().unwrap_or(true);
                let request: SubmitRequest = api::params(params)?;
                let run_id = api::submit(&self.state, request)?;
                if subscribe {
                    self.subscribe(&run_id)?;
                }
                Ok(json!({"run_id": run_id, "subscribed": subscribe}))
            }
            "run.cancel" => {
                let RunParams { run_id } = api::params(params)?;
                api::cancel(&self.state, &run_id)
            }
            "run.subscribe" => {
                let RunParams { run_id } = api::params(params)?;
                self.subscribe(&run_id)?;
                Ok(json!({"run_id": run_id, "subscribed": true}))
            }
            "run.unsubscribe" => {
                let RunParams { run_id } = api::params(params)?;
                let removed = self.unsubscribe(&run_id);
                Ok(json!({"run_id": run_id, "unsubscribed": removed}))
            }
            "run.state" => {
                let RunParams { run_id } = api::params(params)?;
                api::run_state(&self.state, &run_id)
            }
            "run.list" => Ok(api::list_runs(&self.state)),
            "graph.validate" => {
                let GraphParams { graph } = api::params(params)?;
                let validated = api::validate_graph(&self.state, &graph)?;
                Ok(api::validation_report(&validated))
            }
            "node_types.list" => Ok(api::node_types(&self.state)),
            _ => {
                warn!(method, "Unknown method");
                Err(ApiError::unknown_method(method))
            }
        }
    }

    /// Forward the run's history and live events to this connection. A run
    /// that is already being forwarded is left alone.
    fn subscribe(&mut self, run_id: &RunId) -> Result<(), ApiError> {
        if let Some(task) = self.subscriptions.get(run_id) {
            if !task.is_finished() {
                return Ok(());
            }
        }
        let events = self.state.engine.subscribe(run_id)?;
        let task = tokio::spawn(forward(events, self.outbox.clone()));
        self.subscriptions.insert(run_id.clone(), task);
        debug!(run_id = %run_id, "Connection subscribed to run");
        Ok(())
    }

    fn unsubscribe(&mut self, run_id: &RunId) -> bool {
        match self.subscriptions.remove(run_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.subscriptions.values() {
            task.abort();
        }
    }
}

async fn forward(mut events: EventStream, outbox: mpsc::Sender<Message>) {
    while let Some(event) = events.recv().await {
        if !send_json(&outbox, &ServerEvent::run_event(&event)).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphex_core::AppConfig;
    use graphex_engine::Engine;
    use graphex_test_utils::{chain, mock_registry, Probe};

    fn setup() -> (Connection, mpsc::Receiver<Message>) {
        let mut config = AppConfig::default();
        config.log.enabled = false;
        let registry = Arc::new(mock_registry(&Probe::new()));
        let state = Arc::new(AppState {
            config: config.gateway.clone(),
            engine: Arc::new(Engine::new(registry.clone(), &config)),
            registry,
        });
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Connection::new(state, outbox), rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Message>) -> Value {
        match rx.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected outbox item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_streams_events_until_finished() {
        let (mut conn, mut rx) = setup();
        let result = conn
            .process_request("run.submit", &json!({"graph": chain(3)}))
            .unwrap();
        let run_id = result["run_id"].as_str().unwrap().to_string();

        let mut sequences = Vec::new();
        loop {
            let frame = next_frame(&mut rx).await;
            assert_eq!(frame["type"], "event");
            assert_eq!(frame["run_id"], run_id.as_str());
            sequences.push(frame["event"]["sequence"].as_u64().unwrap());
            if frame["event"]["kind"] == "run_finished" {
                assert_eq!(frame["event"]["status"], "succeeded");
                break;
            }
        }
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
        assert_eq!(sequences[0], 1);

        let state = conn
            .process_request("run.state", &json!({"run_id": run_id}))
            .unwrap();
        assert_eq!(state["status"], "succeeded");
        assert_eq!(state["nodes"].as_array().unwrap().len(), 3);

        let runs = conn.process_request("run.list", &Value::Null).unwrap();
        assert_eq!(runs["runs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validate_reports_cycle() {
        let (mut conn, _rx) = setup();
        let mut graph = chain(3);
        graph["edges"]
            .as_array_mut()
            .unwrap()
            .push(json!({"from": "s2::value", "to": "s0::value"}));

        let err = conn
            .process_request("graph.validate", &json!({"graph": graph}))
            .unwrap_err();
        assert_eq!(err.code, api::GRAPH_REJECTED);
        assert_eq!(err.kind, graphex_core::ErrorKind::CycleDetected);

        let report = conn
            .process_request("graph.validate", &json!({"graph": chain(3)}))
            .unwrap();
        assert_eq!(report["valid"], true);
        assert_eq!(report["layers"], json!([["s0"], ["s1"], ["s2"]]));
    }

    #[tokio::test]
    async fn test_unknown_run_and_method() {
        let (mut conn, _rx) = setup();
        let err = conn
            .process_request("run.cancel", &json!({"run_id": "nope"}))
            .unwrap_err();
        assert_eq!(err.code, api::RUN_NOT_FOUND);

        let err = conn.process_request("run.explode", &json!({})).unwrap_err();
        assert_eq!(err.code, api::METHOD_NOT_FOUND);

        let result = conn
            .process_request("run.unsubscribe", &json!({"run_id": "nope"}))
            .unwrap();
        assert_eq!(result["unsubscribed"], false);
    }

    #[tokio::test]
    async fn test_node_types_listed() {
        let (mut conn, _rx) = setup();
        let result = conn.process_request("node_types.list", &Value::Null).unwrap();
        let tags: Vec<&str> = result["node_types"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["type"].as_str())
            .collect();
        assert!(tags.contains(&"test.echo"));
        assert!(tags.contains(&"test.join"));
    }
}

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{ErrorDetail, ErrorKind};
use crate::node::NodeValues;
use crate::types::{LogLevel, NodeId, NodeStatus, RunId, RunStatus};

/// Immutable record of something that happened during a run.
///
/// Serialized with camelCase field names and a `kind` tag, e.g.
/// `{"runId":"..","sequence":3,"timestampUtc":"..","kind":"node_transition",..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(run_id: RunId, sequence: u64, kind: EventKind) -> Self {
        Self {
            run_id,
            sequence,
            timestamp_utc: Utc::now(),
            kind,
        }
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match &self.kind {
            EventKind::NodeTransition { node_id, .. } | EventKind::NodeLog { node_id, .. } => {
                Some(node_id)
            }
            _ => None,
        }
    }

    pub fn is_run_finished(&self) -> bool {
        matches!(self.kind, EventKind::RunFinished { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename_all = "camelCase")]
    NodeTransition {
        node_id: NodeId,
        previous_status: NodeStatus,
        new_status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_values: Option<NodeValues>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RunStarted { graph_name: String, node_count: usize },
    #[serde(rename_all = "camelCase")]
    RunFinished { status: RunStatus },
    #[serde(rename_all = "camelCase")]
    RunError { error_kind: ErrorKind, message: String },
    #[serde(rename_all = "camelCase")]
    NodeLog {
        node_id: NodeId,
        level: LogLevel,
        message: String,
    },
    /// Synthesized per subscriber when it fell behind and events were dropped.
    Overflow { dropped: u64 },
}

impl EventKind {
    pub fn transition(
        node_id: NodeId,
        previous_status: NodeStatus,
        new_status: NodeStatus,
        output_values: Option<NodeValues>,
        error: Option<&ErrorDetail>,
    ) -> Self {
        EventKind::NodeTransition {
            node_id,
            previous_status,
            new_status,
            output_values,
            error_kind: error.map(|e| e.kind),
            error_message: error.map(|e| e.message.clone()),
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; slow subscribers lose the oldest ones.
pub struct EventBus<T = Event> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: T) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Ordered event feed for one run: replayed history first, then live events.
///
/// Ends after `RunFinished`. When the live receiver lags, exactly one
/// `Overflow` event is yielded for that gap so the consumer can resync from
/// a snapshot.
pub struct EventStream {
    run_id: RunId,
    backlog: VecDeque<Event>,
    rx: Option<broadcast::Receiver<Event>>,
    last_sequence: Option<u64>,
    finished: bool,
}

impl EventStream {
    pub fn new(run_id: RunId, backlog: Vec<Event>, rx: Option<broadcast::Receiver<Event>>) -> Self {
        Self {
            run_id,
            backlog: backlog.into(),
            rx,
            last_sequence: None,
            finished: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event, or `None` once the run has finished (or the run was dropped).
    pub async fn recv(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }
        while let Some(event) = self.backlog.pop_front() {
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(dropped)) => {
                    let sequence = self.last_sequence.unwrap_or(0);
                    return Some(Event::new(
                        self.run_id.clone(),
                        sequence,
                        EventKind::Overflow { dropped },
                    ));
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    fn accept(&mut self, event: Event) -> Option<Event> {
        if self.last_sequence.is_some_and(|last| event.sequence <= last) {
            return None;
        }
        self.last_sequence = Some(event.sequence);
        if event.is_run_finished() {
            self.finished = true;
            self.rx = None;
        }
        Some(event)
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|event| (event, stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(run: &RunId, seq: u64, node: &str, to: NodeStatus) -> Event {
        Event::new(
            run.clone(),
            seq,
            EventKind::transition(node.into(), NodeStatus::Pending, to, None, None),
        )
    }

    #[test]
    fn test_event_wire_shape() {
        let run = RunId::from_string("r1");
        let detail = ErrorDetail::new(ErrorKind::Timeout, "too slow");
        let event = Event::new(
            run,
            7,
            EventKind::transition(
                "probe".into(),
                NodeStatus::Running,
                NodeStatus::Failed,
                None,
                Some(&detail),
            ),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["kind"], "node_transition");
        assert_eq!(json["nodeId"], "probe");
        assert_eq!(json["previousStatus"], "running");
        assert_eq!(json["newStatus"], "failed");
        assert_eq!(json["errorKind"], "timeout");
        assert_eq!(json["errorMessage"], "too slow");
        assert!(json.get("outputValues").is_none());
        assert!(json.get("timestampUtc").is_some());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_run_finished_wire_shape() {
        let event = Event::new(
            RunId::from_string("r"),
            1,
            EventKind::RunFinished {
                status: RunStatus::Cancelled,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "run_finished");
        assert_eq!(json["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_stream_replays_backlog_then_live() {
        let run = RunId::from_string("r");
        let bus: EventBus = EventBus::new(16);
        let rx = bus.subscribe();
        let backlog = vec![transition(&run, 1, "a", NodeStatus::Ready)];
        let mut stream = EventStream::new(run.clone(), backlog, Some(rx));

        // Duplicate of a backlog event must be skipped.
        bus.publish(transition(&run, 1, "a", NodeStatus::Ready));
        bus.publish(transition(&run, 2, "b", NodeStatus::Ready));
        bus.publish(Event::new(
            run.clone(),
            3,
            EventKind::RunFinished {
                status: RunStatus::Succeeded,
            },
        ));

        let seqs: Vec<u64> = vec![
            stream.recv().await.unwrap().sequence,
            stream.recv().await.unwrap().sequence,
            stream.recv().await.unwrap().sequence,
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_reports_single_overflow() {
        let run = RunId::from_string("r");
        let bus: EventBus = EventBus::new(2);
        let mut stream = EventStream::new(run.clone(), Vec::new(), Some(bus.subscribe()));

        for seq in 1..=5 {
            bus.publish(transition(&run, seq, "n", NodeStatus::Ready));
        }
        drop(bus);

        let mut overflows = 0;
        let mut delivered = Vec::new();
        while let Some(event) = stream.recv().await {
            match event.kind {
                EventKind::Overflow { dropped } => {
                    overflows += 1;
                    assert_eq!(dropped, 3);
                }
                _ => delivered.push(event.sequence),
            }
        }
        assert_eq!(overflows, 1);
        assert_eq!(delivered, vec![4, 5]);
    }
}

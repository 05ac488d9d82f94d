use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use graphex_core::event::{Event, EventBus, EventKind, EventStream};
use graphex_core::node::NodeValues;
use graphex_core::traits::NodeLogSink;
use graphex_core::{EngineError, ErrorDetail, LogLevel, NodeId, NodeStatus, RunId, RunStatus};
use graphex_graph::Graph;

/// State of one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "NodeValues::is_empty")]
    pub outputs: NodeValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Full copy of a run's state, for subscribers that need to resync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub graph_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sequence number of the last event reflected in this snapshot.
    pub sequence: u64,
    pub nodes: Vec<NodeRecord>,
}

impl RunSnapshot {
    pub fn node(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| &n.node_id == id)
    }
}

/// `NodeLog` lines kept per run for replay when none is configured.
pub const DEFAULT_LOG_HISTORY: usize = 1000;

struct Inner {
    nodes: Vec<NodeRecord>,
    index: HashMap<NodeId, usize>,
    /// Every event except `NodeLog`.
    history: Vec<Event>,
    /// Most recent `NodeLog` events, at most `log_history` of them.
    logs: VecDeque<Event>,
    dropped_logs: u64,
    recorder: Option<mpsc::UnboundedSender<Event>>,
    sequence: u64,
    status: RunStatus,
    finished_at: Option<DateTime<Utc>>,
}

/// Per-run status table.
///
/// [`transition`](Self::transition) is the only way node records change.
/// Every change is appended to the run's history and published on its bus
/// while the table lock is held, so history order and delivery order agree.
///
/// Transitions are always kept for replay. Log lines are kept in a ring of
/// `log_history` entries; a replay that lost some starts with an `Overflow`
/// marker. An attached recorder receives every event without loss.
pub struct RunState {
    run_id: RunId,
    graph_name: String,
    started_at: DateTime<Utc>,
    log_history: usize,
    inner: Mutex<Inner>,
    bus: EventBus<Event>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunState {
    pub fn new(run_id: RunId, graph: &Graph, buffer: usize) -> Self {
        let nodes: Vec<NodeRecord> = graph
            .nodes()
            .iter()
            .map(|n| NodeRecord {
                node_id: n.id.clone(),
                status: NodeStatus::Pending,
                started_at: None,
                finished_at: None,
                outputs: NodeValues::new(),
                error: None,
            })
            .collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id.clone(), i))
            .collect();
        let (status_tx, _) = watch::channel(RunStatus::Running);
        Self {
            run_id,
            graph_name: graph.name().to_string(),
            started_at: Utc::now(),
            log_history: DEFAULT_LOG_HISTORY,
            inner: Mutex::new(Inner {
                nodes,
                index,
                history: Vec::new(),
                logs: VecDeque::new(),
                dropped_logs: 0,
                recorder: None,
                sequence: 0,
                status: RunStatus::Running,
                finished_at: None,
            }),
            bus: EventBus::new(buffer),
            status_tx,
        }
    }

    pub fn with_log_history(mut self, limit: usize) -> Self {
        self.log_history = limit;
        self
    }

    /// Send every event, in order, to `recorder`. The sender is dropped once
    /// the run finishes.
    pub fn with_recorder(mut self, recorder: mpsc::UnboundedSender<Event>) -> Self {
        self.inner
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .recorder = Some(recorder);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move `node` to `to`, recording outputs or error detail.
    ///
    /// Rejects transitions the node state machine does not allow, and any
    /// change after the run has finished.
    pub fn transition(
        &self,
        node: &NodeId,
        to: NodeStatus,
        outputs: Option<NodeValues>,
        error: Option<ErrorDetail>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let idx = *inner
            .index
            .get(node)
            .ok_or_else(|| EngineError::UnknownNode(node.clone()))?;
        let from = inner.nodes[idx].status;
        if inner.status.is_terminal() || !from.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                node: node.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        let record = &mut inner.nodes[idx];
        record.status = to;
        if to == NodeStatus::Running {
            record.started_at = Some(now);
        }
        if to.is_terminal() {
            record.finished_at = Some(now);
        }
        if let Some(values) = &outputs {
            record.outputs = values.clone();
        }
        record.error = error.clone();

        debug!(run_id = %self.run_id, node_id = %node, from = %from, to = %to, "Node transition");
        let kind = EventKind::transition(node.clone(), from, to, outputs, error.as_ref());
        self.record(&mut inner, kind);
        Ok(())
    }

    /// Append a non-transition event. Ignored once the run has finished.
    pub fn emit(&self, kind: EventKind) {
        let mut inner = self.lock();
        if !inner.status.is_terminal() {
            self.record(&mut inner, kind);
        }
    }

    /// Seal the run with its final status and emit `RunFinished`.
    /// Only the first call has any effect.
    pub fn finish(&self, status: RunStatus) {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return;
        }
        self.record(&mut inner, EventKind::RunFinished { status });
        inner.status = status;
        inner.finished_at = Some(Utc::now());
        inner.recorder = None;
        drop(inner);
        self.status_tx.send_replace(status);
    }

    fn record(&self, inner: &mut Inner, kind: EventKind) {
        inner.sequence += 1;
        let event = Event::new(self.run_id.clone(), inner.sequence, kind);
        let closed = inner
            .recorder
            .as_ref()
            .is_some_and(|r| r.send(event.clone()).is_err());
        if closed {
            inner.recorder = None;
        }
        if matches!(event.kind, EventKind::NodeLog { .. }) {
            inner.logs.push_back(event.clone());
            if inner.logs.len() > self.log_history {
                inner.logs.pop_front();
                inner.dropped_logs += 1;
            }
        } else {
            inner.history.push(event.clone());
        }
        self.bus.publish(event);
    }

    /// Retained events in sequence order, led by an `Overflow` marker when
    /// log lines were dropped from the ring.
    fn replay(&self, inner: &Inner) -> Vec<Event> {
        let mut out = Vec::with_capacity(inner.history.len() + inner.logs.len() + 1);
        if inner.dropped_logs > 0 {
            out.push(Event::new(
                self.run_id.clone(),
                0,
                EventKind::Overflow {
                    dropped: inner.dropped_logs,
                },
            ));
        }
        let mut logs = inner.logs.iter().peekable();
        for event in &inner.history {
            while let Some(log) = logs.next_if(|l| l.sequence < event.sequence) {
                out.push(log.clone());
            }
            out.push(event.clone());
        }
        out.extend(logs.cloned());
        out
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    pub fn node_status(&self, node: &NodeId) -> Option<NodeStatus> {
        let inner = self.lock();
        inner.index.get(node).map(|&i| inner.nodes[i].status)
    }

    /// Nodes that have not reached a terminal status, in graph order.
    pub fn non_terminal(&self) -> Vec<(NodeId, NodeStatus)> {
        self.lock()
            .nodes
            .iter()
            .filter(|n| !n.status.is_terminal())
            .map(|n| (n.node_id.clone(), n.status))
            .collect()
    }

    /// Retained events so far, then live events until `RunFinished`.
    pub fn subscribe(&self) -> EventStream {
        let inner = self.lock();
        let backlog = self.replay(&inner);
        let rx = (!inner.status.is_terminal()).then(|| self.bus.subscribe());
        EventStream::new(self.run_id.clone(), backlog, rx)
    }

    pub fn history(&self) -> Vec<Event> {
        let inner = self.lock();
        self.replay(&inner)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let inner = self.lock();
        RunSnapshot {
            run_id: self.run_id.clone(),
            graph_name: self.graph_name.clone(),
            status: inner.status,
            started_at: self.started_at,
            finished_at: inner.finished_at,
            sequence: inner.sequence,
            nodes: inner.nodes.clone(),
        }
    }

    /// Resolves once the run has a terminal status.
    pub async fn finished(&self) -> RunStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

impl NodeLogSink for RunState {
    fn log(&self, node: &NodeId, level: LogLevel, message: String) {
        self.emit(EventKind::NodeLog {
            node_id: node.clone(),
            level,
            message,
        });
    }
}

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use graphex_core::node::{NodeContext, NodeValues};
use graphex_core::traits::{NodeLogSink, NodeType};
use graphex_core::{
    EngineError, ErrorDetail, ErrorKind, EventKind, NodeId, NodeStatus, RunStatus,
};
use graphex_graph::{Graph, InputBinding};

use crate::executor::{NodeExecutor, Outcome};
use crate::run_state::RunState;

/// Everything a scheduler needs besides the graph and its run state.
pub struct RunSettings {
    pub max_concurrency: usize,
    /// Resolved graph input values, defaults applied.
    pub graph_inputs: NodeValues,
    pub working_dir: PathBuf,
    pub secrets: Arc<BTreeMap<String, String>>,
}

/// Drives one run to completion.
///
/// Nodes become Ready when their last predecessor reaches a terminal
/// status, or Skipped when a required input can no longer be produced.
/// Ready nodes are dispatched FIFO into a `JoinSet` bounded by
/// `max_concurrency`.
pub struct Scheduler {
    graph: Arc<Graph>,
    node_types: Vec<Arc<dyn NodeType>>,
    adjacency: Vec<Vec<usize>>,
    state: Arc<RunState>,
    executor: Arc<NodeExecutor>,
    settings: RunSettings,
    cancel: CancellationToken,

    status: Vec<NodeStatus>,
    remaining: Vec<usize>,
    outputs: Vec<Option<NodeValues>>,
    ready: VecDeque<usize>,
}

impl Scheduler {
    /// `node_types` is indexed like `graph.nodes()`.
    pub fn new(
        graph: Arc<Graph>,
        node_types: Vec<Arc<dyn NodeType>>,
        state: Arc<RunState>,
        executor: Arc<NodeExecutor>,
        settings: RunSettings,
        cancel: CancellationToken,
    ) -> Self {
        let adjacency = graph.adjacency();
        let mut remaining = vec![0; graph.len()];
        for successors in &adjacency {
            for &s in successors {
                remaining[s] += 1;
            }
        }
        let len = graph.len();
        Self {
            graph,
            node_types,
            adjacency,
            state,
            executor,
            settings,
            cancel,
            status: vec![NodeStatus::Pending; len],
            remaining,
            outputs: vec![None; len],
            ready: VecDeque::new(),
        }
    }

    pub async fn run(mut self) -> RunStatus {
        let run_id = self.state.run_id().clone();
        info!(run_id = %run_id, graph = %self.graph.name(), nodes = self.graph.len(), "Run started");
        self.state.emit(EventKind::RunStarted {
            graph_name: self.graph.name().to_string(),
            node_count: self.graph.len(),
        });

        let status = match self.drive().await {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run aborted");
                self.abort(&e);
                RunStatus::Failed
            }
        };

        info!(run_id = %run_id, status = %status, "Run finished");
        self.state.finish(status);
        status
    }

    async fn drive(&mut self) -> Result<RunStatus, EngineError> {
        let seeds: Vec<usize> = (0..self.graph.len())
            .filter(|&i| self.remaining[i] == 0)
            .collect();
        for i in seeds {
            self.evaluate(i)?;
        }

        let mut tasks: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut cancelled = false;
        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            while tasks.len() < self.settings.max_concurrency {
                let Some(i) = self.ready.pop_front() else {
                    break;
                };
                self.dispatch(i, &mut tasks)?;
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((i, outcome))) => self.complete(i, outcome)?,
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(EngineError::RunAborted(format!("node task failed: {}", e)));
                    }
                    None => {}
                },
            }
        }

        if cancelled {
            self.drain_cancelled(&mut tasks).await?;
        }

        Ok(if self.status.contains(&NodeStatus::Failed) {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        })
    }

    fn set(
        &mut self,
        i: usize,
        to: NodeStatus,
        outputs: Option<NodeValues>,
        error: Option<ErrorDetail>,
    ) -> Result<(), EngineError> {
        let node = &self.graph.nodes()[i].id;
        self.state.transition(node, to, outputs, error)?;
        self.status[i] = to;
        Ok(())
    }

    fn dispatch(&mut self, i: usize, tasks: &mut JoinSet<(usize, Outcome)>) -> Result<(), EngineError> {
        self.set(i, NodeStatus::Running, None, None)?;
        let inputs = self.gather_inputs(i);

        let graph = self.graph.clone();
        let node_type = self.node_types[i].clone();
        let executor = self.executor.clone();
        let ctx = NodeContext {
            run_id: self.state.run_id().clone(),
            node_id: graph.nodes()[i].id.clone(),
            cancel: self.cancel.child_token(),
            deadline: None,
            working_dir: self.settings.working_dir.clone(),
            secrets: self.settings.secrets.clone(),
            log: Some(self.state.clone() as Arc<dyn NodeLogSink>),
        };
        debug!(run_id = %ctx.run_id, node_id = %ctx.node_id, "Dispatching node");

        tasks.spawn(async move {
            let node = &graph.nodes()[i];
            let outcome = executor.execute(&*node_type, node, inputs, ctx).await;
            (i, outcome)
        });
        Ok(())
    }

    /// Literal and graph-input bindings, then values carried by edges from
    /// succeeded predecessors.
    fn gather_inputs(&self, i: usize) -> NodeValues {
        let node = &self.graph.nodes()[i];
        let mut inputs = NodeValues::new();
        for (port, binding) in &node.bindings {
            let value = match binding {
                InputBinding::Value(v) => Some(v.clone()),
                InputBinding::GraphInput(name) => self.settings.graph_inputs.get(name).cloned(),
            };
            if let Some(value) = value {
                inputs.insert(port.clone(), value);
            }
        }
        for edge in self.graph.incoming_edges(&node.id) {
            let Some(source) = self.graph.position(&edge.from.node) else {
                continue;
            };
            if let Some(value) = self.outputs[source]
                .as_ref()
                .and_then(|out| out.get(&edge.from.port))
            {
                inputs.insert(edge.to.port.clone(), value.clone());
            }
        }
        inputs
    }

    fn complete(&mut self, i: usize, outcome: Outcome) -> Result<(), EngineError> {
        let node_id = self.graph.nodes()[i].id.clone();
        match outcome {
            Outcome::Completed(values) => {
                debug!(node_id = %node_id, "Node succeeded");
                self.outputs[i] = Some(values.clone());
                self.set(i, NodeStatus::Succeeded, Some(values), None)?;
            }
            Outcome::Failed(e) => {
                warn!(node_id = %node_id, error = %e, "Node failed");
                self.set(i, NodeStatus::Failed, None, Some(ErrorDetail::from(&e)))?;
            }
            Outcome::Cancelled => {
                self.set(i, NodeStatus::Cancelled, None, Some(cancelled_detail()))?;
            }
        }
        self.settle(i)
    }

    /// Release the successors of a node that just reached a terminal status.
    /// Skips propagate through a worklist.
    fn settle(&mut self, i: usize) -> Result<(), EngineError> {
        let mut worklist = VecDeque::from([i]);
        while let Some(done) = worklist.pop_front() {
            for k in 0..self.adjacency[done].len() {
                let successor = self.adjacency[done][k];
                self.remaining[successor] -= 1;
                if self.remaining[successor] == 0 && self.evaluate(successor)? == NodeStatus::Skipped {
                    worklist.push_back(successor);
                }
            }
        }
        Ok(())
    }

    /// Decide between Ready and Skipped for a node whose predecessors are all terminal.
    fn evaluate(&mut self, i: usize) -> Result<NodeStatus, EngineError> {
        let node = &self.graph.nodes()[i];
        let mut missing = None;
        for edge in self.graph.incoming_edges(&node.id) {
            let required = node
                .input_port(&edge.to.port)
                .map(|p| p.required)
                .unwrap_or(true);
            let source = self.graph.position(&edge.from.node);
            let source_status = source.map(|s| self.status[s]);
            if required && source_status != Some(NodeStatus::Succeeded) {
                missing = Some((edge.to.port.clone(), edge.from.node.clone(), source_status));
                break;
            }
        }

        match missing {
            None => {
                self.set(i, NodeStatus::Ready, None, None)?;
                self.ready.push_back(i);
                Ok(NodeStatus::Ready)
            }
            Some((port, source, source_status)) => {
                let reason = match source_status {
                    Some(status) => format!("input '{}' unavailable: upstream node {} {}", port, source, status),
                    None => format!("input '{}' unavailable: upstream node {} missing", port, source),
                };
                debug!(node_id = %self.graph.nodes()[i].id, reason = %reason, "Skipping node");
                self.set(
                    i,
                    NodeStatus::Skipped,
                    None,
                    Some(ErrorDetail::new(ErrorKind::UpstreamFailed, reason)),
                )?;
                Ok(NodeStatus::Skipped)
            }
        }
    }

    /// Stop dispatching, cancel whatever has not started, and collect
    /// the nodes that are still running.
    async fn drain_cancelled(
        &mut self,
        tasks: &mut JoinSet<(usize, Outcome)>,
    ) -> Result<(), EngineError> {
        info!(run_id = %self.state.run_id(), running = tasks.len(), "Cancelling run");
        self.ready.clear();
        for i in 0..self.graph.len() {
            if matches!(self.status[i], NodeStatus::Pending | NodeStatus::Ready) {
                self.set(i, NodeStatus::Cancelled, None, Some(cancelled_detail()))?;
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, outcome)) => {
                    let node_id = self.graph.nodes()[i].id.clone();
                    match outcome {
                        Outcome::Completed(values) => {
                            self.outputs[i] = Some(values.clone());
                            self.set(i, NodeStatus::Succeeded, Some(values), None)?;
                        }
                        Outcome::Failed(e) => {
                            warn!(node_id = %node_id, error = %e, "Node failed during cancellation");
                            self.set(i, NodeStatus::Failed, None, Some(ErrorDetail::from(&e)))?;
                        }
                        Outcome::Cancelled => {
                            self.set(i, NodeStatus::Cancelled, None, Some(cancelled_detail()))?;
                        }
                    }
                }
                Err(e) => {
                    return Err(EngineError::RunAborted(format!("node task failed: {}", e)));
                }
            }
        }
        Ok(())
    }

    /// Run-fatal error: every non-terminal node becomes Cancelled and a
    /// `RunError` event is emitted.
    fn abort(&mut self, e: &EngineError) {
        self.cancel.cancel();
        self.state.emit(EventKind::RunError {
            error_kind: ErrorKind::RunFatal,
            message: e.to_string(),
        });
        let detail = ErrorDetail::new(ErrorKind::RunFatal, e.to_string());
        for (node, _) in self.state.non_terminal() {
            if let Err(err) =
                self.state
                    .transition(&node, NodeStatus::Cancelled, None, Some(detail.clone()))
            {
                error!(node_id = %node, error = %err, "Failed to cancel node after abort");
            }
        }
    }
}

fn cancelled_detail() -> ErrorDetail {
    ErrorDetail::new(ErrorKind::Cancelled, "run cancelled")
}

/// Ids in the order they would be dispatched with unbounded concurrency and
/// instant success, for previews and dry runs.
pub fn dispatch_order(graph: &Graph) -> Vec<NodeId> {
    graph.topological_layers().flatten().collect()
}

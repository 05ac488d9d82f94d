use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use graphex_core::config::AppConfig;
use graphex_core::event::{EventBus, EventStream};
use graphex_core::node::NodeValues;
use graphex_core::traits::{NodeCatalog, NodeType};
use graphex_core::{
    CoercionTable, EngineError, NodeId, NodeStatus, RunId, RunStatus, SubmitError,
};
use graphex_graph::{Graph, ValidatedGraph};

use crate::executor::NodeExecutor;
use crate::run_log::RunLogger;
use crate::run_state::{RunSnapshot, RunState};
use crate::scheduler::{RunSettings, Scheduler};

/// Run lifecycle announcement, broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunAnnouncement {
    #[serde(rename_all = "camelCase")]
    RunStarted { run_id: RunId, graph_name: String },
    #[serde(rename_all = "camelCase")]
    RunFinished { run_id: RunId, status: RunStatus },
}

/// Compact description of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub graph_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<NodeId, NodeStatus>,
}

impl RunSummary {
    fn of(snapshot: RunSnapshot) -> Self {
        Self {
            run_id: snapshot.run_id,
            graph_name: snapshot.graph_name,
            status: snapshot.status,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
            nodes: snapshot
                .nodes
                .into_iter()
                .map(|n| (n.node_id, n.status))
                .collect(),
        }
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|s| **s == status).count()
    }
}

struct RunHandle {
    state: Arc<RunState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunTable {
    runs: HashMap<RunId, RunHandle>,
    /// Submission order.
    order: Vec<RunId>,
    /// Finished runs, oldest first. Evicted beyond the retention limit.
    finished: VecDeque<RunId>,
}

/// Entry point for executing validated graphs.
///
/// Each submitted run gets its own [`RunState`], cancellation token and
/// scheduler task. Finished runs stay queryable until evicted.
pub struct Engine {
    catalog: Arc<dyn NodeCatalog>,
    executor: Arc<NodeExecutor>,
    max_concurrency: usize,
    event_buffer: usize,
    log_history: usize,
    retained_runs: usize,
    working_dir: PathBuf,
    secrets: Arc<BTreeMap<String, String>>,
    log_dir: Option<PathBuf>,
    runs: Arc<Mutex<RunTable>>,
    announcements: Arc<EventBus<RunAnnouncement>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(catalog: Arc<dyn NodeCatalog>, config: &AppConfig) -> Self {
        let engine = &config.engine;
        Self {
            catalog,
            executor: Arc::new(NodeExecutor::from_config(engine)),
            max_concurrency: engine.max_concurrency.max(1),
            event_buffer: engine.event_buffer,
            log_history: engine.log_history,
            retained_runs: engine.retained_runs,
            working_dir: config.working_dir(),
            secrets: Arc::new(config.secrets.clone()),
            log_dir: config.log.enabled.then(|| config.log_dir()),
            runs: Arc::new(Mutex::new(RunTable::default())),
            announcements: Arc::new(EventBus::new(64)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn NodeCatalog> {
        &self.catalog
    }

    pub fn coercion(&self) -> CoercionTable {
        self.executor.coercion()
    }

    fn table(&self) -> MutexGuard<'_, RunTable> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self, run_id: &RunId) -> Result<Arc<RunState>, EngineError> {
        self.table()
            .runs
            .get(run_id)
            .map(|h| h.state.clone())
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))
    }

    /// Start a run. Must be called from within a tokio runtime.
    ///
    /// Graph inputs are checked and defaulted before anything is created;
    /// `concurrency` overrides the configured limit.
    pub fn submit_run(
        &self,
        graph: &ValidatedGraph,
        initial_inputs: NodeValues,
        concurrency: Option<usize>,
    ) -> Result<RunId, SubmitError> {
        let max_concurrency = match concurrency {
            Some(0) => return Err(SubmitError::InvalidConcurrency),
            Some(n) => n,
            None => self.max_concurrency,
        };
        let graph_inputs = self.resolve_graph_inputs(graph, initial_inputs)?;
        let node_types = self.resolve_node_types(graph)?;

        let run_id = RunId::new();
        let shared = graph.shared();
        let mut state = RunState::new(run_id.clone(), &shared, self.event_buffer)
            .with_log_history(self.log_history);
        if let Some(dir) = &self.log_dir {
            let (tx, rx) = mpsc::unbounded_channel();
            state = state.with_recorder(tx);
            tokio::spawn(RunLogger::new(dir.clone()).run(run_id.clone(), rx));
        }
        let state = Arc::new(state);
        let cancel = self.shutdown.child_token();

        {
            let mut table = self.table();
            table.runs.insert(
                run_id.clone(),
                RunHandle {
                    state: state.clone(),
                    cancel: cancel.clone(),
                },
            );
            table.order.push(run_id.clone());
        }

        let scheduler = Scheduler::new(
            shared,
            node_types,
            state.clone(),
            self.executor.clone(),
            RunSettings {
                max_concurrency,
                graph_inputs,
                working_dir: self.working_dir.clone(),
                secrets: self.secrets.clone(),
            },
            cancel,
        );

        info!(run_id = %run_id, graph = %state.graph_name(), max_concurrency, "Run submitted");
        self.announcements.publish(RunAnnouncement::RunStarted {
            run_id: run_id.clone(),
            graph_name: state.graph_name().to_string(),
        });

        let runs = self.runs.clone();
        let announcements = self.announcements.clone();
        let retained = self.retained_runs;
        let id = run_id.clone();
        tokio::spawn(async move {
            let status = scheduler.run().await;
            announcements.publish(RunAnnouncement::RunFinished {
                run_id: id.clone(),
                status,
            });
            let mut table = runs.lock().unwrap_or_else(|e| e.into_inner());
            table.finished.push_back(id);
            while table.finished.len() > retained {
                if let Some(old) = table.finished.pop_front() {
                    debug!(run_id = %old, "Evicting finished run");
                    table.runs.remove(&old);
                    table.order.retain(|r| r != &old);
                }
            }
        });

        Ok(run_id)
    }

    fn resolve_graph_inputs(
        &self,
        graph: &Graph,
        mut supplied: NodeValues,
    ) -> Result<NodeValues, SubmitError> {
        if let Some(unknown) = supplied.keys().find(|k| graph.graph_input(k).is_none()) {
            return Err(SubmitError::UnknownGraphInput(unknown.clone()));
        }
        let coercion = self.coercion();
        let mut resolved = NodeValues::new();
        for input in graph.graph_inputs() {
            let value = match supplied.remove(&input.name) {
                Some(value) => coercion.coerce(value, &input.data_type).map_err(|e| {
                    SubmitError::InvalidGraphInput {
                        name: input.name.clone(),
                        message: e.to_string(),
                    }
                })?,
                None => input
                    .default
                    .clone()
                    .ok_or_else(|| SubmitError::MissingGraphInput(input.name.clone()))?,
            };
            resolved.insert(input.name.clone(), value);
        }
        Ok(resolved)
    }

    fn resolve_node_types(&self, graph: &Graph) -> Result<Vec<Arc<dyn NodeType>>, SubmitError> {
        graph
            .nodes()
            .iter()
            .map(|n| {
                self.catalog
                    .lookup(&n.type_tag)
                    .ok_or_else(|| SubmitError::UnknownNodeType {
                        node: n.id.clone(),
                        type_tag: n.type_tag.clone(),
                    })
            })
            .collect()
    }

    /// Request cancellation. Idempotent; a finished run is left as it is.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<(), EngineError> {
        let table = self.table();
        let handle = table
            .runs
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;
        if !handle.cancel.is_cancelled() {
            info!(run_id = %run_id, "Cancellation requested");
            handle.cancel.cancel();
        }
        Ok(())
    }

    /// Replay of the run's events so far, followed by live events.
    pub fn subscribe(&self, run_id: &RunId) -> Result<EventStream, EngineError> {
        Ok(self.state(run_id)?.subscribe())
    }

    pub fn snapshot(&self, run_id: &RunId) -> Result<RunSnapshot, EngineError> {
        Ok(self.state(run_id)?.snapshot())
    }

    /// Wait for the run to finish.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunSummary, EngineError> {
        let state = self.state(run_id)?;
        state.finished().await;
        Ok(RunSummary::of(state.snapshot()))
    }

    /// Known runs in submission order.
    pub fn list_runs(&self) -> Vec<RunSummary> {
        let table = self.table();
        table
            .order
            .iter()
            .filter_map(|id| table.runs.get(id))
            .map(|h| RunSummary::of(h.state.snapshot()))
            .collect()
    }

    pub fn subscribe_runs(&self) -> broadcast::Receiver<RunAnnouncement> {
        self.announcements.subscribe()
    }

    /// Cancel every run still in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

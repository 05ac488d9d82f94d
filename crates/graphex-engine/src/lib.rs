//! Graph execution: the node executor, per-run state, the scheduler that
//! drives a run, and the [`Engine`] that owns runs and their event streams.

pub mod engine;
pub mod executor;
pub mod run_log;
pub mod run_state;
pub mod scheduler;

pub use engine::{Engine, RunAnnouncement, RunSummary};
pub use executor::{NodeExecutor, Outcome};
pub use run_log::RunLogger;
pub use run_state::{NodeRecord, RunSnapshot, RunState};
pub use scheduler::{dispatch_order, RunSettings, Scheduler};

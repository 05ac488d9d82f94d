//! Shared test utilities for Graphex crates: mock node types that record
//! what they did, and ready-made graph fixtures.

pub mod fixtures;
pub mod nodes;

pub use fixtures::{build, build_validated, chain, diamond, independent, parse_document};
pub use nodes::{
    mock_registry, BadOutputNode, EchoNode, FailingNode, JoinNode, PanicNode, Probe, ResourceGuard,
    SleepNode, TypedNode,
};

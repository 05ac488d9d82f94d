use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datatype::DataType;
use crate::types::{NodeId, NodeStatus, PortDirection, PortRef, RunId};

/// Malformed graph. Raised while a graph is being assembled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StructuralError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node {node} has no {direction} port '{port}'")]
    UnknownPort {
        node: NodeId,
        port: String,
        direction: PortDirection,
    },

    #[error("Input {0} already has an incoming edge")]
    InputAlreadyConnected(PortRef),

    #[error("Edge connects node {0} to itself")]
    SelfLoop(NodeId),

    #[error("Cannot connect {from} ({from_type}) to {to} ({to_type})")]
    IncompatiblePorts {
        from: PortRef,
        to: PortRef,
        from_type: DataType,
        to_type: DataType,
    },

    #[error("Unknown node type '{type_tag}' for node {node}")]
    UnknownNodeType { node: NodeId, type_tag: String },

    #[error("Invalid config for node {node}: {message}")]
    InvalidConfig { node: NodeId, message: String },

    #[error("Malformed port reference '{0}' (expected node::port)")]
    MalformedPortRef(String),

    #[error("Duplicate graph input: {0}")]
    DuplicateGraphInput(String),
}

/// A graph that is well-formed but not safe to schedule.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<NodeId> },

    #[error("Required input {node}::{port} is not satisfied")]
    UnsatisfiedInput { node: NodeId, port: String },

    #[error("Type mismatch on edge {from} -> {to}: {from_type} cannot feed {to_type}")]
    TypeMismatch {
        from: PortRef,
        to: PortRef,
        from_type: DataType,
        to_type: DataType,
    },
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure of a single node. Contained to that node.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("Input '{port}' binding failed: {message}")]
    InputBinding { port: String, message: String },

    #[error("Node timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Node logic panicked: {0}")]
    ExecutionPanic(String),

    #[error("{0}")]
    Execution(String),

    #[error("Output '{port}' is invalid: {message}")]
    InvalidOutput { port: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeError {
    pub fn input(port: impl Into<String>, message: impl Into<String>) -> Self {
        NodeError::InputBinding {
            port: port.into(),
            message: message.into(),
        }
    }

    pub fn execution(message: impl fmt::Display) -> Self {
        NodeError::Execution(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::InputBinding { .. } => ErrorKind::InputBinding,
            NodeError::Timeout { .. } => ErrorKind::Timeout,
            NodeError::ExecutionPanic(_) => ErrorKind::ExecutionPanic,
            NodeError::Execution(_) => ErrorKind::Execution,
            NodeError::InvalidOutput { .. } => ErrorKind::InvalidOutput,
            NodeError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            NodeError::Cancelled => ErrorKind::Cancelled,
            NodeError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e.to_string())
    }
}

/// Rejected run submission. Nothing is created when this is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("Missing required graph input '{0}'")]
    MissingGraphInput(String),

    #[error("Unknown graph input '{0}'")]
    UnknownGraphInput(String),

    #[error("Graph input '{name}' is invalid: {message}")]
    InvalidGraphInput { name: String, message: String },

    #[error("Concurrency limit must be at least 1")]
    InvalidConcurrency,

    #[error("Node {node} has type '{type_tag}', which is not registered")]
    UnknownNodeType { node: NodeId, type_tag: String },
}

/// Engine-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Illegal transition for node {node}: {from} -> {to}")]
    IllegalTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Node {0} is not part of this run")]
    UnknownNode(NodeId),

    #[error("Run aborted: {0}")]
    RunAborted(String),
}

#[derive(Debug, Error)]
pub enum GraphexError {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphexError::Structural(_) => ErrorKind::Structural,
            GraphexError::Validation(ValidationError::CycleDetected { .. }) => {
                ErrorKind::CycleDetected
            }
            GraphexError::Validation(ValidationError::UnsatisfiedInput { .. }) => {
                ErrorKind::UnsatisfiedInput
            }
            GraphexError::Validation(ValidationError::TypeMismatch { .. }) => {
                ErrorKind::TypeMismatch
            }
            GraphexError::Node(e) => e.kind(),
            GraphexError::Submit(_) => ErrorKind::InvalidSubmission,
            GraphexError::Engine(EngineError::RunNotFound(_)) => ErrorKind::NotFound,
            GraphexError::Engine(_) => ErrorKind::RunFatal,
            GraphexError::Config(_) | GraphexError::ConfigNotFound(_) => ErrorKind::Config,
            GraphexError::Io(_) => ErrorKind::Io,
            GraphexError::Json(_) => ErrorKind::Json,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphexError>;

/// Stable, wire-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Structural,
    CycleDetected,
    UnsatisfiedInput,
    TypeMismatch,
    InputBinding,
    Timeout,
    ExecutionPanic,
    Execution,
    InvalidOutput,
    InvalidConfig,
    Cancelled,
    UpstreamFailed,
    RunFatal,
    InvalidSubmission,
    NotFound,
    Config,
    Io,
    Json,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Error kind plus human-readable reason, as recorded in Run State and
/// delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&NodeError> for ErrorDetail {
    fn from(e: &NodeError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ValidationError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected: a -> b -> a");
    }

    #[test]
    fn test_node_error_kinds() {
        assert_eq!(NodeError::Timeout { timeout_ms: 10 }.kind(), ErrorKind::Timeout);
        assert_eq!(
            NodeError::input("host", "expected string").kind(),
            ErrorKind::InputBinding
        );
        let io: NodeError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(io.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_error_kind_display_matches_wire_name() {
        assert_eq!(ErrorKind::ExecutionPanic.to_string(), "execution_panic");
        assert_eq!(ErrorKind::UpstreamFailed.to_string(), "upstream_failed");
    }

    #[test]
    fn test_umbrella_kind() {
        let err: GraphexError = ValidationError::UnsatisfiedInput {
            node: "n".into(),
            port: "p".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnsatisfiedInput);
    }
}

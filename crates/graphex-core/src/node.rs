use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::datatype::DataType;
use crate::error::NodeError;
use crate::traits::NodeLogSink;
use crate::types::{LogLevel, NodeId, RunId};

/// Per-node configuration parameters, as given in the graph document.
pub type NodeConfig = serde_json::Map<String, Value>;

/// Values keyed by port name. Ordered so events and logs are stable.
pub type NodeValues = BTreeMap<String, Value>;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPort {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl InputPort {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPort {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl OutputPort {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The input/output contract a node type declares for a given configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortDeclaration {
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
}

impl PortDeclaration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, port: InputPort) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: OutputPort) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn find_input(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn find_output(&self, name: &str) -> Option<&OutputPort> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Everything a node's logic receives: its config and bound input values.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub node_id: NodeId,
    pub config: NodeConfig,
    pub inputs: NodeValues,
}

impl NodeRequest {
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).filter(|v| !v.is_null())
    }

    pub fn str_input(&self, name: &str) -> Result<&str, NodeError> {
        self.input(name)
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::input(name, "expected a string"))
    }

    pub fn opt_str_input(&self, name: &str) -> Option<&str> {
        self.input(name).and_then(Value::as_str)
    }

    pub fn u64_input(&self, name: &str) -> Result<u64, NodeError> {
        self.input(name)
            .and_then(Value::as_u64)
            .ok_or_else(|| NodeError::input(name, "expected a non-negative integer"))
    }

    pub fn opt_u64_input(&self, name: &str) -> Option<u64> {
        self.input(name).and_then(Value::as_u64)
    }

    pub fn bool_input(&self, name: &str) -> Option<bool> {
        self.input(name).and_then(Value::as_bool)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Shared automation state handed to node logic. Cloned per node.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    pub working_dir: PathBuf,
    pub secrets: Arc<BTreeMap<String, String>>,
    pub log: Option<Arc<dyn NodeLogSink>>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("working_dir", &self.working_dir)
            .field("secrets", &self.secrets.len())
            .field("log", &self.log.is_some())
            .finish()
    }
}

impl NodeContext {
    /// A detached context with no deadline, secrets or log sink.
    pub fn detached(run_id: RunId, node_id: NodeId, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            node_id,
            cancel: CancellationToken::new(),
            deadline: None,
            working_dir: working_dir.into(),
            secrets: Arc::new(BTreeMap::new()),
            log: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    /// Resolve a path relative to the run's working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if let Some(sink) = &self.log {
            sink.log(&self.node_id, level, message.into());
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CaptureSink(Mutex<Vec<(String, LogLevel, String)>>);

    impl NodeLogSink for CaptureSink {
        fn log(&self, node: &NodeId, level: LogLevel, message: String) {
            self.0
                .lock()
                .unwrap()
                .push((node.to_string(), level, message));
        }
    }

    #[test]
    fn test_input_port_builders() {
        let port = InputPort::new("count", DataType::Integer)
            .optional()
            .with_default(json!(3));
        assert!(!port.required);
        assert_eq!(port.default, Some(json!(3)));

        let json = serde_json::to_value(&port).unwrap();
        assert_eq!(json["type"], "integer");
        assert!(json.get("description").is_none());
    }

    #[test]
    fn test_input_port_required_by_default() {
        let port: InputPort =
            serde_json::from_value(json!({"name": "host", "type": "string"})).unwrap();
        assert!(port.required);
    }

    #[test]
    fn test_request_accessors() {
        let mut inputs = NodeValues::new();
        inputs.insert("host".into(), json!("example.com"));
        inputs.insert("port".into(), json!(443));
        inputs.insert("missing".into(), Value::Null);
        let req = NodeRequest {
            node_id: "n".into(),
            config: NodeConfig::new(),
            inputs,
        };
        assert_eq!(req.str_input("host").unwrap(), "example.com");
        assert_eq!(req.u64_input("port").unwrap(), 443);
        assert!(req.input("missing").is_none());
        assert!(matches!(
            req.str_input("port"),
            Err(NodeError::InputBinding { .. })
        ));
    }

    #[test]
    fn test_context_logs_through_sink() {
        let sink = Arc::new(CaptureSink::default());
        let mut ctx = NodeContext::detached(RunId::new(), "probe".into(), "/tmp");
        ctx.log = Some(sink.clone());
        ctx.info("hello");
        ctx.warn("careful");
        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, "probe");
        assert_eq!(lines[1].1, LogLevel::Warning);
    }

    #[test]
    fn test_resolve_path() {
        let ctx = NodeContext::detached(RunId::new(), "n".into(), "/work");
        assert_eq!(ctx.resolve_path("a.txt"), PathBuf::from("/work/a.txt"));
        assert_eq!(ctx.resolve_path("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }
}

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use graphex_core::config::EngineConfig;
use graphex_core::node::{NodeContext, NodeRequest, NodeValues};
use graphex_core::traits::NodeType;
use graphex_core::{CoercionTable, NodeError};
use graphex_graph::Node;

/// How a single node execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(NodeValues),
    Failed(NodeError),
    Cancelled,
}

enum Interrupt {
    Cancelled,
    Deadline,
}

/// Runs one node: binds and checks its inputs, invokes the logic under its
/// deadline and cancellation token, and checks what comes back.
#[derive(Debug, Clone)]
pub struct NodeExecutor {
    coercion: CoercionTable,
    default_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl NodeExecutor {
    pub fn new(coercion: CoercionTable) -> Self {
        Self {
            coercion,
            default_timeout: None,
            cancel_grace: Duration::from_millis(500),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let default_timeout = (config.default_node_timeout_secs > 0)
            .then(|| Duration::from_secs(config.default_node_timeout_secs));
        Self::new(CoercionTable::new(config.coercion))
            .with_default_timeout(default_timeout)
            .with_cancel_grace(Duration::from_millis(config.cancel_grace_ms))
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Time a cancelled or timed-out node gets to unwind before its future is dropped.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn coercion(&self) -> CoercionTable {
        self.coercion
    }

    /// Node override, then the node type's own timeout, then the engine default.
    pub fn timeout_for(&self, node: &Node, node_type: &dyn NodeType) -> Option<Duration> {
        node.timeout_secs
            .or_else(|| node_type.timeout_secs())
            .map(Duration::from_secs)
            .or(self.default_timeout)
    }

    /// Bind concrete values to the declared input ports.
    ///
    /// Supplied values are coerced to the port type; missing ones fall back
    /// to the port default. Undeclared keys are ignored.
    pub fn prepare(
        &self,
        node: &Node,
        node_type: &dyn NodeType,
        mut supplied: NodeValues,
    ) -> Result<NodeRequest, NodeError> {
        let mut inputs = NodeValues::new();
        for port in &node.ports.inputs {
            let value = match supplied.remove(&port.name) {
                None | Some(Value::Null) => port.default.clone(),
                Some(value) => Some(value),
            };
            match value {
                Some(value) => {
                    let value = self
                        .coercion
                        .coerce(value, &port.data_type)
                        .map_err(|e| NodeError::input(&port.name, e.to_string()))?;
                    inputs.insert(port.name.clone(), value);
                }
                None if port.required => {
                    return Err(NodeError::input(&port.name, "no value was supplied"));
                }
                None => {}
            }
        }

        let request = NodeRequest {
            node_id: node.id.clone(),
            config: node.config.clone(),
            inputs,
        };
        node_type.validate_inputs(&request)?;
        Ok(request)
    }

    pub async fn execute(
        &self,
        node_type: &dyn NodeType,
        node: &Node,
        inputs: NodeValues,
        mut ctx: NodeContext,
    ) -> Outcome {
        let request = match self.prepare(node, node_type, inputs) {
            Ok(request) => request,
            Err(e) => {
                debug!(node_id = %node.id, error = %e, "Input binding failed");
                return Outcome::Failed(e);
            }
        };

        let token = ctx.cancel.clone();
        if token.is_cancelled() {
            return Outcome::Cancelled;
        }

        // A timeout too large for the clock to represent means no deadline
        let timeout = self.timeout_for(node, node_type);
        if let Some(at) = timeout.and_then(|t| Instant::now().checked_add(t)) {
            ctx.deadline = Some(at);
        }
        let deadline = ctx.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut logic = AssertUnwindSafe(node_type.execute(request, ctx)).catch_unwind();
        let interrupt = tokio::select! {
            biased;
            result = &mut logic => {
                return match result {
                    Ok(result) => self.finish(node, &token, result),
                    Err(payload) => {
                        let message = panic_message(payload);
                        warn!(node_id = %node.id, panic = %message, "Node logic panicked");
                        Outcome::Failed(NodeError::ExecutionPanic(message))
                    }
                };
            }
            _ = token.cancelled() => Interrupt::Cancelled,
            _ = expired => Interrupt::Deadline,
        };

        if matches!(interrupt, Interrupt::Deadline) {
            token.cancel();
        }
        if tokio::time::timeout(self.cancel_grace, &mut logic).await.is_err() {
            debug!(node_id = %node.id, "Node did not unwind within grace period, dropping it");
        }
        drop(logic);

        match interrupt {
            Interrupt::Cancelled => Outcome::Cancelled,
            Interrupt::Deadline => {
                let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                warn!(node_id = %node.id, timeout_ms, "Node timed out");
                Outcome::Failed(NodeError::Timeout { timeout_ms })
            }
        }
    }

    fn finish(
        &self,
        node: &Node,
        token: &tokio_util::sync::CancellationToken,
        result: Result<NodeValues, NodeError>,
    ) -> Outcome {
        match result {
            Ok(values) => match check_outputs(node, values) {
                Ok(values) => Outcome::Completed(values),
                Err(e) => Outcome::Failed(e),
            },
            Err(_) if token.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Keep only declared outputs, and require each to match its declared type.
fn check_outputs(node: &Node, values: NodeValues) -> Result<NodeValues, NodeError> {
    let mut checked = NodeValues::new();
    for (name, value) in values {
        let Some(port) = node.output_port(&name) else {
            debug!(node_id = %node.id, port = %name, "Dropping undeclared output");
            continue;
        };
        if value.is_null() {
            continue;
        }
        if !port.data_type.matches(&value) {
            return Err(NodeError::InvalidOutput {
                port: name,
                message: format!(
                    "expected {}, found {}",
                    port.data_type,
                    graphex_core::datatype::value_kind(&value)
                ),
            });
        }
        checked.insert(name, value);
    }
    Ok(checked)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphex_core::{DataType, RunId};
    use graphex_test_utils::{mock_registry, Probe};
    use serde_json::json;

    fn node_of(type_tag: &str, config: Value, probe: &Probe) -> (Node, std::sync::Arc<dyn NodeType>) {
        let registry = mock_registry(probe);
        let node_type = registry.get(type_tag).unwrap();
        let config = config.as_object().cloned().unwrap();
        let ports = node_type.ports(&config).unwrap();
        let node = Node::new("n", type_tag, ports).with_config(config);
        (node, node_type)
    }

    fn ctx() -> NodeContext {
        NodeContext::detached(RunId::new(), "n".into(), ".")
    }

    #[test]
    fn test_prepare_coerces_and_defaults() {
        let probe = Probe::new();
        let (mut node, node_type) = node_of("test.typed", json!({}), &probe);
        let executor = NodeExecutor::new(CoercionTable::lenient());

        let mut inputs = NodeValues::new();
        inputs.insert("n".into(), json!(4));
        inputs.insert("extra".into(), json!("ignored"));
        let request = executor.prepare(&node, &*node_type, inputs).unwrap();
        assert_eq!(request.inputs.len(), 1);

        let err = executor
            .prepare(&node, &*node_type, NodeValues::new())
            .unwrap_err();
        assert!(matches!(err, NodeError::InputBinding { ref port, .. } if port == "n"));

        node.ports.inputs[0] = graphex_core::InputPort::new("n", DataType::Integer)
            .optional()
            .with_default(json!(7));
        let request = executor
            .prepare(&node, &*node_type, NodeValues::new())
            .unwrap();
        assert_eq!(request.inputs["n"], json!(7));
    }

    #[test]
    fn test_prepare_rejects_wrong_type_and_failed_validation() {
        let probe = Probe::new();
        let (node, node_type) = node_of("test.typed", json!({}), &probe);
        let executor = NodeExecutor::new(CoercionTable::lenient());

        let mut inputs = NodeValues::new();
        inputs.insert("n".into(), json!("four"));
        let err = executor.prepare(&node, &*node_type, inputs).unwrap_err();
        assert_eq!(err.kind(), graphex_core::ErrorKind::InputBinding);

        let mut inputs = NodeValues::new();
        inputs.insert("n".into(), json!(-1));
        let err = executor.prepare(&node, &*node_type, inputs).unwrap_err();
        assert_eq!(err, NodeError::input("n", "must be non-negative"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let probe = Probe::new();
        let (node, node_type) = node_of("test.panic", json!({}), &probe);
        let executor = NodeExecutor::new(CoercionTable::lenient());
        let outcome = executor
            .execute(&*node_type, &node, NodeValues::new(), ctx())
            .await;
        assert_eq!(
            outcome,
            Outcome::Failed(NodeError::ExecutionPanic("node logic exploded".into()))
        );
    }

    #[tokio::test]
    async fn test_invalid_output() {
        let probe = Probe::new();
        let (node, node_type) = node_of("test.bad_output", json!({}), &probe);
        let executor = NodeExecutor::new(CoercionTable::lenient());
        let outcome = executor
            .execute(&*node_type, &node, NodeValues::new(), ctx())
            .await;
        assert!(matches!(
            outcome,
            Outcome::Failed(NodeError::InvalidOutput { ref port, .. }) if port == "count"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_drops_uncooperative_node() {
        let probe = Probe::new();
        let (node, node_type) = node_of(
            "test.sleep",
            json!({"millis": 60_000, "ignore_cancel": true}),
            &probe,
        );
        let node = node.with_timeout(1);
        let executor = NodeExecutor::new(CoercionTable::lenient())
            .with_cancel_grace(Duration::from_millis(50));

        let outcome = executor
            .execute(&*node_type, &node, NodeValues::new(), ctx())
            .await;
        assert_eq!(outcome, Outcome::Failed(NodeError::Timeout { timeout_ms: 1000 }));
        assert_eq!(probe.live_guards(), 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_runs_without_deadline() {
        let probe = Probe::new();
        let (node, node_type) = node_of("test.echo", json!({}), &probe);
        let node = node.with_timeout(u64::MAX);
        let executor = NodeExecutor::new(CoercionTable::lenient());

        let mut inputs = NodeValues::new();
        inputs.insert("value".into(), json!("hi"));
        let outcome = executor
            .execute(&*node_type, &node, inputs, ctx())
            .await;
        assert!(matches!(outcome, Outcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_yields_cancelled() {
        let probe = Probe::new();
        let (node, node_type) = node_of("test.sleep", json!({"millis": 60_000}), &probe);
        let executor = NodeExecutor::new(CoercionTable::lenient());
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let outcome = executor
            .execute(&*node_type, &node, NodeValues::new(), ctx)
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(probe.live_guards(), 0);
    }
}

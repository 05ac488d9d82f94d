//! Mock node types with observable side effects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{DataType, NodeError, NodeId};
use graphex_nodes::NodeTypeRegistry;

/// Counters and logs shared between a test and the mock nodes it runs.
#[derive(Clone, Default)]
pub struct Probe {
    /// Live [`ResourceGuard`]s. Back to zero once every node released its resources.
    pub live_guards: Arc<AtomicUsize>,
    /// Node ids in the order their logic started.
    pub started: Arc<Mutex<Vec<NodeId>>>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_guards(&self) -> usize {
        self.live_guards.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<NodeId> {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn enter(&self, node: &NodeId) -> InFlight {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(node.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self.in_flight.clone())
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII stand-in for a socket or file handle held by node logic.
pub struct ResourceGuard(Arc<AtomicUsize>);

impl ResourceGuard {
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn any_in_any_out(required: bool) -> PortDeclaration {
    let input = InputPort::new("value", DataType::Any);
    PortDeclaration::new()
        .input(if required { input } else { input.optional() })
        .output(OutputPort::new("value", DataType::Any))
}

fn config_u64(config: &NodeConfig, key: &str) -> u64 {
    config.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// `test.echo`: copies `value` to `value`, after an optional `millis` pause.
/// Records start order and concurrency in the probe.
pub struct EchoNode {
    pub probe: Probe,
}

impl NodeType for EchoNode {
    fn type_tag(&self) -> &str {
        "test.echo"
    }

    fn description(&self) -> &str {
        "Echo the input value"
    }

    fn ports(&self, config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        let required = config
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(any_in_any_out(required))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let _in_flight = self.probe.enter(&request.node_id);
            let millis = config_u64(&request.config, "millis");
            if millis > 0 {
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
            ctx.info(format!("echo {}", request.node_id));
            let mut out = NodeValues::new();
            let value = request
                .inputs
                .get("value")
                .cloned()
                .unwrap_or_else(|| json!(request.node_id.as_str()));
            out.insert("value".into(), value);
            Ok(out)
        })
    }
}

/// `test.fail`: always fails with an execution error.
pub struct FailingNode;

impl NodeType for FailingNode {
    fn type_tag(&self) -> &str {
        "test.fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(any_in_any_out(false))
    }

    fn execute(
        &self,
        request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move { Err(NodeError::execution(format!("{} failed", request.node_id))) })
    }
}

/// `test.panic`: panics inside its logic.
pub struct PanicNode;

impl NodeType for PanicNode {
    fn type_tag(&self) -> &str {
        "test.panic"
    }

    fn description(&self) -> &str {
        "Panics"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(any_in_any_out(false))
    }

    fn execute(
        &self,
        _request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let values: NodeValues = explode();
            Ok(values)
        })
    }
}

fn explode() -> NodeValues {
    panic!("node logic exploded")
}

/// `test.sleep`: holds a [`ResourceGuard`] for `millis` milliseconds.
///
/// With `"ignore_cancel": true` the node never looks at its token, so only
/// dropping its future ends it.
pub struct SleepNode {
    pub probe: Probe,
}

impl NodeType for SleepNode {
    fn type_tag(&self) -> &str {
        "test.sleep"
    }

    fn description(&self) -> &str {
        "Sleep while holding a resource"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(any_in_any_out(false))
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let _in_flight = self.probe.enter(&request.node_id);
            let _guard = ResourceGuard::acquire(&self.probe.live_guards);
            let millis = config_u64(&request.config, "millis");
            let ignore_cancel = request
                .config
                .get("ignore_cancel")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let sleep = tokio::time::sleep(Duration::from_millis(millis));
            if ignore_cancel {
                sleep.await;
            } else {
                tokio::select! {
                    _ = sleep => {}
                    _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                }
            }
            let mut out = NodeValues::new();
            out.insert("value".into(), json!(millis));
            Ok(out)
        })
    }
}

/// `test.bad_output`: declares an integer output but produces a string.
pub struct BadOutputNode;

impl NodeType for BadOutputNode {
    fn type_tag(&self) -> &str {
        "test.bad_output"
    }

    fn description(&self) -> &str {
        "Returns a value that does not match its declared type"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new().output(OutputPort::new("count", DataType::Integer)))
    }

    fn execute(
        &self,
        _request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let mut out = NodeValues::new();
            out.insert("count".into(), json!("not a number"));
            Ok(out)
        })
    }
}

/// `test.typed`: integer input `n`, rejected when negative by
/// `validate_inputs`; outputs `n * 2`.
pub struct TypedNode;

impl NodeType for TypedNode {
    fn type_tag(&self) -> &str {
        "test.typed"
    }

    fn description(&self) -> &str {
        "Doubles a non-negative integer"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(InputPort::new("n", DataType::Integer))
            .output(OutputPort::new("doubled", DataType::Integer)))
    }

    fn validate_inputs(&self, request: &NodeRequest) -> Result<(), NodeError> {
        match request.input("n").and_then(Value::as_i64) {
            Some(n) if n >= 0 => Ok(()),
            _ => Err(NodeError::input("n", "must be non-negative")),
        }
    }

    fn execute(
        &self,
        request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let n = request
                .input("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| NodeError::input("n", "missing"))?;
            let mut out = NodeValues::new();
            out.insert("doubled".into(), json!(n * 2));
            Ok(out)
        })
    }
}

/// `test.join`: two required inputs `left` and `right`, output `value` as a pair.
pub struct JoinNode;

impl NodeType for JoinNode {
    fn type_tag(&self) -> &str {
        "test.join"
    }

    fn description(&self) -> &str {
        "Pairs two values"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(InputPort::new("left", DataType::Any))
            .input(InputPort::new("right", DataType::Any))
            .output(OutputPort::new("value", DataType::list(DataType::Any))))
    }

    fn execute(
        &self,
        request: NodeRequest,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let left = request.input("left").cloned().unwrap_or(Value::Null);
            let right = request.input("right").cloned().unwrap_or(Value::Null);
            let mut out = NodeValues::new();
            out.insert("value".into(), json!([left, right]));
            Ok(out)
        })
    }
}

/// Registry with every mock node type, wired to `probe`.
pub fn mock_registry(probe: &Probe) -> NodeTypeRegistry {
    let mut registry = NodeTypeRegistry::new();
    registry.register(EchoNode {
        probe: probe.clone(),
    });
    registry.register(SleepNode {
        probe: probe.clone(),
    });
    registry.register(FailingNode);
    registry.register(PanicNode);
    registry.register(BadOutputNode);
    registry.register(TypedNode);
    registry.register(JoinNode);
    registry
}

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::NodeError;
use crate::node::{NodeConfig, NodeContext, NodeRequest, NodeValues, PortDeclaration};
use crate::types::{LogLevel, NodeId};

/// Node type: an opaque executable unit with a declared input/output contract.
pub trait NodeType: Send + Sync + 'static {
    /// Type tag referenced by graph documents (e.g. `net.tcp_probe`).
    fn type_tag(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Palette category shown by the UI.
    fn category(&self) -> &str {
        "General"
    }

    /// Describe the ports for this configuration. Invalid configuration is
    /// reported here, before any run exists.
    fn ports(&self, config: &NodeConfig) -> Result<PortDeclaration, NodeError>;

    /// Check already-coerced input values before the node runs.
    fn validate_inputs(&self, request: &NodeRequest) -> Result<(), NodeError> {
        let _ = request;
        Ok(())
    }

    /// Run the node logic. Implementations should watch `ctx.cancel` at
    /// their suspension points.
    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>>;

    /// Timeout in seconds for this node type. `None` uses the engine default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Lookup of node types by tag.
pub trait NodeCatalog: Send + Sync {
    fn lookup(&self, type_tag: &str) -> Option<Arc<dyn NodeType>>;
}

/// Receiver for lines of node output.
pub trait NodeLogSink: Send + Sync + 'static {
    fn log(&self, node: &NodeId, level: LogLevel, message: String);
}

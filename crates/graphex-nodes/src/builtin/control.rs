use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use graphex_core::node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
use graphex_core::traits::NodeType;
use graphex_core::{DataType, NodeError};

use super::{cancellable, outputs};

/// Waits, then passes its input through. Useful for pacing probes.
pub struct DelayNode;

impl NodeType for DelayNode {
    fn type_tag(&self) -> &str {
        "control.delay"
    }

    fn description(&self) -> &str {
        "Wait for a number of milliseconds, then pass the value through."
    }

    fn category(&self) -> &str {
        "Control"
    }

    fn ports(&self, _config: &NodeConfig) -> Result<PortDeclaration, NodeError> {
        Ok(PortDeclaration::new()
            .input(
                InputPort::new("millis", DataType::Integer)
                    .optional()
                    .with_default(json!(1000)),
            )
            .input(InputPort::new("value", DataType::Any).optional())
            .output(OutputPort::new("value", DataType::Any)))
    }

    fn validate_inputs(&self, request: &NodeRequest) -> Result<(), NodeError> {
        match request.input("millis") {
            Some(v) if v.as_u64().is_none() => {
                Err(NodeError::input("millis", "must be a non-negative integer"))
            }
            _ => Ok(()),
        }
    }

    fn execute(
        &self,
        request: NodeRequest,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<NodeValues, NodeError>> {
        Box::pin(async move {
            let millis = request.opt_u64_input("millis").unwrap_or(1000);
            cancellable(&ctx, tokio::time::sleep(Duration::from_millis(millis))).await?;
            let value = request.inputs.get("value").cloned().unwrap_or(Value::Null);
            Ok(outputs([("value", value)]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphex_core::RunId;

    fn request(millis: i64) -> NodeRequest {
        let mut inputs = NodeValues::new();
        inputs.insert("millis".into(), json!(millis));
        inputs.insert("value".into(), json!("carried"));
        NodeRequest {
            node_id: "wait".into(),
            config: NodeConfig::new(),
            inputs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_passes_value_through() {
        let ctx = NodeContext::detached(RunId::new(), "wait".into(), ".");
        let out = DelayNode.execute(request(250), ctx).await.unwrap();
        assert_eq!(out["value"], json!("carried"));
    }

    #[tokio::test]
    async fn test_delay_honors_cancellation() {
        let ctx = NodeContext::detached(RunId::new(), "wait".into(), ".");
        ctx.cancel.cancel();
        let err = DelayNode.execute(request(60_000), ctx).await.unwrap_err();
        assert_eq!(err, NodeError::Cancelled);
    }

    #[test]
    fn test_negative_delay_rejected() {
        assert!(matches!(
            DelayNode.validate_inputs(&request(-5)),
            Err(NodeError::InputBinding { .. })
        ));
    }
}

pub mod control;
pub mod filesystem;
pub mod git;
pub mod network;
pub mod shell;
pub mod value;

use std::future::Future;

use serde::de::DeserializeOwned;
use serde_json::Value;

use graphex_core::node::{NodeConfig, NodeContext, NodeValues};
use graphex_core::NodeError;

/// Deserialize a node's configuration into its typed form.
pub(crate) fn parse_config<T: DeserializeOwned>(config: &NodeConfig) -> Result<T, NodeError> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| NodeError::InvalidConfig(e.to_string()))
}

/// Await `fut` unless the node is cancelled first.
pub(crate) async fn cancellable<F, T>(ctx: &NodeContext, fut: F) -> Result<T, NodeError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
        out = fut => Ok(out),
    }
}

pub(crate) fn outputs<const N: usize>(pairs: [(&str, Value); N]) -> NodeValues {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

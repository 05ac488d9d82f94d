use std::sync::Arc;

use graphex_core::config::GatewayConfig;
use graphex_engine::Engine;
use graphex_nodes::NodeTypeRegistry;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
    pub registry: Arc<NodeTypeRegistry>,
}

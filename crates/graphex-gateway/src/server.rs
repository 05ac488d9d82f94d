use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use graphex_core::config::GatewayConfig;
use graphex_engine::Engine;
use graphex_nodes::NodeTypeRegistry;

use crate::routes;
use crate::state::AppState;

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<Engine>,
    registry: Arc<NodeTypeRegistry>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        engine: Arc<Engine>,
        registry: Arc<NodeTypeRegistry>,
    ) -> Self {
        Self {
            config,
            engine,
            registry,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
            registry: self.registry.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        self.engine.shutdown();
        info!("Gateway shut down");
        Ok(())
    }
}

/// All gateway routes over the given state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route("/api/node-types", get(routes::list_node_types))
        .route("/api/graphs/validate", post(routes::validate_graph))
        .route("/api/runs", get(routes::list_runs).post(routes::submit_run))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

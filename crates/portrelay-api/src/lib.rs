//! HTTP control surface for a forwarder registry
//!
//! A single `POST /api/control` endpoint takes a JSON body naming an operation
//! (`details`, `start`, `stop`, `add`/`insert`, `remove`/`delete`) and the
//! shared-secret token. Everything else about the forwarders lives in
//! `portrelay-core`.

pub mod error;
pub mod handlers;
pub mod models;

use axum::{
    routing::{get, post},
    Json, Router,
};
use portrelay_core::Registry;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

pub use error::ControlError;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<Registry>,
    pub token: String,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "portrelay control API",
        version = "0.1.0",
        description = "Add, remove, start and stop TCP forwarders at runtime"
    ),
    paths(handlers::control, handlers::health_check),
    components(schemas(
        models::ControlRequest,
        models::DetailRecord,
        models::HealthResponse,
    )),
    tags(
        (name = "control", description = "Forwarder lifecycle operations"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Shared secret every control request must carry
    pub token: String,
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, registry: Arc<Registry>) -> Self {
        let state = Arc::new(AppState {
            registry,
            token: config.token.clone(),
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/api/control", post(handlers::control))
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_json))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        info!("Starting API server on {}", listener.local_addr()?);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

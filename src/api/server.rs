//! HTTP server

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Orchestrator;
use super::handlers::{self, AppState};

/// Routes for the node API, without a listener
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state: AppState = orchestrator;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Instances
        .route(
            "/api/v1/instances",
            get(handlers::list_instances).post(handlers::provision),
        )
        .route(
            "/api/v1/instances/:id",
            get(handlers::get_instance).delete(handlers::deprovision),
        )
        .route("/api/v1/instances/:id/logs", get(handlers::get_logs))
        .route("/api/v1/instances/:id/logs/stream", get(handlers::stream_logs))
        .route("/api/v1/instances/:id/ports", post(handlers::publish_port))

        // Node
        .route("/api/v1/drain", post(handlers::drain))

        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// HTTP API Server
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Create a new server
    pub fn new(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Self {
        Self {
            router: router(orchestrator),
            addr,
        }
    }

    /// Run the server until the process is killed
    pub async fn run(self) -> Result<(), std::io::Error> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves, then finish in-flight requests
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

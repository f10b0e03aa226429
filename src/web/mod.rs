//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::monitor::MonitorControl;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub monitor: MonitorControl,
}

/// REST interface over [`MonitorControl`].
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, monitor: MonitorControl) -> Self {
        Self {
            state: AppState { config, monitor },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
        let process = "/api/services/{id}/processes/{identifier}";

        Router::new()
            .route(
                "/api/services",
                get(handlers::handle_get_services).post(handlers::handle_create_service),
            )
            .route(
                "/api/services/{id}",
                delete(handlers::handle_delete_service),
            )
            .route(
                "/api/services/{id}/processes",
                get(handlers::handle_get_processes).post(handlers::handle_create_process),
            )
            .route(
                "/api/services/{id}/measurements",
                get(handlers::handle_get_service_measurements),
            )
            .route(process, delete(handlers::handle_delete_process))
            .route(
                &format!("{}/measurements", process),
                get(handlers::handle_get_measurements).delete(handlers::handle_delete_measurements),
            )
            .route(
                &format!("{}/triggers", process),
                get(handlers::handle_get_triggers).post(handlers::handle_add_trigger),
            )
            .route(
                &format!("{}/triggers/{{index}}", process),
                put(handlers::handle_update_trigger).delete(handlers::handle_delete_trigger),
            )
            .route(&format!("{}/pause", process), post(handlers::handle_pause_process))
            .route(&format!("{}/resume", process), post(handlers::handle_resume_process))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

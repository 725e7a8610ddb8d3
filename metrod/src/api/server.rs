//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::routes;
use crate::services::ServiceContainer;
use crate::{Error, Result};

/// Request body size limit: plugin binaries come through multipart.
const BODY_LIMIT: usize = 128 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub container: Arc<ServiceContainer>,
}

/// API server.
pub struct ApiServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(container: Arc<ServiceContainer>) -> Self {
        Self {
            state: AppState { container },
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(BODY_LIMIT))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let config = &self.state.container.config;
        let addr: SocketAddr = format!("{}:{}", config.api_bind_address, config.api_port)
            .parse()
            .map_err(|e| Error::config(format!("invalid api address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an existing listener; used by tests to bind port 0.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let router = self.build_router();
        tracing::info!("api server listening on http://{}", listener.local_addr()?);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("api server shutting down");
            })
            .await
            .map_err(|e| Error::config(format!("server error: {e}")))?;
        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

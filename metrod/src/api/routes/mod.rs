//! API route modules.
//!
//! One module per resource, each contributing a router nested under
//! `/v1`.

pub mod metrics;
pub mod plugins;
pub mod tasks;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/v1/plugins", plugins::router())
        .nest("/v1/metrics", metrics::router())
        .nest("/v1/tasks", tasks::router())
        .with_state(state)
}

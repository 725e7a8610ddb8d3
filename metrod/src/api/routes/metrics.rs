//! Metric catalog routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/v1/metrics` | Whole catalog |
//! | GET | `/v1/metrics/{*namespace}?ver=N` | Wildcard-enabled fetch |

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::api::models::MetricView;
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_metrics))
        .route("/{*namespace}", get(fetch_metrics))
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    /// Requested version; 0 or absent means latest.
    #[serde(default)]
    ver: u32,
}

async fn list_metrics(State(state): State<AppState>) -> Json<Vec<MetricView>> {
    let records = state
        .container
        .catalog
        .table()
        .into_values()
        .flatten()
        .map(MetricView::from)
        .collect();
    Json(records)
}

async fn fetch_metrics(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<FetchParams>,
) -> ApiResult<Json<Vec<MetricView>>> {
    let namespace = format!("/{}", namespace.trim_start_matches('/'));
    let records = state.container.catalog.fetch(&namespace, params.ver)?;
    Ok(Json(records.into_iter().map(MetricView::from).collect()))
}

//! Task routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/v1/tasks` | Create a task (JSON or YAML manifest) |
//! | GET | `/v1/tasks` | List tasks |
//! | GET | `/v1/tasks/{id}` | Task detail |
//! | DELETE | `/v1/tasks/{id}` | Remove (stopped tasks only) |
//! | PUT | `/v1/tasks/{id}/start\|stop\|enable` | Lifecycle |
//! | GET | `/v1/tasks/{id}/export` | Re-importable manifest |
//! | GET | `/v1/tasks/{id}/watch` | Streaming JSON-lines watch |

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{TaskManifest, TaskView};
use crate::api::server::AppState;
use crate::scheduler::{parse_duration, CreateTask};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/{id}", get(get_task).delete(remove_task))
        .route("/{id}/start", put(start_task))
        .route("/{id}/stop", put(stop_task))
        .route("/{id}/enable", put(enable_task))
        .route("/{id}/export", get(export_task))
        .route("/{id}/watch", get(watch_task))
}

/// Parse a manifest from JSON or YAML, driven by content type with a
/// parse fallback.
fn parse_manifest(headers: &HeaderMap, body: &[u8]) -> ApiResult<TaskManifest> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let manifest: TaskManifest = if content_type.contains("yaml") {
        serde_yaml::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))?
    } else {
        match serde_json::from_slice(body) {
            Ok(manifest) => manifest,
            Err(json_err) => serde_yaml::from_slice(body)
                .map_err(|_| ApiError::bad_request(json_err.to_string()))?,
        }
    };
    if manifest.version != 1 {
        return Err(ApiError::bad_request("Invalid version provided"));
    }
    Ok(manifest)
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let manifest = parse_manifest(&headers, &body)?;
    let deadline = manifest
        .deadline
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    let task = state
        .container
        .scheduler
        .create_task(CreateTask {
            name: manifest.name,
            schedule: manifest.schedule,
            workflow: manifest.workflow,
            deadline,
            stop_on_failure: manifest.stop_on_failure,
            start: manifest.start,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(TaskView::from(task))).into_response())
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskView>> {
    let tasks = state
        .container
        .scheduler
        .list_tasks()
        .await
        .into_iter()
        .map(TaskView::from)
        .collect();
    Json(tasks)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    let task = state.container.scheduler.get_task(&id).await?;
    Ok(Json(TaskView::from(task)))
}

async fn remove_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    let task = state.container.scheduler.remove_task(&id).await?;
    Ok(Json(TaskView::from(task)))
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    state.container.scheduler.start_task(&id).await?;
    let task = state.container.scheduler.get_task(&id).await?;
    Ok(Json(TaskView::from(task)))
}

async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    state.container.scheduler.stop_task(&id).await?;
    let task = state.container.scheduler.get_task(&id).await?;
    Ok(Json(TaskView::from(task)))
}

async fn enable_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    state.container.scheduler.enable_task(&id).await?;
    let task = state.container.scheduler.get_task(&id).await?;
    Ok(Json(TaskView::from(task)))
}

async fn export_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskManifest>> {
    let task = state.container.scheduler.get_task(&id).await?;
    Ok(Json(TaskManifest::from_task(&task)))
}

async fn watch_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let watch = state.container.scheduler.watch_task(&id)?;

    // One JSON object per line; the stream ends when the task goes
    // away or the watcher lags out.
    let stream = futures::stream::unfold(watch, |mut watch| async move {
        let event = watch.next().await?;
        let mut line = serde_json::to_vec(&event).ok()?;
        line.push(b'\n');
        Some((
            Ok::<_, std::convert::Infallible>(Bytes::from(line)),
            watch,
        ))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}

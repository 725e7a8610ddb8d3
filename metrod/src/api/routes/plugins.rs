//! Plugin management routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/v1/plugins` | Upload and load a plugin (multipart) |
//! | GET | `/v1/plugins` | List loaded plugins, `?details=1` adds instances |
//! | GET | `/v1/plugins/{type}/{name}/{version}` | Plugin record, `?download=1` streams the artifact |
//! | DELETE | `/v1/plugins/{type}/{name}/{version}` | Unload |

use std::collections::HashMap;
use std::io::Read;
use std::path::Path as FsPath;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{PluginListResponse, PluginView};
use crate::api::server::AppState;
use crate::plugin::requested::{hash_bytes, RequestedPlugin};
use crate::plugin::{PluginId, PluginType};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_plugins).post(load_plugin))
        .route(
            "/{type}/{name}/{version}",
            get(get_plugin).delete(unload_plugin),
        )
}

/// Decompress a part when the `Plugin-Compression: gzip` header is set.
fn maybe_decompress(headers: &HeaderMap, bytes: Vec<u8>) -> ApiResult<Vec<u8>> {
    let compressed = headers
        .get("Plugin-Compression")
        .and_then(|v| v.to_str().ok())
        == Some("gzip");
    if !compressed {
        return Ok(bytes);
    }
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ApiError::internal(format!("gzip decode failed: {e}")))?;
    Ok(out)
}

fn is_signature(filename: &str) -> bool {
    FsPath::new(filename).extension().and_then(|e| e.to_str()) == Some("asc")
}

async fn load_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut artifact: Option<(String, Vec<u8>)> = None;
    let mut signature: Option<Vec<u8>> = None;

    let mut index = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::internal(format!("multipart read failed: {e}")))?
    {
        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("part-{index}"));
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::internal(format!("multipart read failed: {e}")))?
            .to_vec();
        let bytes = maybe_decompress(&headers, bytes)?;

        match index {
            0 => {
                if is_signature(&filename) {
                    return Err(ApiError::internal(
                        "first file passed to load plugin api can not be signature file",
                    ));
                }
                artifact = Some((filename, bytes));
            }
            1 => {
                if !is_signature(&filename) {
                    return Err(ApiError::internal("second file passed was not a signature file"));
                }
                signature = Some(bytes);
            }
            _ => {
                return Err(ApiError::bad_request(
                    "more than two files passed to the load plugin api",
                ));
            }
        }
        index += 1;
    }

    let (filename, bytes) =
        artifact.ok_or_else(|| ApiError::bad_request("no plugin file supplied"))?;
    // Digest of what came over the wire; the post-write equality check
    // below is mandatory.
    let wire_digest = hash_bytes(&bytes);

    let path = state
        .container
        .write_upload(&filename, &bytes)
        .map_err(ApiError::from)?;

    let result = async {
        let mut requested = RequestedPlugin::from_path(&path)?;
        requested.verify_checksum(&wire_digest)?;
        if let Some(signature) = signature {
            requested.set_signature(signature);
        }
        info!(path = %path.display(), "loading plugin");
        state.container.manager.load(requested).await
    }
    .await;

    match result {
        Ok(plugin) => Ok((StatusCode::CREATED, Json(PluginView::from(plugin))).into_response()),
        Err(e) => {
            state.container.discard_upload(&path);
            Err(e.into())
        }
    }
}

async fn list_plugins(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<PluginListResponse> {
    let loaded = state
        .container
        .manager
        .loaded_plugins()
        .into_iter()
        .map(PluginView::from)
        .collect();
    let available = if params.contains_key("details") {
        state.container.pools.available()
    } else {
        Vec::new()
    };
    Json(PluginListResponse { loaded, available })
}

fn parse_identity(plugin_type: &str, name: &str, version: &str) -> ApiResult<PluginId> {
    let version: u32 = version
        .parse()
        .map_err(|_| ApiError::bad_request("invalid version"))?;
    if name.is_empty() {
        return Err(ApiError::bad_request("missing plugin name"));
    }
    let plugin_type: PluginType = plugin_type
        .parse()
        .map_err(|_| ApiError::bad_request("invalid plugin type"))?;
    Ok(PluginId::new(plugin_type, name, version))
}

async fn get_plugin(
    State(state): State<AppState>,
    Path((plugin_type, name, version)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let id = parse_identity(&plugin_type, &name, &version)?;
    let plugin = state
        .container
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::not_found("plugin not found"))?;

    let download = params.get("download").map(String::as_str) == Some("1");
    if !download {
        return Ok(Json(PluginView::from(plugin)).into_response());
    }

    let bytes = std::fs::read(&plugin.path)
        .map_err(|e| ApiError::internal(format!("failed to read artifact: {e}")))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&bytes)
        .and_then(|_| encoder.finish())
        .map(|compressed| {
            (
                [
                    ("Content-Encoding", "gzip"),
                    ("Content-Type", "application/octet-stream"),
                ],
                compressed,
            )
                .into_response()
        })
        .map_err(|e| ApiError::internal(format!("gzip encode failed: {e}")))
}

async fn unload_plugin(
    State(state): State<AppState>,
    Path((plugin_type, name, version)): Path<(String, String, String)>,
) -> ApiResult<Json<PluginView>> {
    let id = parse_identity(&plugin_type, &name, &version)?;
    let plugin = state.container.manager.unload(&id).await?;
    Ok(Json(PluginView::from(plugin)))
}

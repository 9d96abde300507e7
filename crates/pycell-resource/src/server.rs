//! In-container resource service
//!
//! Serves the resource port of a sandbox container: file and archive
//! transfer rooted at the working directory, server-side copy and delete,
//! Python module sources, and tool-client generation. All paths are
//! resolved strictly under the server root.

use std::collections::HashMap;
use std::path::{Component, Path as FsPath, PathBuf};

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use pycell_spec::{validate_server_name, ToolServerParams, TOOLS_NAMESPACE};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::archive::{pack_dir, unpack_archive, ArchiveError};
use crate::modules::{ModuleError, ModuleResolver};

/// Shared state of the resource service
#[derive(Clone)]
pub struct ServerState {
    root: PathBuf,
    resolver: ModuleResolver,
}

impl ServerState {
    pub fn new(root: PathBuf, python: impl Into<String>) -> Self {
        Self {
            root,
            resolver: ModuleResolver::new(python),
        }
    }
}

/// Build the resource service router
pub fn app(state: ServerState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route(
            "/files/{*path}",
            put(upload_file).get(download_file).delete(delete_path),
        )
        .route("/dirs/{*path}", put(upload_dir).get(download_dir))
        .route("/copy", post(copy_path))
        .route("/modules", get(module_sources))
        .route("/tools", post(generate_tools))
        .route("/tools/{server_name}", get(fetch_tools))
        .with_state(state)
}

/// Error surface of the resource service, mapped to HTTP statuses
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::Io(io) => io.into(),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// Resolve a request path strictly under the server root
fn resolve(root: &FsPath, rel: &str) -> Result<PathBuf, ApiError> {
    let rel_path = FsPath::new(rel);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "path {rel:?} escapes the server root"
                )))
            }
        }
    }
    Ok(root.join(rel_path))
}

async fn status() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn upload_file(
    State(state): State<ServerState>,
    Path(path): Path<String>,
    request: Request,
) -> Result<StatusCode, ApiError> {
    let target = resolve(&state.root, &path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&target).await?;
    let mut body = request.into_body().into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("body read failed: {e}")))?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    tracing::debug!(path = %path, bytes = written, "file uploaded");
    Ok(StatusCode::NO_CONTENT)
}

async fn download_file(
    State(state): State<ServerState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let target = resolve(&state.root, &path)?;
    let metadata = tokio::fs::metadata(&target)
        .await
        .map_err(|_| ApiError::NotFound(format!("no file at {path:?}")))?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound(format!("{path:?} is not a file")));
    }

    let file = tokio::fs::File::open(&target).await?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

async fn delete_path(
    State(state): State<ServerState>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let target = resolve(&state.root, &path)?;
    match tokio::fs::metadata(&target).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&target).await?,
        Ok(_) => tokio::fs::remove_file(&target).await?,
        // Deleting something that is already gone is not an error
        Err(_) => {}
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_dir(
    State(state): State<ServerState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let target = resolve(&state.root, &path)?;

    // Extract into a staging directory, then swap it in so the target never
    // holds a partial tree
    tokio::fs::create_dir_all(&state.root).await?;
    let staging = tempfile::tempdir_in(&state.root)
        .map_err(|e| ApiError::Internal(format!("staging directory: {e}")))?;
    unpack_archive(body.to_vec(), staging.path()).await?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(&target).await.is_ok() {
        tokio::fs::remove_dir_all(&target).await?;
    }
    let staging_path = staging.into_path();
    tokio::fs::rename(&staging_path, &target).await?;

    tracing::debug!(path = %path, "directory uploaded");
    Ok(StatusCode::NO_CONTENT)
}

async fn download_dir(
    State(state): State<ServerState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let target = resolve(&state.root, &path)?;
    let metadata = tokio::fs::metadata(&target)
        .await
        .map_err(|_| ApiError::NotFound(format!("no directory at {path:?}")))?;
    if !metadata.is_dir() {
        return Err(ApiError::NotFound(format!("{path:?} is not a directory")));
    }

    let data = pack_dir(&target).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-tar")],
        Body::from(data),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct CopyRequest {
    src: String,
    dst: String,
}

async fn copy_path(
    State(state): State<ServerState>,
    Json(request): Json<CopyRequest>,
) -> Result<StatusCode, ApiError> {
    let src = resolve(&state.root, &request.src)?;
    let dst = resolve(&state.root, &request.dst)?;

    let metadata = tokio::fs::metadata(&src)
        .await
        .map_err(|_| ApiError::NotFound(format!("no file or directory at {:?}", request.src)))?;

    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(&dst).await.is_ok() {
        delete_any(&dst).await?;
    }

    if metadata.is_dir() {
        let (src, dst) = (src.clone(), dst.clone());
        tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
            .await
            .map_err(|e| ApiError::Internal(format!("copy task failed: {e}")))??;
    } else {
        tokio::fs::copy(&src, &dst).await?;
    }

    tracing::debug!(src = %request.src, dst = %request.dst, "copied");
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_any(path: &FsPath) -> Result<(), ApiError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(tokio::fs::remove_dir_all(path).await?),
        Ok(_) => Ok(tokio::fs::remove_file(path).await?),
        Err(_) => Ok(()),
    }
}

fn copy_dir_recursive(src: &FsPath, dst: &FsPath) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

async fn module_sources(
    State(state): State<ServerState>,
    RawQuery(query): RawQuery,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    let names: Vec<String> = query
        .as_deref()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.strip_prefix("q="))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    if names.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one q=<module> parameter is required".to_string(),
        ));
    }

    let mut sources = HashMap::new();
    for name in names {
        let source = state.resolver.source(&name).await.map_err(|e| match e {
            ModuleError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            ModuleError::NotPurePython { .. } => ApiError::Unprocessable(e.to_string()),
            ModuleError::Lookup { .. } => ApiError::Internal(e.to_string()),
        })?;
        sources.insert(name, source);
    }
    Ok(Json(sources))
}

#[derive(Debug, Deserialize)]
struct GenerateToolsRequest {
    server_name: String,
    server_params: ToolServerParams,
}

async fn generate_tools(
    State(state): State<ServerState>,
    Json(request): Json<GenerateToolsRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    validate_server_name(&request.server_name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    request
        .server_params
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let namespace_root = state.root.join(TOOLS_NAMESPACE);
    let tools = pycell_mcp::generate_tool_clients(
        &request.server_params,
        &namespace_root,
        &request.server_name,
    )
    .await
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        server = %request.server_name,
        tools = tools.len(),
        "tool clients generated"
    );
    Ok(Json(tools))
}

async fn fetch_tools(
    State(state): State<ServerState>,
    Path(server_name): Path<String>,
) -> Result<Response, ApiError> {
    validate_server_name(&server_name).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let dir = state.root.join(TOOLS_NAMESPACE).join(&server_name);
    if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(ApiError::NotFound(format!(
            "no generated tool clients for server {server_name:?}"
        )));
    }

    let data = pack_dir(&dir).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-tar")],
        Body::from(data),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_confined() {
        let root = FsPath::new("/srv/root");
        assert_eq!(
            resolve(root, "a/b.txt").unwrap(),
            PathBuf::from("/srv/root/a/b.txt")
        );
        assert!(resolve(root, "../b").is_err());
        assert!(resolve(root, "a/../../b").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
    }
}

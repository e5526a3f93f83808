//! Route handlers for the reference remote DAM-like store. Generalizes the
//! teacher's raw `std::fs`-under-`data/` handlers with stat, byte-range
//! reads, and rename, so `damshare-remotetree`'s full `RemoteTree` surface
//! has something real to talk to.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use axum::body::Bytes;
use axum::extract::{Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatDto {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub last_modified: i64,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub destination: String,
}

fn resolve(data_dir: &Path, rel: &str) -> PathBuf {
    data_dir.join(rel.trim_start_matches('/'))
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn stat_dto(rel: &str, full: &Path) -> Option<StatDto> {
    let meta = std::fs::metadata(full).ok()?;
    Some(StatDto {
        path: rel.to_string(),
        is_dir: meta.is_dir(),
        size: meta.len(),
        last_modified: mtime_ms(&meta),
    })
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn list_root(state: State<AppState>) -> Result<Json<Vec<StatDto>>, StatusCode> {
    list_dir(state, String::new()).await
}

pub async fn list_nested(
    state: State<AppState>,
    AxPath(path): AxPath<String>,
) -> Result<Json<Vec<StatDto>>, StatusCode> {
    list_dir(state, path).await
}

async fn list_dir(State(state): State<AppState>, rel: String) -> Result<Json<Vec<StatDto>>, StatusCode> {
    let dir = resolve(&state.data_dir, &rel);
    let entries = std::fs::read_dir(&dir).map_err(|_| StatusCode::NOT_FOUND)?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let name = entry.file_name().to_string_lossy().to_string();
        let child_rel = if rel.is_empty() { name } else { format!("{rel}/{name}") };
        if let Some(dto) = stat_dto(&child_rel, &entry.path()) {
            out.push(dto);
        }
    }
    Ok(Json(out))
}

pub async fn stat(State(state): State<AppState>, AxPath(path): AxPath<String>) -> Result<Json<StatDto>, StatusCode> {
    let full = resolve(&state.data_dir, &path);
    stat_dto(&path, &full).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// Supports byte-range reads via the `Range` header (spec §6: "byte-range
/// read"), falling back to the whole file when absent.
pub async fn get_file(
    State(state): State<AppState>,
    AxPath(path): AxPath<String>,
    headers: HeaderMap,
) -> Result<Vec<u8>, StatusCode> {
    let full = resolve(&state.data_dir, &path);
    let content = std::fs::read(&full).map_err(|_| StatusCode::NOT_FOUND)?;

    if let Some(range) = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok()) {
        if let Some((start, end)) = parse_range(range, content.len()) {
            return Ok(content[start..=end].to_vec());
        }
    }
    Ok(content)
}

fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() { len.saturating_sub(1) } else { end.parse().ok()? };
    if start >= len {
        return None;
    }
    Some((start, end.min(len.saturating_sub(1))))
}

/// Creates a new resource; `409 Conflict` if one already exists (the RQ
/// processor converts that into an update, spec §4.E).
pub async fn put_file(
    State(state): State<AppState>,
    AxPath(path): AxPath<String>,
    body: Bytes,
) -> StatusCode {
    let full = resolve(&state.data_dir, &path);
    if full.exists() {
        return StatusCode::CONFLICT;
    }
    write_file(&full, &body)
}

/// Updates an existing resource; `404` if missing (the RQ processor
/// converts that into a create, spec §4.E).
pub async fn post_file(
    State(state): State<AppState>,
    AxPath(path): AxPath<String>,
    body: Bytes,
) -> StatusCode {
    let full = resolve(&state.data_dir, &path);
    if !full.exists() {
        return StatusCode::NOT_FOUND;
    }
    write_file(&full, &body)
}

fn write_file(full: &Path, body: &[u8]) -> StatusCode {
    if let Some(parent) = full.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    match std::fs::write(full, body) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn delete_file(State(state): State<AppState>, AxPath(path): AxPath<String>) -> StatusCode {
    let full = resolve(&state.data_dir, &path);
    let meta = match std::fs::metadata(&full) {
        Ok(m) => m,
        Err(_) => return StatusCode::NOT_FOUND,
    };
    let result = if meta.is_dir() { std::fs::remove_dir_all(&full) } else { std::fs::remove_file(&full) };
    match result {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn patch_file(
    State(state): State<AppState>,
    AxPath(path): AxPath<String>,
    Json(req): Json<RenameRequest>,
) -> StatusCode {
    let old = resolve(&state.data_dir, &path);
    if !old.exists() {
        return StatusCode::NOT_FOUND;
    }
    let new = resolve(&state.data_dir, &req.destination);
    if let Some(parent) = new.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    match std::fs::rename(&old, &new) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn mkdir(State(state): State<AppState>, AxPath(path): AxPath<String>) -> StatusCode {
    let full = resolve(&state.data_dir, &path);
    match std::fs::create_dir_all(&full) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

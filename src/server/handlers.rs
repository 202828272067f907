use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::error::ApiError;
use super::AppState;
use crate::processing::shifts::ShiftCoefficients;
use crate::store::layout::{is_safe_chunk_name, DataKind};
use crate::store::RawChunk;

type ApiResult<T> = Result<T, ApiError>;

fn checked_chunk(chunk: &str) -> ApiResult<&str> {
    if is_safe_chunk_name(chunk) {
        Ok(chunk)
    } else {
        Err(ApiError::bad_request(format!("invalid chunk name `{}`", chunk)))
    }
}

async fn file_len(path: &FsPath) -> ApiResult<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(ApiError::not_found(path.display().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found(path.display().to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

async fn read_json_file(path: &FsPath) -> ApiResult<Json<serde_json::Value>> {
    file_len(path).await?;
    let bytes = tokio::fs::read(path).await?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::Internal(format!("{}: {}", path.display(), e)))?;
    Ok(Json(value))
}

async fn exists(path: &FsPath) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn header_value(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

// CONFIG & LISTING ------------------------------------------------------------

#[tracing::instrument(skip(state))]
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "config": state.config,
        "electrode_coords": state.geometry.as_ref().map(|g| &g.coords),
    }))
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub index: u64,
    pub size_bytes: u64,
    pub num_frames: u64,
    pub duration_sec: f64,
    pub has_filt: bool,
    pub has_shifted: bool,
    pub has_high_activity: bool,
    pub has_stats: bool,
    pub has_templates: bool,
    pub has_preview: bool,
}

#[derive(Debug, Serialize)]
pub struct FileList {
    pub files: Vec<FileEntry>,
}

#[tracing::instrument(skip(state))]
pub async fn list_files(State(state): State<Arc<AppState>>) -> ApiResult<Json<FileList>> {
    let layout = &state.layout;
    let frame_bytes = state.config.bytes_per_frame();
    let fs = state.config.sampling_frequency;

    let mut entries = Vec::new();
    let mut dir = match tokio::fs::read_dir(layout.raw_dir()).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(FileList { files: entries }))
        }
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }
        let Some(chunk) = RawChunk::from_path(&path) else {
            continue;
        };
        let size_bytes = entry.metadata().await?.len();
        let num_frames = size_bytes / frame_bytes;
        let name = chunk.name.clone();
        entries.push(FileEntry {
            has_filt: exists(&layout.filt_path(&name)).await,
            has_shifted: exists(&layout.shifted_path(&name)).await,
            has_high_activity: exists(&layout.high_activity_path(&name)).await,
            has_stats: exists(&layout.stats_path(&name)).await,
            has_templates: exists(&layout.templates_path(&name)).await,
            has_preview: exists(&layout.preview_path(&name)).await,
            index: chunk.index,
            size_bytes,
            num_frames,
            duration_sec: num_frames as f64 / fs,
            name,
        });
    }
    entries.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
    Ok(Json(FileList { files: entries }))
}

#[tracing::instrument(skip(state))]
pub async fn get_shift_coefficients(State(state): State<Arc<AppState>>) -> ApiResult<Json<ShiftCoefficients>> {
    let path = state.layout.shift_coeffs_path();
    file_len(&path).await?;
    let text = tokio::fs::read_to_string(&path).await?;
    let coefficients = serde_yaml::from_str(&text)
        .map_err(|e| ApiError::Internal(format!("{}: {}", path.display(), e)))?;
    Ok(Json(coefficients))
}

// ARTIFACTS -------------------------------------------------------------------

#[tracing::instrument(skip(state))]
pub async fn get_templates(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> ApiResult<Response> {
    let path = state.layout.templates_path(checked_chunk(&chunk)?);
    let len = file_len(&path).await?;
    let row_bytes = 4 * state.config.n_channels as u64;
    if len % row_bytes != 0 {
        return Err(ApiError::Corrupt(format!(
            "{} is {} bytes, not a multiple of {}",
            path.display(),
            len,
            row_bytes
        )));
    }
    let bytes = tokio::fs::read(&path).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert("x-num-templates", header_value(len / row_bytes));
    headers.insert("x-num-channels", header_value(state.config.n_channels));
    Ok((headers, bytes).into_response())
}

#[tracing::instrument(skip(state))]
pub async fn get_spikes(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    read_json_file(&state.layout.spikes_path(checked_chunk(&chunk)?)).await
}

#[tracing::instrument(skip(state))]
pub async fn get_high_activity(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    read_json_file(&state.layout.high_activity_path(checked_chunk(&chunk)?)).await
}

#[tracing::instrument(skip(state))]
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    read_json_file(&state.layout.stats_path(checked_chunk(&chunk)?)).await
}

// RANGE QUERY -----------------------------------------------------------------

/// A validated frame window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameWindow {
    pub start_frame: u64,
    pub end_frame: u64,
}

fn parse_seconds(params: &HashMap<String, String>, key: &str) -> ApiResult<Option<f64>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("{} must be a number, got `{}`", key, raw))),
    }
}

/// Maps a `[start, end)` request in seconds onto frames of a file holding
/// `total_frames` frames. Missing bounds default to the whole file.
pub fn frame_window(
    start_sec: Option<f64>,
    end_sec: Option<f64>,
    total_frames: u64,
    fs: f64,
) -> ApiResult<FrameWindow> {
    let duration = total_frames as f64 / fs;
    let start = start_sec.unwrap_or(0.0);
    let end = end_sec.unwrap_or(duration);
    if !(start.is_finite() && end.is_finite()) || start < 0.0 || start >= end || end > duration {
        return Err(ApiError::bad_request(format!(
            "invalid range [{}, {}) for a {} s recording",
            start, end, duration
        )));
    }
    let start_frame = ((start * fs).floor() as u64).min(total_frames);
    let end_frame = ((end * fs).floor() as u64).min(total_frames);
    Ok(FrameWindow {
        start_frame,
        end_frame: end_frame.max(start_frame),
    })
}

#[tracing::instrument(skip(state, params))]
pub async fn get_range(
    State(state): State<Arc<AppState>>,
    Path((kind, chunk)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let kind = DataKind::parse(&kind)
        .ok_or_else(|| ApiError::bad_request(format!("unknown data kind `{}`", kind)))?;
    let path = state.layout.data_path(kind, checked_chunk(&chunk)?);

    let n_channels = state.config.n_channels;
    let fs = state.config.sampling_frequency;
    let frame_bytes = state.config.bytes_per_frame();
    let len = file_len(&path).await?;
    let total_frames = crate::store::frames_in(&path, len, n_channels)?;

    let window = frame_window(
        parse_seconds(&params, "start_sec")?,
        parse_seconds(&params, "end_sec")?,
        total_frames,
        fs,
    )?;
    let bytes = read_window(&path, window, frame_bytes).await?;

    let num_frames = window.end_frame - window.start_frame;
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert("x-start-sec", header_value(window.start_frame as f64 / fs));
    headers.insert("x-end-sec", header_value(window.end_frame as f64 / fs));
    headers.insert("x-num-frames", header_value(num_frames));
    headers.insert("x-num-channels", header_value(n_channels));
    headers.insert("x-sampling-frequency", header_value(fs));
    Ok((headers, bytes).into_response())
}

async fn read_window(path: &FsPath, window: FrameWindow, frame_bytes: u64) -> ApiResult<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(window.start_frame * frame_bytes)).await?;
    let mut buf = vec![0u8; ((window.end_frame - window.start_frame) * frame_bytes) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

// PREVIEW ---------------------------------------------------------------------

#[tracing::instrument(skip(state, request))]
pub async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path((chunk, rel)): Path<(String, String)>,
    request: Request,
) -> ApiResult<Response> {
    let root = state.layout.preview_path(checked_chunk(&chunk)?);
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() || rel.split('/').any(|part| part == ".." || part.is_empty()) || rel.contains('\\') {
        return Err(ApiError::bad_request(format!("invalid preview path `{}`", rel)));
    }
    let file: PathBuf = root.join(rel);
    file_len(&file).await?;

    let response = ServeFile::new(file)
        .oneshot(request)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response.map(Body::new))
}

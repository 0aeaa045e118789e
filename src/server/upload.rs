//! Upload path (host mode): browser multipart drops, single-shot raw
//! bodies, and the parallel chunk protocol.

use crate::common::AppError;
use crate::host::ChunkHeaders;
use crate::server::state::AppState;
use crate::utils::{disk, security};
use anyhow::Context;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap};
use axum::response::Html;
use axum::Json;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Hard cap on any single uploaded artifact.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024 * 1024; // 10 GB
/// Chunk body bounds; the final chunk of a session may be smaller.
pub const MIN_CHUNK_BYTES: u64 = 64 * 1024;
pub const MAX_CHUNK_BYTES: u64 = 100 * 1024 * 1024;

/// Browser drop page.
pub async fn upload_page(
    UrlPath(token): UrlPath<String>,
    State(state): State<AppState>,
) -> Result<Html<&'static str>, AppError> {
    state.authorize(&token)?;
    const HTML: &str = include_str!("../../templates/upload.html");
    Ok(Html(HTML))
}

/// Chunking hints for parallel uploaders.
pub async fn manifest_handler(
    UrlPath(token): UrlPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, AppError> {
    state.authorize(&token)?;
    Ok(Json(json!({
        "chunk_size": state.settings.chunk_size,
        "max_concurrent": state.settings.max_concurrent,
    })))
}

/// `POST /u/{token}`: dispatch on headers to the right submission shape.
pub async fn upload_handler(
    UrlPath(token): UrlPath<String>,
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, AppError> {
    state.authorize(&token)?;
    state.metrics.incr("upload_requests_total");

    let upload_dir = state
        .config
        .upload_dir
        .clone()
        .ok_or_else(|| AppError::BadRequest("this endpoint is not accepting uploads".into()))?;
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .context("create upload directory")?;

    let headers = request.headers().clone();

    // Whole-request capacity check; chunked branches re-check against
    // their announced totals
    if let Some(announced) = content_length(&headers) {
        if announced > MAX_UPLOAD_BYTES {
            return Err(AppError::PayloadTooLarge(format!(
                "body of {} bytes exceeds the {} byte cap",
                announced, MAX_UPLOAD_BYTES
            )));
        }
        ensure_capacity(&upload_dir, announced)?;
    }

    if headers.contains_key("x-file-name") {
        let has_session = headers.contains_key("x-upload-session")
            && headers.contains_key("x-chunk-id")
            && headers.contains_key("x-chunk-total");

        if has_session {
            return chunk_upload(&state, &upload_dir, &headers, request.into_body()).await;
        }

        if headers.contains_key("x-upload-offset") {
            // The sequential offset protocol is gone; session uploads
            // cover resumption
            return Err(AppError::Conflict(
                "sequential offset uploads are no longer supported; use session-based chunk uploads"
                    .into(),
            ));
        }

        return raw_upload(&state, &upload_dir, &headers, request.into_body()).await;
    }

    let multipart = Multipart::from_request(request, &state)
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e)))?;
    multipart_upload(&state, &upload_dir, multipart).await
}

/// Parallel chunk shape: validate headers, find-or-create the session,
/// write at the offset, report the session's running state.
async fn chunk_upload(
    state: &AppState,
    upload_dir: &Path,
    headers: &HeaderMap,
    body: Body,
) -> Result<Json<Value>, AppError> {
    let chunk = parse_chunk_headers(headers)?;
    chunk.validate()?;

    if chunk.total_size > MAX_UPLOAD_BYTES {
        return Err(AppError::PayloadTooLarge(format!(
            "announced total of {} bytes exceeds the {} byte cap",
            chunk.total_size, MAX_UPLOAD_BYTES
        )));
    }
    ensure_capacity(upload_dir, chunk.total_size)?;

    let bytes = axum::body::to_bytes(body, (MAX_CHUNK_BYTES + 1) as usize)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed reading chunk body: {}", e)))?;

    let len = bytes.len() as u64;
    // A zero-byte chunk is only meaningful for an empty file
    if (len == 0 && chunk.total_size != 0) || len > MAX_CHUNK_BYTES {
        return Err(AppError::BadRequest(format!(
            "chunk of {} bytes outside {}..{}",
            len, MIN_CHUNK_BYTES, MAX_CHUNK_BYTES
        )));
    }
    let is_last = chunk.chunk_id == chunk.chunk_total - 1;
    if !is_last && len < MIN_CHUNK_BYTES {
        return Err(AppError::BadRequest(format!(
            "non-final chunk of {} bytes below the {} byte minimum",
            len, MIN_CHUNK_BYTES
        )));
    }

    let session = state.sessions.lookup_or_create(&chunk, upload_dir)?;
    let outcome = state.sessions.write_chunk(&session, &chunk, bytes).await?;

    state.metrics.incr("chunks_received_total");
    state.metrics.observe("chunk_bytes", len);

    Ok(Json(json!({
        "success": true,
        "filename": outcome.filename,
        "received": outcome.received,
        "chunk_id": outcome.chunk_id,
        "complete": outcome.complete,
    })))
}

/// Single-shot raw body named by `X-File-Name`.
async fn raw_upload(
    state: &AppState,
    upload_dir: &Path,
    headers: &HeaderMap,
    body: Body,
) -> Result<Json<Value>, AppError> {
    let filename = decoded_filename(headers)?;
    let announced = header_u64(headers, "x-upload-total")
        .transpose()?
        .or_else(|| content_length(headers));

    let (file, path) = security::create_unique_file(upload_dir, &filename)
        .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("open upload target")))?;
    if let Some(announced) = announced {
        crate::transfer::io::preallocate(&file, announced).map_err(AppError::Internal)?;
    }

    let final_name = basename(&path);
    state.progress.register(&final_name, &final_name, announced.unwrap_or(0));

    let written = match copy_body_to_file(state, &final_name, file, body).await {
        Ok(written) => written,
        Err(e) => {
            // Partial artifact is useless; remove it before reporting
            state.progress.remove(&final_name);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
    };

    state.progress.mark_complete(&final_name);
    state.metrics.add("upload_bytes_total", written);
    tracing::info!(file = %final_name, bytes = written, "raw upload complete");

    Ok(Json(json!({
        "success": true,
        "filename": final_name,
        "size": written,
    })))
}

/// Browser multipart form: one file per part, written as it streams in.
async fn multipart_upload(
    state: &AppState,
    upload_dir: &Path,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut stored: Vec<String> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        let Some(raw_name) = field.file_name().map(|n| n.to_string()) else {
            continue; // non-file form fields
        };
        let filename = security::sanitize_filename(&raw_name)
            .map_err(|e| AppError::BadRequest(format!("unsafe filename {:?}: {}", raw_name, e)))?;

        let (file, path) = security::create_unique_file(upload_dir, &filename)
            .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("open upload target")))?;
        let final_name = basename(&path);
        state.progress.register(&final_name, &final_name, 0);

        match copy_field_to_file(state, &final_name, file, field).await {
            Ok(written) => {
                state.progress.mark_complete(&final_name);
                state.metrics.incr("multipart_files_total");
                state.metrics.add("upload_bytes_total", written);
                tracing::info!(file = %final_name, bytes = written, "multipart file stored");
                stored.push(final_name);
            }
            Err(e) => {
                state.progress.remove(&final_name);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        }
    }

    if stored.is_empty() {
        return Err(AppError::BadRequest("no file parts in submission".into()));
    }

    Ok(Json(json!({
        "success": true,
        "files": stored,
    })))
}

async fn copy_body_to_file(
    state: &AppState,
    progress_id: &str,
    file: std::fs::File,
    body: Body,
) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::from_std(file);
    let mut written: u64 = 0;
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::Internal(anyhow::anyhow!("body read: {}", e)))?;
        written += chunk.len() as u64;
        if written > MAX_UPLOAD_BYTES {
            return Err(AppError::PayloadTooLarge(format!(
                "body exceeds the {} byte cap",
                MAX_UPLOAD_BYTES
            )));
        }
        file.write_all(&chunk).await?;
        state.progress.add_received(progress_id, chunk.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn copy_field_to_file(
    state: &AppState,
    progress_id: &str,
    file: std::fs::File,
    mut field: axum::extract::multipart::Field<'_>,
) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::from_std(file);
    let mut written: u64 = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| AppError::BadRequest(format!("multipart read: {}", e)))?
    {
        written += chunk.len() as u64;
        if written > MAX_UPLOAD_BYTES {
            return Err(AppError::PayloadTooLarge(format!(
                "file part exceeds the {} byte cap",
                MAX_UPLOAD_BYTES
            )));
        }
        file.write_all(&chunk).await?;
        state.progress.add_received(progress_id, chunk.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

fn parse_chunk_headers(headers: &HeaderMap) -> Result<ChunkHeaders, AppError> {
    Ok(ChunkHeaders {
        session_id: header_str(headers, "x-upload-session")?.to_string(),
        filename: decoded_filename(headers)?,
        total_size: header_u64(headers, "x-upload-total")
            .transpose()?
            .unwrap_or(0),
        chunk_total: header_u64(headers, "x-chunk-total")
            .transpose()?
            .ok_or_else(|| AppError::BadRequest("missing X-Chunk-Total".into()))?
            .try_into()
            .map_err(|_| AppError::BadRequest("X-Chunk-Total out of range".into()))?,
        chunk_id: header_u64(headers, "x-chunk-id")
            .transpose()?
            .ok_or_else(|| AppError::BadRequest("missing X-Chunk-Id".into()))?
            .try_into()
            .map_err(|_| AppError::BadRequest("X-Chunk-Id out of range".into()))?,
        offset: header_u64(headers, "x-upload-offset")
            .transpose()?
            .ok_or_else(|| AppError::BadRequest("missing X-Upload-Offset".into()))?,
        checksum: headers
            .get("x-chunk-checksum")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    })
}

fn decoded_filename(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = header_str(headers, "x-file-name")?;
    let decoded = urlencoding::decode(raw)
        .map_err(|_| AppError::BadRequest(format!("undecodable filename: {:?}", raw)))?;
    security::sanitize_filename(&decoded)
        .map_err(|e| AppError::BadRequest(format!("unsafe filename {:?}: {}", decoded, e)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest(format!("missing or non-ascii {} header", name)))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<Result<u64, AppError>> {
    let value = headers.get(name)?;
    Some(
        value
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| AppError::BadRequest(format!("malformed {} header", name))),
    )
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn ensure_capacity(upload_dir: &Path, needed: u64) -> Result<(), AppError> {
    if disk::has_capacity(upload_dir, needed) {
        Ok(())
    } else {
        Err(AppError::InsufficientStorage(format!(
            "not enough free space for {} bytes",
            needed
        )))
    }
}

fn basename(path: &PathBuf) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

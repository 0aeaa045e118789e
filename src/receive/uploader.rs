//! Parallel chunk uploader (host-mode client).
//!
//! Splits each file per the host's manifest hints and pushes chunks
//! concurrently. Every chunk retries with exponential backoff; a chunk
//! that exhausts its retries cancels the rest of the fleet through the
//! shared token.

use crate::common::TransferSettings;
use crate::transfer::io as chunk_io;
use crate::transfer::progress::ProgressAggregator;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct UploadOptions {
    /// `http://host:port/u/{token}`
    pub url: String,
    pub files: Vec<PathBuf>,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub cancel: CancellationToken,
    /// Aggregator the front end renders from; one entry per file
    pub progress: Option<ProgressAggregator>,
}

impl UploadOptions {
    pub fn new(url: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            url: url.into(),
            files,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

#[derive(Debug)]
pub struct UploadSummary {
    pub files: Vec<UploadedFile>,
}

#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: u64,
    pub chunks: u32,
    /// Total request attempts across all chunks (retries included)
    pub attempts: u64,
}

#[derive(serde::Deserialize)]
struct ChunkResponse {
    success: bool,
    #[allow(dead_code)]
    filename: String,
    #[allow(dead_code)]
    received: u64,
    #[allow(dead_code)]
    chunk_id: u32,
    complete: bool,
}

#[derive(serde::Deserialize)]
struct ManifestHints {
    chunk_size: u64,
    max_concurrent: usize,
}

pub struct ParallelUploader {
    http: reqwest::Client,
}

impl Default for ParallelUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelUploader {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub async fn upload(&self, opts: UploadOptions) -> Result<UploadSummary> {
        let hints = self.fetch_hints(&opts.url).await;
        let mut files = Vec::with_capacity(opts.files.len());

        for path in &opts.files {
            if opts.cancel.is_cancelled() {
                bail!("upload cancelled");
            }
            files.push(self.upload_file(path, &hints, &opts).await?);
        }

        Ok(UploadSummary { files })
    }

    /// Host-advertised chunking; sane defaults when the endpoint is older.
    async fn fetch_hints(&self, url: &str) -> TransferSettings {
        let manifest_url = format!("{}/manifest", url.trim_end_matches('/'));
        match self.http.get(&manifest_url).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<ManifestHints>()
                .await
                .map(|hints| TransferSettings {
                    chunk_size: hints.chunk_size.max(64 * 1024),
                    max_concurrent: hints.max_concurrent.clamp(1, 16),
                })
                .unwrap_or_default(),
            _ => TransferSettings::default(),
        }
    }

    async fn upload_file(
        &self,
        path: &Path,
        hints: &TransferSettings,
        opts: &UploadOptions,
    ) -> Result<UploadedFile> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        let size = metadata.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("source path has no filename")?;

        let chunk_size = hints.chunk_size;
        let chunk_total = size.div_ceil(chunk_size).max(1) as u32;
        let session_id = new_session_id();

        if let Some(progress) = &opts.progress {
            progress.register(&session_id, &filename, size);
        }

        let attempts = Arc::new(AtomicU64::new(0));
        let file = Arc::new(
            std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
        );

        tracing::debug!(
            file = %filename,
            size,
            chunk_total,
            chunk_size,
            concurrency = hints.max_concurrent,
            "starting parallel upload"
        );

        let complete = stream::iter(0..chunk_total)
            .map(|chunk_id| {
                let file = file.clone();
                let attempts = attempts.clone();
                let session_id = session_id.clone();
                let filename = filename.clone();
                async move {
                    let offset = chunk_id as u64 * chunk_size;
                    let len = chunk_size.min(size - offset.min(size)) as usize;
                    let payload = read_chunk(file, offset, len).await?;

                    self.send_chunk_with_retry(
                        opts,
                        &session_id,
                        &filename,
                        size,
                        chunk_total,
                        chunk_id,
                        offset,
                        payload,
                        &attempts,
                    )
                    .await
                }
            })
            .buffer_unordered(hints.max_concurrent)
            .try_fold(false, |acc, complete| async move { Ok(acc || complete) })
            .await
            .inspect_err(|_| {
                // One dead chunk dooms the file; stop the others quickly
                opts.cancel.cancel();
            })?;

        if !complete {
            bail!(
                "host never reported {} as complete ({} chunks sent)",
                filename,
                chunk_total
            );
        }

        if let Some(progress) = &opts.progress {
            progress.mark_complete(&session_id);
        }

        Ok(UploadedFile {
            filename,
            bytes: size,
            chunks: chunk_total,
            attempts: attempts.load(Ordering::SeqCst),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_chunk_with_retry(
        &self,
        opts: &UploadOptions,
        session_id: &str,
        filename: &str,
        total_size: u64,
        chunk_total: u32,
        chunk_id: u32,
        offset: u64,
        payload: Vec<u8>,
        attempts: &AtomicU64,
    ) -> Result<bool> {
        let checksum = hex::encode(Sha256::digest(&payload));
        let len = payload.len() as u64;

        for attempt in 1..=opts.retry_attempts {
            if opts.cancel.is_cancelled() {
                bail!("upload cancelled");
            }
            attempts.fetch_add(1, Ordering::SeqCst);

            let request = self
                .http
                .post(&opts.url)
                .header("content-type", "application/octet-stream")
                .header("x-upload-session", session_id)
                .header("x-file-name", urlencoding::encode(filename).into_owned())
                .header("x-upload-total", total_size)
                .header("x-chunk-total", chunk_total)
                .header("x-chunk-id", chunk_id)
                .header("x-upload-offset", offset)
                .header("x-chunk-checksum", &checksum)
                .body(payload.clone());

            let outcome = tokio::select! {
                _ = opts.cancel.cancelled() => bail!("upload cancelled"),
                response = request.send() => response,
            };

            match outcome {
                Ok(response) if response.status().is_success() => {
                    let body: ChunkResponse = response
                        .json()
                        .await
                        .context("parse chunk response")?;
                    if body.success {
                        if let Some(progress) = &opts.progress {
                            progress.add_received(session_id, len);
                        }
                        return Ok(body.complete);
                    }
                    tracing::warn!(chunk_id, attempt, "host rejected chunk");
                }
                Ok(response) => {
                    tracing::warn!(
                        chunk_id,
                        attempt,
                        status = %response.status(),
                        "chunk upload failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(chunk_id, attempt, error = %e, "chunk upload error");
                }
            }

            if attempt < opts.retry_attempts {
                let backoff = opts.retry_delay * 2u32.pow(attempt - 1);
                tokio::select! {
                    _ = opts.cancel.cancelled() => bail!("upload cancelled"),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        bail!(
            "chunk {} of {} failed after {} attempts",
            chunk_id,
            filename,
            opts.retry_attempts
        )
    }
}

async fn read_chunk(file: Arc<std::fs::File>, offset: u64, len: usize) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        chunk_io::read_chunk_at(&file, offset, &mut buf)?;
        Ok(buf)
    })
    .await
    .context("chunk read task")?
}

/// 32 hex chars: inside the host's 8..64 `[A-Za-z0-9_-]` window.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

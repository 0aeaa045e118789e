//! Download path: inline text, packed directories, and files, with
//! negotiated compression, streaming encryption, byte ranges, checksum
//! announcement, and per-client rate limiting.

use crate::common::AppError;
use crate::crypto::framing;
use crate::crypto::keys::{salt_to_base64, EncryptionKey};
use crate::server::state::AppState;
use crate::transfer::buffer_pool::BufferPool;
use crate::transfer::limiter::TokenBucket;
use crate::transfer::zipper;
use crate::utils::net;
use anyhow::Context;
use async_compression::tokio::bufread::{GzipEncoder, ZstdEncoder};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path as UrlPath, State};
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::Json;
use bytes::Bytes;
use futures::stream::Stream;
use futures::stream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio_util::io::ReaderStream;

/// Extensions worth running through an outer encoder.
const COMPRESSIBLE_EXTS: &[&str] = &[
    "txt", "html", "htm", "css", "js", "json", "xml", "svg", "csv", "log", "md", "yaml", "yml",
    "toml", "sql", "sh", "bat", "ps1",
];

/// Below this size the encoder overhead outweighs the savings.
const COMPRESS_MIN_BYTES: u64 = 1024;

pub async fn download_handler(
    UrlPath(token): UrlPath<String>,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response<Body>, AppError> {
    // Token gate comes before any filesystem access
    state.authorize(&token)?;
    state.metrics.incr("download_requests_total");

    let limiter = state
        .limiters
        .as_ref()
        .map(|registry| registry.for_client(&net::client_ip(&headers, peer)));

    if let Some(text) = &state.config.text {
        return serve_text(text);
    }

    let source = state
        .config
        .source
        .clone()
        .ok_or_else(|| AppError::NotFound("nothing is being served".to_string()))?;

    let metadata = tokio::fs::metadata(&source)
        .await
        .map_err(|_| AppError::NotFound("source file missing".to_string()))?;

    if metadata.is_dir() {
        return serve_directory(&state, &source, &headers, limiter).await;
    }

    serve_file(&state, &source, metadata.len(), &headers, limiter).await
}

/// `{encrypted, salt?}` so receivers can derive the password key.
pub async fn encrypt_info(State(state): State<AppState>) -> Json<Value> {
    match &state.salt {
        Some(salt) => Json(json!({
            "encrypted": true,
            "salt": salt_to_base64(salt),
        })),
        None => Json(json!({ "encrypted": false })),
    }
}

fn serve_text(text: &str) -> Result<Response<Body>, AppError> {
    // Inline text is small and ephemeral: no compression, no encryption,
    // no checksum, and caches must not keep it
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CONTENT_LENGTH, text.len())
        .header(header::CACHE_CONTROL, "no-store, no-cache")
        .body(Body::from(text.to_string()))
        .context("build text response")
        .map_err(AppError::Internal)
}

async fn serve_directory(
    state: &AppState,
    source: &Path,
    headers: &HeaderMap,
    limiter: Option<Arc<TokenBucket>>,
) -> Result<Response<Body>, AppError> {
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());

    let (file, len) = zipper::spool_zip(source.to_path_buf())
        .await
        .map_err(AppError::Internal)?;
    state.metrics.add("zip_bytes_total", len);

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", basename),
        );

    // Optional outer encoder around the archive stream
    let response = if accepts_encoding(headers, "zstd") {
        let encoder = ZstdEncoder::new(BufReader::new(file));
        builder
            .header(header::CONTENT_ENCODING, "zstd")
            .body(body_with_limit(ReaderStream::new(encoder), limiter))
    } else if accepts_encoding(headers, "gzip") {
        let encoder = GzipEncoder::new(BufReader::new(file));
        builder
            .header(header::CONTENT_ENCODING, "gzip")
            .body(body_with_limit(ReaderStream::new(encoder), limiter))
    } else {
        builder
            .header(header::CONTENT_LENGTH, len)
            .body(body_with_limit(
                pooled_file_stream(file, len, state.pools.for_expected(Some(len)).clone()),
                limiter,
            ))
    };

    response.context("build zip response").map_err(AppError::Internal)
}

async fn serve_file(
    state: &AppState,
    source: &Path,
    size: u64,
    headers: &HeaderMap,
    limiter: Option<Arc<TokenBucket>>,
) -> Result<Response<Body>, AppError> {
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let disposition = format!("attachment; filename=\"{}\"", basename);

    // Encryption wins over everything else: no ranges, no outer
    // compression, exact ciphertext length
    if let Some(key) = state.active_key() {
        return serve_encrypted(source, size, &disposition, &key, limiter).await;
    }

    if is_compressible(source) && size > COMPRESS_MIN_BYTES {
        let prefer_zstd = accepts_encoding(headers, "zstd");
        if prefer_zstd || accepts_encoding(headers, "gzip") {
            let sha256 = state.checksums.sha256_hex(source).await?;
            let file = tokio::fs::File::open(source).await?;
            let builder = Response::builder()
                .header(header::CONTENT_DISPOSITION, disposition)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header("x-content-sha256", sha256);

            // Compressed byte ranges are meaningless, so none are offered
            let response = if prefer_zstd {
                builder.header(header::CONTENT_ENCODING, "zstd").body(
                    body_with_limit(
                        ReaderStream::new(ZstdEncoder::new(BufReader::new(file))),
                        limiter,
                    ),
                )
            } else {
                builder.header(header::CONTENT_ENCODING, "gzip").body(
                    body_with_limit(
                        ReaderStream::new(GzipEncoder::new(BufReader::new(file))),
                        limiter,
                    ),
                )
            };
            return response
                .context("build compressed response")
                .map_err(AppError::Internal);
        }
    }

    // Identity path: the only one where byte ranges make sense. Large
    // files flow through the biggest buffer class.
    let sha256 = state.checksums.sha256_hex(source).await?;
    let start = parse_range_start(headers, size)?;

    let mut file = tokio::fs::File::open(source).await?;
    let pool = state.pools.for_expected(Some(size)).clone();

    let builder = Response::builder()
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, "bytes")
        .header("x-content-sha256", sha256);

    let response = match start {
        Some(start) => {
            file.seek(SeekFrom::Start(start)).await?;
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, size - 1, size),
                )
                .header(header::CONTENT_LENGTH, size - start)
                .body(body_with_limit(
                    pooled_file_stream(file, size - start, pool),
                    limiter,
                ))
        }
        None => builder
            .header(header::CONTENT_LENGTH, size)
            .body(body_with_limit(pooled_file_stream(file, size, pool), limiter)),
    };

    response
        .context("build file response")
        .map_err(AppError::Internal)
}

async fn serve_encrypted(
    source: &Path,
    size: u64,
    disposition: &str,
    key: &EncryptionKey,
    limiter: Option<Arc<TokenBucket>>,
) -> Result<Response<Body>, AppError> {
    let file = tokio::fs::File::open(source).await?;

    Response::builder()
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, framing::ciphertext_len(size))
        .header("x-encryption", "true")
        .body(body_with_limit(framing::encrypt_stream(file, key), limiter))
        .context("build encrypted response")
        .map_err(AppError::Internal)
}

/// `Range: bytes=S-` with S > 0, honoured on the identity path only.
fn parse_range_start(headers: &HeaderMap, size: u64) -> Result<Option<u64>, AppError> {
    let Some(raw) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };

    let spec = raw
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::BadRequest(format!("unsupported range unit: {}", raw)))?;
    let start_str = spec
        .strip_suffix('-')
        .ok_or_else(|| AppError::BadRequest(format!("unsupported range: {}", raw)))?;
    let start: u64 = start_str
        .parse()
        .map_err(|_| AppError::BadRequest(format!("malformed range: {}", raw)))?;

    if start == 0 {
        return Ok(None);
    }
    if start >= size {
        return Err(AppError::BadRequest(format!(
            "range start {} beyond size {}",
            start, size
        )));
    }
    Ok(Some(start))
}

fn is_compressible(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            COMPRESSIBLE_EXTS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn accepts_encoding(headers: &HeaderMap, encoding: &str) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|accepted| {
            accepted
                .split(',')
                .any(|item| item.trim().split(';').next() == Some(encoding))
        })
        .unwrap_or(false)
}

/// Stream a file through pooled buffers, `remaining` bytes at most. Each
/// read checks out a class buffer and hands it to the body without a copy;
/// the buffer returns to the pool when hyper drops the chunk.
fn pooled_file_stream(
    file: tokio::fs::File,
    remaining: u64,
    pool: Arc<BufferPool>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    stream::unfold((file, remaining), move |(mut file, remaining)| {
        let pool = pool.clone();
        async move {
            if remaining == 0 {
                return None;
            }
            let mut buf = pool.take().into_inner();
            let want = (buf.len() as u64).min(remaining) as usize;
            buf.truncate(want);

            match file.read(&mut buf).await {
                Ok(0) => {
                    drop(pool.wrap(buf));
                    None
                }
                Ok(n) => {
                    buf.truncate(n);
                    let bytes = pool.wrap(buf);
                    Some((Ok(bytes), (file, remaining - n as u64)))
                }
                Err(e) => {
                    drop(pool.wrap(buf));
                    Some((Err(e), (file, 0)))
                }
            }
        }
    })
}

/// Wrap a body stream with the client's token bucket when a limit applies.
fn body_with_limit<S>(stream: S, limiter: Option<Arc<TokenBucket>>) -> Body
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    match limiter {
        Some(bucket) => Body::from_stream(stream.then(move |item| {
            let bucket = bucket.clone();
            async move {
                if let Ok(chunk) = &item {
                    bucket.acquire(chunk.len() as u64).await;
                }
                item
            }
        })),
        None => Body::from_stream(stream),
    }
}

//! Receiver: fetch, resume, decompress, decrypt, verify.

use crate::crypto::framing::FrameDecoder;
use crate::crypto::keys::EncryptionKey;
use crate::transfer::buffer_pool::BufferPools;
use crate::transfer::checksum;
use crate::transfer::progress::{MeterSnapshot, TransferMeter};
use anyhow::{bail, Context, Result};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use futures::TryStreamExt;
use reqwest::header;
use reqwest::{Response, StatusCode};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::io::StreamReader;

/// Returned instead of a path when the payload went to stdout.
pub const STDOUT_SENTINEL: &str = "(stdout)";

#[derive(Clone)]
pub struct ReceiveOptions {
    pub url: String,
    /// Explicit output path; otherwise the server-announced name lands in
    /// the current directory
    pub output: Option<PathBuf>,
    pub overwrite: bool,
    /// Shared key from a completed handshake or a derived password key
    pub key: Option<EncryptionKey>,
    /// Snapshot channel for whatever renders progress
    pub progress: Option<watch::Sender<MeterSnapshot>>,
}

impl ReceiveOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output: None,
            overwrite: false,
            key: None,
            progress: None,
        }
    }
}

#[derive(Debug)]
pub struct ReceiveOutcome {
    /// Output path, or `(stdout)`
    pub path: String,
    pub bytes: u64,
    /// Hex SHA-256 of the received plaintext when it was computed
    pub sha256: Option<String>,
}

/// Encryption parameters announced by `/d/encrypt-info`.
#[derive(Debug, serde::Deserialize)]
pub struct EncryptInfo {
    pub encrypted: bool,
    pub salt: Option<String>,
}

pub struct Receiver {
    http: reqwest::Client,
    pools: BufferPools,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            pools: BufferPools::new(),
        }
    }

    /// Ask the sender whether downloads are encrypted and under which salt.
    pub async fn fetch_encrypt_info(&self, base_url: &str) -> Result<EncryptInfo> {
        let url = format!("{}/d/encrypt-info", base_url.trim_end_matches('/'));
        let response = self.http.get(&url).send().await.map_err(connect_error)?;
        Ok(response.json().await.context("parse encrypt-info")?)
    }

    /// Run the password handshake against the sender and return the agreed
    /// key once both sides have proven it.
    pub async fn pake_handshake(&self, base_url: &str, code: &str) -> Result<EncryptionKey> {
        use crate::crypto::pake::{self, Pake, PakeRole};
        use base64::Engine;
        let b64 = &base64::engine::general_purpose::STANDARD;
        let base = base_url.trim_end_matches('/');

        let mut pake = Pake::new(code, PakeRole::Initiator);
        let our_message = pake.public_message().to_vec();

        let init: serde_json::Value = self
            .http
            .post(format!("{}/pake/init", base))
            .json(&serde_json::json!({ "message": b64.encode(&our_message) }))
            .send()
            .await
            .map_err(connect_error)?
            .error_for_status()
            .context("handshake init rejected")?
            .json()
            .await
            .context("parse handshake init response")?;

        let peer_message = b64
            .decode(
                init.get("message")
                    .and_then(|m| m.as_str())
                    .context("handshake init response missing message")?,
            )
            .context("handshake message is not valid base64")?;

        let key = pake
            .update(&peer_message)
            .context("derive shared key from handshake")?;

        let verify: serde_json::Value = self
            .http
            .post(format!("{}/pake/verify", base))
            .json(&serde_json::json!({
                "confirmation": b64.encode(pake::confirmation(&key, &peer_message)),
            }))
            .send()
            .await
            .map_err(connect_error)?
            .error_for_status()
            .context("wrong password, or the handshake expired")?
            .json()
            .await
            .context("parse handshake verify response")?;

        let their_confirmation = b64
            .decode(
                verify
                    .get("confirmation")
                    .and_then(|c| c.as_str())
                    .context("handshake verify response missing confirmation")?,
            )
            .context("confirmation is not valid base64")?;

        if !pake::verify_confirmation(&key, &our_message, &their_confirmation) {
            bail!("the sender failed key confirmation; aborting");
        }

        Ok(EncryptionKey::from_bytes(key))
    }

    pub async fn download(&self, opts: ReceiveOptions) -> Result<ReceiveOutcome> {
        let response = self.http.get(&opts.url).send().await.map_err(connect_error)?;
        check_status(&response)?;

        let encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let encrypted = response.headers().contains_key("x-encryption");
        let announced_sha = response
            .headers()
            .get("x-content-sha256")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let announced_len = response.content_length();
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if encrypted && opts.key.is_none() {
            bail!("the sender requires a password for this download");
        }
        let key = if encrypted { opts.key.clone() } else { None };

        // Inline text with no attachment name goes straight to stdout
        if content_type.starts_with("text/plain") && disposition.is_none() {
            let bytes = self
                .stream_to_stdout(response, &opts, encoding.as_deref())
                .await?;
            return Ok(ReceiveOutcome {
                path: STDOUT_SENTINEL.to_string(),
                bytes,
                sha256: None,
            });
        }

        let filename = disposition
            .as_deref()
            .and_then(parse_disposition_filename)
            .or_else(|| filename_from_url(&opts.url))
            .unwrap_or_else(|| "download.bin".to_string());
        let output = opts
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&filename));

        // Resume is only sound when the stream is byte-addressable: plain
        // identity bytes with a known total
        let resumable = !encrypted && encoding.is_none() && announced_len.is_some();
        let existing = tokio::fs::metadata(&output).await.ok().map(|m| m.len());

        if let Some(existing_len) = existing {
            let smaller = announced_len.map(|total| existing_len < total).unwrap_or(false);
            if smaller && !opts.overwrite && resumable {
                drop(response);
                return self
                    .resume(&opts, &output, existing_len, announced_sha.as_deref())
                    .await;
            }
            if !opts.overwrite {
                bail!(
                    "output file {} already exists; pass overwrite to replace it",
                    output.display()
                );
            }
        }

        let meter = Arc::new(TransferMeter::new(decoded_total(
            announced_len,
            encrypted,
            encoding.as_deref(),
        )));

        let file = tokio::fs::File::create(&output)
            .await
            .with_context(|| format!("create {}", output.display()))?;

        let result = self
            .copy_decoded(
                response,
                file,
                &opts,
                key.as_ref(),
                encoding.as_deref(),
                meter.clone(),
            )
            .await;

        let (bytes, computed_sha) = match result {
            Ok(pair) => pair,
            Err(e) => {
                let _ = tokio::fs::remove_file(&output).await;
                return Err(e);
            }
        };

        if let Some(expected) = &announced_sha {
            if !expected.eq_ignore_ascii_case(&computed_sha) {
                let _ = tokio::fs::remove_file(&output).await;
                bail!(
                    "checksum verification failed: expected {}, got {}",
                    expected,
                    computed_sha
                );
            }
        }

        Ok(ReceiveOutcome {
            path: output.display().to_string(),
            bytes,
            sha256: Some(computed_sha),
        })
    }

    /// Append from `start_byte` with a range request. A 200 answer means
    /// the server will not seek, so the transfer restarts from scratch.
    async fn resume(
        &self,
        opts: &ReceiveOptions,
        output: &PathBuf,
        start_byte: u64,
        announced_sha: Option<&str>,
    ) -> Result<ReceiveOutcome> {
        tracing::info!(
            path = %output.display(),
            start_byte,
            "resuming partial download"
        );

        let response = self
            .http
            .get(&opts.url)
            .header(header::RANGE, format!("bytes={}-", start_byte))
            .send()
            .await
            .map_err(connect_error)?;
        check_status(&response)?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            // Server ignored the range; start over with a clean slate
            let mut fresh = opts.clone();
            fresh.overwrite = true;
            return Box::pin(self.download(fresh)).await;
        }

        let meter = Arc::new(TransferMeter::new(response.content_length()));
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(output)
            .await
            .with_context(|| format!("open {} for append", output.display()))?;

        let (appended, _) = self
            .copy_decoded(response, file, opts, None, None, meter)
            .await?;

        // The tee only saw the appended tail; verify the whole artifact
        let sha256 = checksum::hash_file(output).await?;
        if let Some(expected) = announced_sha {
            if !expected.eq_ignore_ascii_case(&sha256) {
                let _ = tokio::fs::remove_file(output).await;
                bail!(
                    "checksum verification failed after resume: expected {}, got {}",
                    expected,
                    sha256
                );
            }
        }

        Ok(ReceiveOutcome {
            path: output.display().to_string(),
            bytes: start_byte + appended,
            sha256: Some(sha256),
        })
    }

    async fn stream_to_stdout(
        &self,
        response: Response,
        opts: &ReceiveOptions,
        encoding: Option<&str>,
    ) -> Result<u64> {
        let mut stdout = tokio::io::stdout();
        let reader = body_reader(response);
        let bytes = match encoding {
            Some("zstd") => {
                copy_plain(ZstdDecoder::new(BufReader::new(reader)), &mut stdout, self, opts).await?
            }
            Some("gzip") => {
                copy_plain(GzipDecoder::new(BufReader::new(reader)), &mut stdout, self, opts).await?
            }
            _ => copy_plain(reader, &mut stdout, self, opts).await?,
        };
        stdout.flush().await?;
        Ok(bytes)
    }

    /// Copy the response into `file` through the negotiated decoder stack,
    /// teeing a SHA-256 over the plaintext.
    async fn copy_decoded(
        &self,
        response: Response,
        file: tokio::fs::File,
        opts: &ReceiveOptions,
        key: Option<&EncryptionKey>,
        encoding: Option<&str>,
        meter: Arc<TransferMeter>,
    ) -> Result<(u64, String)> {
        let reader = body_reader(response);
        let mut file = file;

        let (bytes, sha) = if let Some(key) = key {
            self.copy_decrypted(reader, &mut file, key, opts, meter).await?
        } else {
            match encoding {
                Some("zstd") => {
                    self.copy_hashed(ZstdDecoder::new(BufReader::new(reader)), &mut file, opts, meter)
                        .await?
                }
                Some("gzip") => {
                    self.copy_hashed(GzipDecoder::new(BufReader::new(reader)), &mut file, opts, meter)
                        .await?
                }
                Some(other) => bail!("unsupported content encoding: {}", other),
                None => self.copy_hashed(reader, &mut file, opts, meter).await?,
            }
        };

        file.flush().await?;
        file.sync_all().await?;
        Ok((bytes, sha))
    }

    async fn copy_hashed<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        file: &mut tokio::fs::File,
        opts: &ReceiveOptions,
        meter: Arc<TransferMeter>,
    ) -> Result<(u64, String)> {
        let pool = self.pools.for_expected(meter.snapshot().total);
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        loop {
            let mut buf = pool.take();
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            emit_progress(&meter, n as u64, opts);
        }

        Ok((written, hex::encode(hasher.finalize())))
    }

    async fn copy_decrypted<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        file: &mut tokio::fs::File,
        key: &EncryptionKey,
        opts: &ReceiveOptions,
        meter: Arc<TransferMeter>,
    ) -> Result<(u64, String)> {
        let mut decoder = FrameDecoder::new(reader, key);
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(frame) = decoder.next_frame().await? {
            hasher.update(&frame);
            file.write_all(&frame).await?;
            written += frame.len() as u64;
            emit_progress(&meter, frame.len() as u64, opts);
        }

        Ok((written, hex::encode(hasher.finalize())))
    }
}

async fn copy_plain<R: AsyncRead + Unpin, W: tokio::io::AsyncWrite + Unpin>(
    mut reader: R,
    writer: &mut W,
    receiver: &Receiver,
    opts: &ReceiveOptions,
) -> Result<u64> {
    let pool = receiver.pools.for_expected(None);
    let meter = Arc::new(TransferMeter::new(None));
    let mut written = 0u64;
    loop {
        let mut buf = pool.take();
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        written += n as u64;
        emit_progress(&meter, n as u64, opts);
    }
    Ok(written)
}

fn emit_progress(meter: &Arc<TransferMeter>, bytes: u64, opts: &ReceiveOptions) {
    meter.add(bytes);
    if let Some(sender) = &opts.progress {
        if meter.should_emit() {
            let _ = sender.send(meter.snapshot());
        }
    }
}

fn body_reader(response: Response) -> impl AsyncRead + Unpin + Send {
    StreamReader::new(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    )
}

/// What the plaintext total will be, when it is knowable up front.
fn decoded_total(announced: Option<u64>, encrypted: bool, encoding: Option<&str>) -> Option<u64> {
    match (encrypted, encoding) {
        // Ciphertext length covers framing overhead; close enough for a
        // progress denominator is not good enough for verification, so
        // encrypted and compressed streams report no total
        (true, _) | (_, Some(_)) => None,
        (false, None) => announced,
    }
}

fn check_status(response: &Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => bail!("file expired or URL wrong"),
        StatusCode::FORBIDDEN => bail!("the server rejected the transfer token"),
        other => bail!("server returned {}", other),
    }
}

fn connect_error(e: reqwest::Error) -> anyhow::Error {
    anyhow::anyhow!(
        "could not reach the sender ({}); check the URL, that both machines \
         share a network, and that no firewall is in the way",
        e
    )
}

fn parse_disposition_filename(disposition: &str) -> Option<String> {
    let start = disposition.find("filename=\"")? + "filename=\"".len();
    let rest = &disposition[start..];
    let end = rest.find('"')?;
    let name = &rest[..end];
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next()?.trim_end_matches('/');
    let last = path.rsplit('/').next()?;
    // A bare token segment is not a useful filename
    if last.is_empty() || last.len() == 64 && last.chars().all(|c| c.is_ascii_hexdigit()) {
        None
    } else {
        Some(last.to_string())
    }
}

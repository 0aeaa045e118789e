//! Parallel chunk upload sessions.
//!
//! One session per logical file; chunks land at arbitrary offsets from any
//! number of peers in parallel. Creation is a compare-and-swap: the creator
//! builds a full candidate (unique path, open handle, pre-allocation) and
//! tries to install it; the loser dismantles its candidate and adopts the
//! winner. Completion transitions exactly once, fsyncs, closes the handle,
//! and retains the record briefly to absorb late retries.

use crate::common::AppError;
use crate::transfer::io as chunk_io;
use crate::transfer::progress::ProgressAggregator;
use crate::utils::security;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const SESSION_ID_MIN: usize = 8;
pub const SESSION_ID_MAX: usize = 64;
pub const MAX_CHUNK_TOTAL: u32 = 100_000;

/// Completed sessions stay resident this long for late retries.
pub const RETENTION_AFTER_COMPLETE: Duration = Duration::from_secs(30);
/// Sessions with no activity for this long are closed and dropped.
pub const IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);
/// Sweep cadence for idle eviction.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Validated header set for one chunk request.
#[derive(Clone, Debug)]
pub struct ChunkHeaders {
    pub session_id: String,
    /// Already sanitised
    pub filename: String,
    /// 0 = unknown
    pub total_size: u64,
    pub chunk_total: u32,
    pub chunk_id: u32,
    pub offset: u64,
    /// Advisory, client-computed
    pub checksum: Option<String>,
}

impl ChunkHeaders {
    /// Bounds checks that do not need session state.
    pub fn validate(&self) -> Result<(), AppError> {
        let id_ok = (SESSION_ID_MIN..=SESSION_ID_MAX).contains(&self.session_id.len())
            && self
                .session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !id_ok {
            return Err(AppError::BadRequest(format!(
                "invalid session id: {:?}",
                self.session_id
            )));
        }

        if self.chunk_total == 0 || self.chunk_total > MAX_CHUNK_TOTAL {
            return Err(AppError::BadRequest(format!(
                "chunk total {} out of range 1..{}",
                self.chunk_total, MAX_CHUNK_TOTAL
            )));
        }

        if self.chunk_id >= self.chunk_total {
            return Err(AppError::BadRequest(format!(
                "chunk id {} out of range for {} chunks",
                self.chunk_id, self.chunk_total
            )));
        }

        if self.total_size > 0 && self.offset > self.total_size {
            return Err(AppError::BadRequest(format!(
                "offset {} beyond total size {}",
                self.offset, self.total_size
            )));
        }

        Ok(())
    }
}

/// Result reported back to the uploading peer for one chunk.
#[derive(Clone, Debug)]
pub struct ChunkOutcome {
    pub filename: String,
    /// Chunks durably written so far
    pub received: usize,
    pub chunk_id: u32,
    pub complete: bool,
}

pub struct UploadSession {
    id: String,
    final_path: PathBuf,
    filename: String,
    expected_total: u64,
    expected_chunks: u32,
    file: Mutex<Option<std::fs::File>>,
    written: Mutex<HashSet<u32>>,
    received_bytes: AtomicU64,
    complete: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl UploadSession {
    /// Build a full candidate session: unique output path, handle opened
    /// 0600, pre-allocated when the total is known.
    fn create(headers: &ChunkHeaders, upload_dir: &Path) -> Result<Arc<Self>, AppError> {
        // create_new inside: a racing candidate can never share an inode,
        // so the loser's dismantle only ever unlinks its own file
        let (file, final_path) = security::create_unique_file(upload_dir, &headers.filename)
            .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("open upload target")))?;

        let filename = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| headers.filename.clone());

        if headers.total_size > 0 {
            chunk_io::preallocate(&file, headers.total_size).map_err(AppError::Internal)?;
        }

        Ok(Arc::new(Self {
            id: headers.session_id.clone(),
            final_path,
            filename,
            expected_total: headers.total_size,
            expected_chunks: headers.chunk_total,
            file: Mutex::new(Some(file)),
            written: Mutex::new(HashSet::new()),
            received_bytes: AtomicU64::new(0),
            complete: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }))
    }

    /// Loser branch of the install race: close the handle and remove the
    /// file this candidate created.
    fn dismantle(&self) {
        self.file.lock().unwrap().take();
        let _ = std::fs::remove_file(&self.final_path);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Arc<UploadSession>>>,
    progress: ProgressAggregator,
}

impl SessionStore {
    pub fn new(progress: ProgressAggregator) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            progress,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Find the session for `headers`, creating it on first reference.
    ///
    /// The create path is racy by construction; the candidate is built
    /// first and installed with the map entry as the swap point.
    pub fn lookup_or_create(
        &self,
        headers: &ChunkHeaders,
        upload_dir: &Path,
    ) -> Result<Arc<UploadSession>, AppError> {
        if let Some(existing) = self.sessions.get(&headers.session_id) {
            existing.touch();
            return Ok(existing.value().clone());
        }

        let candidate = UploadSession::create(headers, upload_dir)?;

        let session = match self.sessions.entry(headers.session_id.clone()) {
            Entry::Occupied(winner) => {
                candidate.dismantle();
                winner.get().clone()
            }
            Entry::Vacant(slot) => {
                self.progress.register(
                    &headers.session_id,
                    &candidate.filename,
                    headers.total_size,
                );
                tracing::debug!(
                    session = %headers.session_id,
                    file = %candidate.filename,
                    total = headers.total_size,
                    chunks = headers.chunk_total,
                    "upload session created"
                );
                slot.insert(candidate).clone()
            }
        };
        session.touch();
        Ok(session)
    }

    /// Write one chunk at its offset. Replays of an already-written index
    /// skip the write but still refresh progress so late retries advance
    /// the UI.
    pub async fn write_chunk(
        &self,
        session: &Arc<UploadSession>,
        headers: &ChunkHeaders,
        body: Bytes,
    ) -> Result<ChunkOutcome, AppError> {
        let len = body.len() as u64;
        if session.expected_total > 0 && headers.offset + len > session.expected_total {
            return Err(AppError::BadRequest(format!(
                "chunk [{}..{}) overruns total size {}",
                headers.offset,
                headers.offset + len,
                session.expected_total
            )));
        }

        session.touch();

        // Reserve the index under the lock; exactly one writer per
        // (session, index) reaches the pwrite below
        let fresh = {
            let mut written = session.written.lock().unwrap();
            written.insert(headers.chunk_id)
        };

        if fresh {
            let file = {
                let guard = session.file.lock().unwrap();
                match guard.as_ref() {
                    Some(file) => file.try_clone().map_err(|e| {
                        AppError::Internal(anyhow::Error::new(e).context("clone file handle"))
                    })?,
                    // Completed and closed; treat the replay as a no-op
                    None => {
                        return Ok(self.outcome(session, headers.chunk_id));
                    }
                }
            };

            let offset = headers.offset;
            let write_body = body.clone();
            let result = tokio::task::spawn_blocking(move || {
                chunk_io::write_chunk_at(&file, offset, &write_body)
            })
            .await
            .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("write task")))?;

            if let Err(e) = result {
                // Release the reservation so the peer can retry this index
                session.written.lock().unwrap().remove(&headers.chunk_id);
                return Err(AppError::Internal(e));
            }

            session.received_bytes.fetch_add(len, Ordering::SeqCst);
        }

        self.progress
            .set_received(&session.id, session.received_bytes());

        self.maybe_complete(session).await?;
        Ok(self.outcome(session, headers.chunk_id))
    }

    fn outcome(&self, session: &Arc<UploadSession>, chunk_id: u32) -> ChunkOutcome {
        ChunkOutcome {
            filename: session.filename.clone(),
            received: session.written_count(),
            chunk_id,
            complete: session.is_complete(),
        }
    }

    async fn maybe_complete(&self, session: &Arc<UploadSession>) -> Result<(), AppError> {
        let all_written = session.written_count() >= session.expected_chunks as usize;
        if !all_written || session.complete.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Sole owner of the completion transition from here on
        let file = session.file.lock().unwrap().take();
        if let Some(file) = file {
            tokio::task::spawn_blocking(move || file.sync_all())
                .await
                .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("fsync task")))?
                .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("fsync")))?;
        }

        self.progress.mark_complete(&session.id);
        tracing::info!(
            session = %session.id,
            file = %session.filename,
            bytes = session.received_bytes(),
            "upload complete"
        );

        // Keep the record briefly so duplicate final chunks still get a
        // success response, then drop it
        let store = self.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETENTION_AFTER_COMPLETE).await;
            store.sessions.remove(&id);
            store.progress.remove(&id);
        });

        Ok(())
    }

    /// Close and drop sessions idle past `max_idle`; partial files stay on
    /// disk for the operator to inspect.
    pub fn evict_stale(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|id, session| {
            if session.idle_for() < max_idle {
                return true;
            }
            tracing::warn!(
                session = %id,
                file = %session.filename,
                written = session.written_count(),
                expected = session.expected_chunks,
                "evicting stale upload session"
            );
            session.file.lock().unwrap().take();
            self.progress.remove(id);
            evicted += 1;
            false
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(session_id: &str, chunk_id: u32, offset: u64) -> ChunkHeaders {
        ChunkHeaders {
            session_id: session_id.to_string(),
            filename: "upload.bin".to_string(),
            total_size: 12,
            chunk_total: 3,
            chunk_id,
            offset,
            checksum: None,
        }
    }

    fn store() -> SessionStore {
        SessionStore::new(ProgressAggregator::new())
    }

    #[test]
    fn header_validation_bounds() {
        assert!(headers("abcd1234", 0, 0).validate().is_ok());

        let mut short_id = headers("abc", 0, 0);
        short_id.session_id = "abc".into();
        assert!(short_id.validate().is_err());

        let mut bad_chars = headers("abcd1234", 0, 0);
        bad_chars.session_id = "abcd/123".into();
        assert!(bad_chars.validate().is_err());

        let mut high_chunk = headers("abcd1234", 3, 0);
        high_chunk.chunk_id = 3;
        assert!(high_chunk.validate().is_err());

        let mut zero_total = headers("abcd1234", 0, 0);
        zero_total.chunk_total = 0;
        assert!(zero_total.validate().is_err());

        let mut far_offset = headers("abcd1234", 0, 0);
        far_offset.offset = 13;
        assert!(far_offset.validate().is_err());
    }

    #[tokio::test]
    async fn chunks_reassemble_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();

        for (chunk_id, offset, data) in [(2u32, 8u64, b"ijkl"), (0, 0, b"abcd"), (1, 4, b"efgh")] {
            let h = headers("session-abc", chunk_id, offset);
            let session = store.lookup_or_create(&h, dir.path()).unwrap();
            let outcome = store
                .write_chunk(&session, &h, Bytes::from_static(data))
                .await
                .unwrap();
            assert_eq!(outcome.chunk_id, chunk_id);
        }

        let session = store.get("session-abc");
        // Completed sessions are retained briefly; the file must be whole
        let path = dir.path().join("upload.bin");
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefghijkl");
        assert!(session.map(|s| s.is_complete()).unwrap_or(true));
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();

        let h0 = headers("session-abc", 0, 0);
        let session = store.lookup_or_create(&h0, dir.path()).unwrap();

        store
            .write_chunk(&session, &h0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        let first = session.written_count();
        let replay = store
            .write_chunk(&session, &h0, Bytes::from_static(b"abcd"))
            .await
            .unwrap();

        assert_eq!(session.written_count(), first, "write-set stable on replay");
        assert_eq!(replay.received, first);
        assert_eq!(session.received_bytes(), 4, "bytes counted once");
    }

    #[tokio::test]
    async fn completion_transitions_once_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();

        let mut last_complete = false;
        for (chunk_id, offset, data) in [(0u32, 0u64, b"abcd"), (1, 4, b"efgh"), (2, 8, b"ijkl")] {
            let h = headers("session-abc", chunk_id, offset);
            let session = store.lookup_or_create(&h, dir.path()).unwrap();
            let outcome = store
                .write_chunk(&session, &h, Bytes::from_static(data))
                .await
                .unwrap();
            last_complete = outcome.complete;
        }
        assert!(last_complete, "final chunk reports complete");
    }

    #[tokio::test]
    async fn overrun_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();

        let h = headers("session-abc", 2, 10);
        let session = store.lookup_or_create(&h, dir.path()).unwrap();
        let result = store
            .write_chunk(&session, &h, Bytes::from_static(b"toolong"))
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn create_race_loser_dismantles() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();

        let h = headers("session-abc", 0, 0);
        let a = store.lookup_or_create(&h, dir.path()).unwrap();
        let b = store.lookup_or_create(&h, dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Exactly one output file exists
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn stale_sessions_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();

        let h = headers("session-abc", 0, 0);
        let session = store.lookup_or_create(&h, dir.path()).unwrap();
        store
            .write_chunk(&session, &h, Bytes::from_static(b"abcd"))
            .await
            .unwrap();

        assert_eq!(store.evict_stale(Duration::from_secs(3600)), 0);
        assert_eq!(store.evict_stale(Duration::ZERO), 1);
        assert!(store.is_empty());
    }
}

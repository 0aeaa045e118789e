use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Clone)]
struct CacheEntry {
    sha256: String,
    mtime: SystemTime,
    size: u64,
}

/// SHA-256 cache keyed by path, invalidated when `(mtime, size)` drift.
///
/// Hashing a large file once per serving process is fine; once per request
/// is not, so download handlers go through here for `X-Content-SHA256`.
#[derive(Clone, Default)]
pub struct ChecksumCache {
    entries: std::sync::Arc<DashMap<PathBuf, CacheEntry>>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sha256_hex(&self, path: &Path) -> io::Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        let mtime = metadata.modified()?;
        let size = metadata.len();

        if let Some(entry) = self.entries.get(path) {
            if entry.mtime == mtime && entry.size == size {
                return Ok(entry.sha256.clone());
            }
        }

        let sha256 = hash_file(path).await?;
        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                sha256: sha256.clone(),
                mtime,
                size,
            },
        );
        Ok(sha256)
    }

    #[cfg(test)]
    fn cached(&self, path: &Path) -> Option<String> {
        self.entries.get(path).map(|e| e.sha256.clone())
    }
}

/// Streaming SHA-256 of a file, lowercase hex.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caches_and_invalidates_on_metadata_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        tokio::fs::write(&path, b"first contents").await.unwrap();

        let cache = ChecksumCache::new();
        let first = cache.sha256_hex(&path).await.unwrap();
        assert_eq!(first, hash_file(&path).await.unwrap());
        assert_eq!(cache.cached(&path), Some(first.clone()));

        // Rewrite with different length; (mtime, size) no longer match
        tokio::fs::write(&path, b"rewritten, longer contents")
            .await
            .unwrap();
        let second = cache.sha256_hex(&path).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second, hash_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, vec![b'a'; 1024]).await.unwrap();

        // sha256 of 1024 * 'a'
        assert_eq!(
            hash_file(&path).await.unwrap(),
            "2edc986847e209b4016e141a6dc8716d3207350f416969382d431539bf292e4a"
        );
    }
}

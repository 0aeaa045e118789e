//! Directory packing for download responses.
//!
//! The zip writer needs a seekable sink to backfill entry headers, so the
//! archive is spooled to an anonymous temp file on the blocking pool and the
//! response body streams from that handle. On unix the path is unlinked as
//! soon as the handle exists, so cleanup cannot be missed. File handles for
//! entries open one at a time to bound descriptor use.

use anyhow::{Context, Result};
use rand::RngCore;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Deflate-pack `root` into a spooled temp file, returned rewound and ready
/// to stream, together with its exact byte length.
pub async fn spool_zip(root: PathBuf) -> Result<(tokio::fs::File, u64)> {
    let (file, len) = tokio::task::spawn_blocking(move || build_spool(&root))
        .await
        .context("zip task panicked")??;

    Ok((tokio::fs::File::from_std(file), len))
}

fn build_spool(root: &Path) -> Result<(std::fs::File, u64)> {
    let path = spool_path();
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("create zip spool {}", path.display()))?;

    // Unlink immediately; the handle keeps the data alive until dropped
    #[cfg(unix)]
    let _ = std::fs::remove_file(&path);

    if let Err(e) = write_zip(root, &mut file) {
        #[cfg(not(unix))]
        let _ = std::fs::remove_file(&path);
        return Err(e);
    }

    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok((file, len))
}

fn spool_path() -> PathBuf {
    let mut suffix = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    std::env::temp_dir().join(format!("lancast-zip-{}.tmp", hex::encode(suffix)))
}

fn write_zip<W: Write + Seek>(root: &Path, out: W) -> Result<()> {
    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();

        zip.start_file(relative, options)?;
        let mut file = std::fs::File::open(entry.path())?;
        io::copy(&mut file, &mut zip)?;
    }

    zip.finish()?;
    Ok(())
}

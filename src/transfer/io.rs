use anyhow::{Context, Result};
use std::fs::File;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Positioned write that never moves the shared file cursor, so chunks for
/// one session can land in parallel.
pub fn write_chunk_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    #[cfg(unix)]
    file.write_all_at(data, offset)
        .with_context(|| format!("write chunk at offset {}", offset))?;

    #[cfg(windows)]
    {
        let mut written = 0usize;
        while written < data.len() {
            let n = file
                .seek_write(&data[written..], offset + written as u64)
                .with_context(|| format!("write chunk at offset {}", offset))?;
            if n == 0 {
                anyhow::bail!("short write at offset {}", offset + written as u64);
            }
            written += n;
        }
    }

    Ok(())
}

/// Positioned read of exactly `buf.len()` bytes.
pub fn read_chunk_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    #[cfg(unix)]
    file.read_exact_at(buf, offset)
        .with_context(|| format!("read chunk at offset {}", offset))?;

    #[cfg(windows)]
    {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file
                .seek_read(&mut buf[filled..], offset + filled as u64)
                .with_context(|| format!("read chunk at offset {}", offset))?;
            if n == 0 {
                anyhow::bail!("unexpected eof at offset {}", offset + filled as u64);
            }
            filled += n;
        }
    }

    Ok(())
}

/// Reserve the final size up front; completion then implies the on-disk
/// length already matches the expected total.
pub fn preallocate(file: &File, len: u64) -> Result<()> {
    file.set_len(len).context("preallocate file")
}

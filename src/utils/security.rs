use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Longest filename we will create, in bytes.
const MAX_FILENAME_BYTES: usize = 255;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Filename is empty")]
    Empty,

    #[error("Filename is entirely whitespace")]
    Whitespace,

    #[error("Filename contains directory separator")]
    ContainsDirectorySeparator,

    #[error("Filename contains parent directory reference")]
    ContainsParentDir,

    #[error("Filename contains null byte")]
    NullByte,

    #[error("Filename contains control character")]
    ControlCharacter,

    #[error("Filename changes under normalisation")]
    NotNormalised,

    #[error("Filename too long ({0} bytes, max {MAX_FILENAME_BYTES})")]
    TooLong(usize),
}

/// Validate and normalise a peer-supplied filename.
///
/// Rejects anything that could escape the upload directory or confuse the
/// filesystem: separators, `..` anywhere, NUL, control characters, names
/// that are not already in normal form, and names over 255 bytes. Unicode
/// letters pass through untouched.
pub fn sanitize_filename(raw: &str) -> Result<String, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }

    if raw.chars().all(char::is_whitespace) {
        return Err(ValidationError::Whitespace);
    }

    if raw.contains('/') || raw.contains('\\') {
        return Err(ValidationError::ContainsDirectorySeparator);
    }

    // ".." as a substring, not just a path component; catches "a..b" tricks
    // that some filesystems collapse
    if raw.contains("..") {
        return Err(ValidationError::ContainsParentDir);
    }

    if raw.contains('\0') {
        return Err(ValidationError::NullByte);
    }

    if raw.chars().any(|c| (c as u32) < 0x20 || c == '\u{7f}') {
        return Err(ValidationError::ControlCharacter);
    }

    if raw.len() > MAX_FILENAME_BYTES {
        return Err(ValidationError::TooLong(raw.len()));
    }

    // The name must already be in normal form: a single Normal component
    // that round-trips unchanged
    let path = Path::new(raw);
    let mut components = path.components();
    let normalised = match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name,
        _ => return Err(ValidationError::NotNormalised),
    };

    let normalised = normalised
        .to_str()
        .ok_or(ValidationError::NotNormalised)?;

    if normalised != raw {
        return Err(ValidationError::NotNormalised);
    }

    if normalised.is_empty() || normalised == "." || normalised == ".." {
        return Err(ValidationError::NotNormalised);
    }

    Ok(normalised.to_string())
}

/// Resolve a collision-free path for `filename` under `dir`.
///
/// Tries `name (1).ext` through `name (999).ext`, then falls back to a
/// nanosecond timestamp suffix so the open can never spin forever.
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_name(filename);

    for k in 1..=999u32 {
        let name = match ext {
            Some(ext) => format!("{} ({}).{}", stem, k, ext),
            None => format!("{} ({})", stem, k),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let name = match ext {
        Some(ext) => format!("{}-{}.{}", stem, nanos, ext),
        None => format!("{}-{}", stem, nanos),
    };
    dir.join(name)
}

/// Open a fresh collision-free file for `filename` under `dir`, mode 0600.
///
/// `create_new` guarantees two racing callers never share an inode; on a
/// lost race the next `unique_path` candidate is tried.
pub fn create_unique_file(
    dir: &Path,
    filename: &str,
) -> std::io::Result<(std::fs::File, PathBuf)> {
    let mut options = std::fs::OpenOptions::new();
    options.create_new(true).read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut attempt = 0;
    loop {
        let candidate = unique_path(dir, filename);
        match options.open(&candidate) {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 10 => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// "archive.tar.gz" -> ("archive.tar", Some("gz")); dotfiles keep their dot
fn split_name(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], Some(&filename[idx + 1..])),
        _ => (filename, None),
    }
}

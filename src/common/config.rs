use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// What the serving process is offering or accepting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Serve one file or directory for download
    SendFile,
    /// Serve an inline text snippet for download
    SendText,
    /// Accept uploads from peers into a local directory
    Host,
}

/// Caller-supplied configuration for one server instance.
///
/// The CLI (or any other front end) resolves the LAN address, picks the
/// port, and hands everything over; the engine holds no globals.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub role: Role,
    pub bind: Ipv4Addr,
    pub port: u16,
    /// File or directory to serve (send-file mode)
    pub source: Option<PathBuf>,
    /// Inline text to serve (send-text mode)
    pub text: Option<String>,
    /// Directory uploads land in (host mode)
    pub upload_dir: Option<PathBuf>,
    /// Arms PAKE + streaming encryption when set
    pub password: Option<String>,
    /// Outbound cap in megabits per second, per client
    pub rate_limit_mbps: Option<u64>,
}

impl ServerConfig {
    pub fn send_file(source: PathBuf) -> Self {
        Self {
            role: Role::SendFile,
            bind: Ipv4Addr::UNSPECIFIED,
            port: 0,
            source: Some(source),
            text: None,
            upload_dir: None,
            password: None,
            rate_limit_mbps: None,
        }
    }

    pub fn send_text(text: String) -> Self {
        Self {
            role: Role::SendText,
            bind: Ipv4Addr::UNSPECIFIED,
            port: 0,
            source: None,
            text: Some(text),
            upload_dir: None,
            password: None,
            rate_limit_mbps: None,
        }
    }

    pub fn host(upload_dir: PathBuf) -> Self {
        Self {
            role: Role::Host,
            bind: Ipv4Addr::UNSPECIFIED,
            port: 0,
            source: None,
            text: None,
            upload_dir: Some(upload_dir),
            password: None,
            rate_limit_mbps: None,
        }
    }
}

/// Chunking hints advertised to upload clients via the manifest endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: u64,
    pub max_concurrent: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024, // 4 MB
            max_concurrent: 4,
        }
    }
}

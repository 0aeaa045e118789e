#![allow(dead_code)]

use lancast::common::ServerConfig;
use lancast::metrics::AtomicMetrics;
use lancast::server::ServerInstance;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Start a server on an OS-picked port; returns the instance and its base
/// URL (no path).
pub async fn start_server(config: ServerConfig) -> (ServerInstance, String) {
    let metrics = AtomicMetrics::new();
    let instance = ServerInstance::start(config, metrics)
        .await
        .expect("server failed to start");
    let base = format!("http://{}", instance.addr());
    (instance, base)
}

pub async fn start_server_with_metrics(
    config: ServerConfig,
    metrics: Arc<AtomicMetrics>,
) -> (ServerInstance, String) {
    let instance = ServerInstance::start(config, metrics)
        .await
        .expect("server failed to start");
    let base = format!("http://{}", instance.addr());
    (instance, base)
}

pub fn download_url(base: &str, token: &str) -> String {
    format!("{}/d/{}", base, token)
}

pub fn upload_url(base: &str, token: &str) -> String {
    format!("{}/u/{}", base, token)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture file");
    path
}

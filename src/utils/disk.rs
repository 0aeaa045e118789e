use std::path::Path;
use sysinfo::Disks;

/// Bytes always left untouched on the target filesystem.
const SAFETY_MARGIN: u64 = 1024 * 1024 * 1024; // 1 GB

/// Whether the filesystem holding `path` can absorb `needed` bytes while
/// keeping the safety margin free. Unknown mounts report as having room so
/// an exotic setup degrades to the write failing instead of a false 507.
pub fn has_capacity(path: &Path, needed: u64) -> bool {
    match available_bytes(path) {
        Some(available) => available.saturating_sub(SAFETY_MARGIN) >= needed,
        None => true,
    }
}

fn available_bytes(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    // Longest mount-point prefix wins (e.g. "/home" over "/")
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Removal of shared memory segments left behind by dead daemons
///
/// Segments are named `audiod-shm-<id>` and start with an 8-byte header:
/// a native-endian `u32` marker followed by the creator PID as `u32`.
use crate::config::types::{DaemonError, Result};
use crate::safety::pid_file::process_alive;
use log::{debug, info, warn};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const SHM_DIR: &str = "/dev/shm";
pub const SHM_PREFIX: &str = "audiod-shm-";
pub const SHM_MARKER: u32 = 0xbeef_cafe;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShmCleanupReport {
    pub removed: Vec<PathBuf>,
    pub in_use: usize,
    pub foreign: usize,
}

fn creator_pid(path: &Path) -> Option<u32> {
    let mut header = [0u8; 8];
    File::open(path).ok()?.read_exact(&mut header).ok()?;
    let marker = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    if marker != SHM_MARKER {
        return None;
    }
    Some(u32::from_ne_bytes([header[4], header[5], header[6], header[7]]))
}

/// Scan `dir` and unlink our segments whose creator is gone
pub fn cleanup_stale_segments(dir: &Path) -> Result<ShmCleanupReport> {
    let mut report = ShmCleanupReport::default();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| DaemonError::Io(std::io::Error::new(e.kind(), format!("{}: {}", dir.display(), e))))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SHM_PREFIX) {
            continue;
        }
        let path = entry.path();
        match creator_pid(&path) {
            Some(pid) if process_alive(pid) => {
                debug!("Segment {} still used by PID {}", path.display(), pid);
                report.in_use += 1;
            }
            Some(pid) => match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("Removed stale segment {} (PID {} gone)", path.display(), pid);
                    report.removed.push(path);
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            },
            None => report.foreign += 1,
        }
    }
    Ok(report)
}

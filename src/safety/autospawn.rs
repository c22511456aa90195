/// Autospawn lock: serializes concurrent "start if not running" invocations
use crate::config::types::{DaemonError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const AUTOSPAWN_LOCK_NAME: &str = "autospawn.lock";

const LOCK_ATTEMPTS: usize = 5;

/// Held across the start decision only. Dropping it releases it.
#[derive(Debug)]
pub struct AutospawnLock {
    file: Option<File>,
    path: PathBuf,
}

impl AutospawnLock {
    /// Blocks until the lock is ours
    pub fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..LOCK_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| DaemonError::Lock(format!("Failed to open {}: {}", path.display(), e)))?;

            loop {
                // SAFETY: blocking flock on a descriptor we own.
                if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                    break;
                }
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EINTR) {
                    return Err(DaemonError::Lock(format!("flock failed: {}", errno)));
                }
            }

            // The previous holder unlinks before closing; a lock on an
            // unlinked inode guards nothing.
            let current = match (file.metadata(), std::fs::metadata(path)) {
                (Ok(open), Ok(on_disk)) => open.nlink() > 0 && open.ino() == on_disk.ino(),
                _ => false,
            };
            if current {
                log::debug!("Took autospawn lock {}", path.display());
                return Ok(Self {
                    file: Some(file),
                    path: path.to_owned(),
                });
            }
        }
        Err(DaemonError::Lock(format!(
            "Failed to take autospawn lock {}",
            path.display()
        )))
    }

    /// Unlink, then unlock by closing
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Close our descriptor copy without unlinking (detached child; the parent releases)
    pub fn close_inherited(mut self) {
        self.file.take();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
            drop(file);
            log::debug!("Released autospawn lock {}", self.path.display());
        }
    }
}

impl Drop for AutospawnLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn release_removes_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTOSPAWN_LOCK_NAME);
        let lock = AutospawnLock::acquire(&path).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
        AutospawnLock::acquire(&path).unwrap().release();
    }

    #[test]
    fn second_holder_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTOSPAWN_LOCK_NAME);
        let lock = AutospawnLock::acquire(&path).unwrap();

        let (tx, rx) = mpsc::channel();
        let contender_path = path.clone();
        let contender = std::thread::spawn(move || {
            let lock = AutospawnLock::acquire(&contender_path).unwrap();
            tx.send(()).unwrap();
            lock.release();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        lock.release();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        contender.join().unwrap();
    }

    #[test]
    fn closing_inherited_copy_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTOSPAWN_LOCK_NAME);
        AutospawnLock::acquire(&path).unwrap().close_inherited();
        assert!(path.exists());
    }
}

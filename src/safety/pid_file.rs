/// PID file based single-instance lock
///
/// The file is opened 0600, locked with `flock(LOCK_EX | LOCK_NB)` and held
/// for the daemon's lifetime; the kernel drops the lock if we die. A lock we
/// can take whose recorded PID still belongs to a live daemon is still
/// treated as "already running".
use crate::config::types::{DaemonError, Result};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PID_FILE_NAME: &str = "pid";

/// Attempts when the file is replaced under us between open and lock
const OPEN_ATTEMPTS: usize = 3;

/// Reads of a busy file while its holder may still be writing
const BUSY_READ_ATTEMPTS: usize = 5;

/// Exclusive ownership of the PID file. Dropping it removes the file.
#[derive(Debug)]
pub struct PidFile {
    file: Option<File>,
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Take the lock and record our PID, reclaiming a stale file.
    ///
    /// `expected_name` is compared with `/proc/<pid>/comm` so a recycled PID
    /// of an unrelated program counts as stale.
    pub fn acquire(path: &Path, expected_name: Option<&str>) -> Result<Self> {
        let own_pid = std::process::id();

        for attempt in 1..=OPEN_ATTEMPTS {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| {
                    DaemonError::PidFile(format!("Failed to open {}: {}", path.display(), e))
                })?;

            // SAFETY: flock on a descriptor we own.
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    let pid = read_pid_with_retry(&mut file);
                    return Err(DaemonError::AlreadyRunning { pid });
                }
                return Err(DaemonError::PidFile(format!("flock failed: {}", errno)));
            }

            if !same_inode(&file, path) {
                debug!(
                    "PID file {} replaced while locking (attempt {})",
                    path.display(),
                    attempt
                );
                continue;
            }

            if let Some(pid) = read_pid(&mut file) {
                if pid != own_pid && process_alive(pid) && process_matches(pid, expected_name) {
                    return Err(DaemonError::AlreadyRunning { pid: Some(pid) });
                }
                warn!("Stale PID file {} (PID {}), overwriting", path.display(), pid);
            }

            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", own_pid)?;
            file.sync_all()?;

            info!("Created PID file {} for PID {}", path.display(), own_pid);
            return Ok(Self {
                file: Some(file),
                path: path.to_owned(),
                pid: own_pid,
            });
        }

        Err(DaemonError::PidFile(format!(
            "{} keeps changing while being locked",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Unlink (only if it still names us) and release the lock
    pub fn remove(mut self) -> Result<()> {
        self.remove_inner()
    }

    fn remove_inner(&mut self) -> Result<()> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        if read_pid(&mut file) == Some(self.pid) {
            std::fs::remove_file(&self.path).map_err(|e| {
                DaemonError::PidFile(format!("Failed to remove {}: {}", self.path.display(), e))
            })?;
            debug!("Removed PID file {}", self.path.display());
        } else {
            warn!("PID file {} no longer ours, leaving it", self.path.display());
        }
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove_inner() {
            warn!("{}", e);
        }
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

fn read_pid_with_retry(file: &mut File) -> Option<u32> {
    for _ in 0..BUSY_READ_ATTEMPTS {
        if let Some(pid) = read_pid(file) {
            return Some(pid);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}

fn same_inode(file: &File, path: &Path) -> bool {
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(open), Ok(on_disk)) => open.ino() == on_disk.ino() && open.dev() == on_disk.dev(),
        _ => false,
    }
}

/// kill(pid, 0) succeeds or fails only with EPERM
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match nix::sys::signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Unknown when /proc is unreadable, which counts as a match
fn process_matches(pid: u32, expected_name: Option<&str>) -> bool {
    let expected = match expected_name {
        Some(name) => name,
        None => return true,
    };
    match std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
        // comm is truncated to 15 bytes
        Ok(comm) => expected.as_bytes().iter().take(15).eq(comm.trim_end().as_bytes().iter()),
        Err(_) => true,
    }
}

/// `AlreadyRunning` when a live instance owns `path`. Takes only a shared
/// lock for the duration of the call and leaves the file as it is.
pub fn ensure_vacant(path: &Path, expected_name: Option<&str>) -> Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(DaemonError::PidFile(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            )))
        }
    };

    // SAFETY: flock on a descriptor we own; released when `file` closes.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) } != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
            let pid = read_pid_with_retry(&mut file);
            return Err(DaemonError::AlreadyRunning { pid });
        }
        return Err(DaemonError::PidFile(format!("flock failed: {}", errno)));
    }

    match read_pid(&mut file) {
        Some(pid)
            if pid != std::process::id()
                && process_alive(pid)
                && process_matches(pid, expected_name) =>
        {
            Err(DaemonError::AlreadyRunning { pid: Some(pid) })
        }
        _ => Ok(()),
    }
}

/// PID of a live instance recorded in `path`, if any
pub fn check_running(path: &Path, expected_name: Option<&str>) -> Result<Option<u32>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DaemonError::PidFile(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            )))
        }
    };

    Ok(read_pid(&mut file).filter(|&pid| {
        pid != std::process::id() && process_alive(pid) && process_matches(pid, expected_name)
    }))
}

/// Send `signal` to the recorded live instance
pub fn kill_running(path: &Path, signal: Signal, expected_name: Option<&str>) -> Result<u32> {
    let pid = check_running(path, expected_name)?
        .ok_or_else(|| DaemonError::PidFile("Daemon not running".to_string()))?;
    nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
        DaemonError::PidFile(format!("Failed to send {} to PID {}: {}", signal, pid, e))
    })?;
    info!("Sent {} to PID {}", signal, pid);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn acquire_records_own_pid_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        {
            let pid_file = PidFile::acquire(&path, None).unwrap();
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content, format!("{}\n", std::process::id()));
            assert_eq!(pid_file.pid(), std::process::id());
            let mode = std::fs::metadata(&path).unwrap().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
        assert!(!path.exists());
    }

    #[test]
    fn held_lock_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        let _held = PidFile::acquire(&path, None).unwrap();
        match PidFile::acquire(&path, None) {
            Err(DaemonError::AlreadyRunning { pid }) => assert_eq!(pid, Some(std::process::id())),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    #[test]
    fn vacancy_check_sees_a_held_lock_and_leaves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        assert!(ensure_vacant(&path, None).is_ok());

        let held = PidFile::acquire(&path, None).unwrap();
        assert!(matches!(
            ensure_vacant(&path, None),
            Err(DaemonError::AlreadyRunning { pid: Some(_) })
        ));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", std::process::id())
        );

        drop(held);
        std::fs::write(&path, format!("{}\n", dead_pid())).unwrap();
        assert!(ensure_vacant(&path, None).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, format!("{}\n", dead_pid())).unwrap();

        let pid_file = PidFile::acquire(&path, None).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
        pid_file.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn live_unlocked_owner_still_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, "1\n").unwrap();
        assert!(matches!(
            PidFile::acquire(&path, None),
            Err(DaemonError::AlreadyRunning { pid: Some(1) })
        ));
    }

    #[test]
    fn recycled_pid_with_other_name_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, "1\n").unwrap();
        if std::fs::read_to_string("/proc/1/comm").is_ok() {
            assert!(PidFile::acquire(&path, Some("audiod-no-such")).is_ok());
        }
    }

    #[test]
    fn own_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(PidFile::acquire(&path, None).is_ok());
    }

    #[test]
    fn check_running_distinguishes_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        assert_eq!(check_running(&path, None).unwrap(), None);

        std::fs::write(&path, format!("{}\n", dead_pid())).unwrap();
        assert_eq!(check_running(&path, None).unwrap(), None);

        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(check_running(&path, None).unwrap(), Some(1));
    }

    #[test]
    fn kill_without_instance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        assert!(kill_running(&path, Signal::SIGINT, None).is_err());
    }
}

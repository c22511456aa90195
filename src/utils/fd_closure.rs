/// Inherited file descriptor cleanup at process start
///
/// Everything above stderr is closed except one descriptor a launcher may
/// hand over through `AUDIOD_PASSED_FD`.
use crate::config::types::{DaemonError, Result};
use std::fs;
use std::os::unix::io::RawFd;

pub const ENV_PASSED_FD: &str = "AUDIOD_PASSED_FD";

/// Descriptor named by `AUDIOD_PASSED_FD`; stdio numbers and junk are ignored
pub fn passed_fd_from_env<F>(lookup: F) -> Option<RawFd>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ENV_PASSED_FD)
        .and_then(|value| value.trim().parse::<RawFd>().ok())
        .filter(|fd| *fd > 2)
}

/// Close every fd >= 3 except `keep`
pub fn close_inherited_fds(keep: Option<RawFd>) -> Result<()> {
    let ranges: Vec<(u32, u32)> = match keep {
        Some(fd) if fd > 3 => vec![(3, fd as u32 - 1), (fd as u32 + 1, u32::MAX)],
        Some(3) => vec![(4, u32::MAX)],
        _ => vec![(3, u32::MAX)],
    };

    if ranges.iter().all(|&(first, last)| try_close_range(first, last)) {
        log::debug!("Closed inherited FDs using close_range (kept {:?})", keep);
        return Ok(());
    }

    close_fds_via_proc(keep)
}

fn try_close_range(first: u32, last: u32) -> bool {
    // SAFETY: close_range only closes descriptors; none are borrowed by Rust
    // code at this point of startup.
    let result = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0) };
    result == 0
}

/// Descriptors from `open` that must go
pub fn fds_to_close(open: &[RawFd], keep: Option<RawFd>) -> Vec<RawFd> {
    open.iter()
        .copied()
        .filter(|fd| *fd > 2 && Some(*fd) != keep)
        .collect()
}

fn close_fds_via_proc(keep: Option<RawFd>) -> Result<()> {
    // Collect first: the directory handle itself is one of the entries.
    let open = get_open_fds()?;
    let mut closed_count = 0;
    for fd in fds_to_close(&open, keep) {
        match nix::unistd::close(fd) {
            Ok(()) => closed_count += 1,
            Err(nix::errno::Errno::EBADF) => {}
            Err(e) => log::warn!("Failed to close fd {}: {}", fd, e),
        }
    }
    log::debug!("Closed {} inherited FDs via /proc/self/fd", closed_count);
    Ok(())
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir).map_err(|e| {
        DaemonError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read {}: {}", fd_dir, e),
        ))
    })?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fds_include_stdio() {
        let fds = get_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn keeps_stdio_and_passed_fd() {
        let open = [0, 1, 2, 3, 5, 7, 9];
        assert_eq!(fds_to_close(&open, Some(7)), vec![3, 5, 9]);
        assert_eq!(fds_to_close(&open, None), vec![3, 5, 7, 9]);
    }

    #[test]
    fn passed_fd_ignores_stdio_and_junk() {
        let lookup = |value: &'static str| move |key: &str| (key == ENV_PASSED_FD).then(|| value.to_string());
        assert_eq!(passed_fd_from_env(lookup("7")), Some(7));
        assert_eq!(passed_fd_from_env(lookup("2")), None);
        assert_eq!(passed_fd_from_env(lookup("seven")), None);
        assert_eq!(passed_fd_from_env(|_| None), None);
    }
}

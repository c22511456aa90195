//! Fork-and-detach with a readiness handshake back to the invoking shell.

use crate::config::types::{DaemonError, Result};
use crate::core::handshake::{handshake_channel, HandshakeWriter};
use crate::kernel::signal::ignore_terminal_signals;
use nix::unistd::{fork, ForkResult};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

const STDIO: [RawFd; 3] = [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO];

/// Exclusive use of the standard streams while detaching. Saves copies of
/// fds 0-2 and puts them back on drop.
pub struct StdioOwnership {
    saved: [RawFd; 3],
}

impl StdioOwnership {
    /// Fails if stdin is a terminal whose foreground process group is not ours
    pub fn acquire() -> Result<Self> {
        // SAFETY: isatty/tcgetpgrp/getpgrp only query descriptor and process state.
        let foreign_owner = unsafe {
            libc::isatty(libc::STDIN_FILENO) == 1 && {
                let fg = libc::tcgetpgrp(libc::STDIN_FILENO);
                fg >= 0 && fg != libc::getpgrp()
            }
        };
        if foreign_owner {
            return Err(DaemonError::Daemonize(
                "Failed to acquire stdio: terminal is owned by another process group".to_string(),
            ));
        }

        let mut saved = [-1; 3];
        for (slot, fd) in saved.iter_mut().zip(STDIO) {
            // SAFETY: F_DUPFD_CLOEXEC on a standard descriptor; a closed one yields -1.
            *slot = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
        }
        Ok(Self { saved })
    }

    /// Forget the saved copies without restoring (detached child)
    pub fn relinquish(mut self) {
        self.close_saved();
    }

    fn close_saved(&mut self) {
        for fd in self.saved.iter_mut() {
            if *fd >= 0 {
                // SAFETY: the saved copy is owned by this guard only.
                unsafe { libc::close(*fd) };
                *fd = -1;
            }
        }
    }
}

impl Drop for StdioOwnership {
    fn drop(&mut self) {
        for (saved, fd) in self.saved.iter().zip(STDIO) {
            if *saved >= 0 {
                // SAFETY: both descriptors are valid; dup2 replaces `fd` atomically.
                unsafe { libc::dup2(*saved, fd) };
            }
        }
        self.close_saved();
    }
}

/// Which side of the detach we are on.
pub enum Detachment {
    /// Invoking process: carries the status word the child reported
    Parent(i32),
    /// Detached child: must report its terminal status through the writer
    Child(HandshakeWriter),
}

pub trait Detach {
    /// Claim the standard streams before detaching. `None` means nothing to restore.
    fn acquire_stdio(&mut self) -> Result<Option<StdioOwnership>> {
        StdioOwnership::acquire().map(Some)
    }

    fn detach(&mut self) -> Result<Detachment>;
}

/// Real fork(2) based detacher.
#[derive(Debug, Default)]
pub struct ForkDetacher;

impl Detach for ForkDetacher {
    fn detach(&mut self) -> Result<Detachment> {
        let (reader, writer) = handshake_channel()?;

        // SAFETY: the daemon is single-threaded at this point; the child only
        // runs async-signal-safe detach steps before continuing startup.
        match unsafe { fork() }.map_err(|e| DaemonError::Daemonize(format!("fork() failed: {}", e)))? {
            ForkResult::Parent { child } => {
                writer.discard();
                log::debug!("Forked daemon child {}, waiting for startup status", child);
                let status = reader.wait();
                if status == 0 {
                    log::info!("Daemon startup successful");
                } else {
                    log::error!("Daemon startup failed");
                }
                Ok(Detachment::Parent(status))
            }
            ForkResult::Child => {
                drop(reader);
                detach_from_terminal()?;
                Ok(Detachment::Child(writer))
            }
        }
    }
}

/// New session and process group, stdio on /dev/null, no controlling tty.
fn detach_from_terminal() -> Result<()> {
    let _ = nix::unistd::setsid();
    // Already a group leader after setsid; the error is expected and harmless.
    let _ = nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0));

    let null_in = File::open("/dev/null")?;
    let null_out = OpenOptions::new().write(true).open("/dev/null")?;
    for (src, fd) in [
        (null_in.as_raw_fd(), libc::STDIN_FILENO),
        (null_out.as_raw_fd(), libc::STDOUT_FILENO),
        (null_out.as_raw_fd(), libc::STDERR_FILENO),
    ] {
        // SAFETY: both descriptors are open; dup2 replaces the standard one.
        if unsafe { libc::dup2(src, fd) } < 0 {
            let err = std::io::Error::last_os_error();
            return Err(DaemonError::Daemonize(format!(
                "Failed to redirect fd {} to /dev/null: {}",
                fd, err
            )));
        }
    }

    ignore_terminal_signals()?;

    if let Ok(tty) = OpenOptions::new().read(true).write(true).open("/dev/tty") {
        // SAFETY: TIOCNOTTY takes no argument; `tty` stays open for the call.
        unsafe { libc::ioctl(tty.as_raw_fd(), libc::TIOCNOTTY, 0) };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_guard_restores_standard_streams() {
        // Under a test harness stdin is rarely a foreground tty of another group.
        if let Ok(guard) = StdioOwnership::acquire() {
            drop(guard);
            // SAFETY: fcntl(F_GETFD) only queries the descriptor.
            let stdout_open = unsafe { libc::fcntl(libc::STDOUT_FILENO, libc::F_GETFD) } >= 0;
            assert!(stdout_open);
        }
    }
}

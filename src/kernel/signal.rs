//! Signal primitives: mask guard, signalfd-backed pending source, dispositions.
//!
//! Nothing here runs inside an OS signal handler. Control signals are blocked
//! and then read from a signalfd on the event-loop thread.

use crate::config::types::{DaemonError, Result};
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::str::FromStr;

/// Signals that must never be rebound: uncatchable or synchronous faults.
pub const UNBINDABLE: [Signal; 7] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGABRT,
];

/// Accepts `SIGHUP` or `HUP`
pub fn parse_signal_name(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).ok()
}

/// Blocks a signal set and restores the previous mask on drop.
pub struct SignalMaskGuard {
    previous: SigSet,
}

impl SignalMaskGuard {
    pub fn block(signals: &SigSet) -> Result<Self> {
        let mut previous = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(signals), Some(&mut previous))
            .map_err(|e| DaemonError::Signal(format!("Failed to block signals: {}", e)))?;
        Ok(Self { previous })
    }
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

/// Pending-signal source for an event loop. The set must already be blocked.
pub struct SignalSource {
    fd: SignalFd,
}

impl SignalSource {
    pub fn new(signals: &SigSet) -> Result<Self> {
        let fd = SignalFd::with_flags(signals, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| DaemonError::Signal(format!("Failed to create signalfd: {}", e)))?;
        Ok(Self { fd })
    }

    /// Drain every pending signal without blocking
    pub fn drain(&mut self) -> Result<Vec<Signal>> {
        let mut pending = Vec::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => {
                    if let Ok(sig) = Signal::try_from(info.ssi_signo as i32) {
                        pending.push(sig);
                    }
                }
                Ok(None) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(DaemonError::Signal(format!(
                        "Failed to read signalfd: {}",
                        e
                    )))
                }
            }
        }
        Ok(pending)
    }
}

impl AsRawFd for SignalSource {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Default disposition for everything catchable, then unblock all signals.
pub fn reset_dispositions() -> Result<()> {
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL registers no Rust handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| DaemonError::Signal(format!("Failed to unblock signals: {}", e)))?;
    Ok(())
}

pub fn ignore(sig: Signal) -> Result<()> {
    // SAFETY: SIG_IGN registers no handler code.
    unsafe { signal::signal(sig, SigHandler::SigIgn) }
        .map(|_| ())
        .map_err(|e| DaemonError::Signal(format!("Failed to ignore {}: {}", sig, e)))
}

/// SIGTTOU, SIGTTIN and SIGTSTP are ignored once detached
pub fn ignore_terminal_signals() -> Result<()> {
    for sig in [Signal::SIGTTOU, Signal::SIGTTIN, Signal::SIGTSTP] {
        ignore(sig)?;
    }
    Ok(())
}

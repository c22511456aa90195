//! One-shot readiness channel between a detaching child and its parent.
//!
//! Exactly one native-endian `i32` travels over a pipe: 0 for success,
//! anything else for failure. A writer dropped without an explicit report
//! writes 1, so every exit path of the child produces exactly one word.

use crate::config::types::{DaemonError, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

pub const HANDSHAKE_SUCCESS: i32 = 0;
pub const HANDSHAKE_FAILURE: i32 = 1;

/// Create the channel before forking. Both ends are close-on-exec.
pub fn handshake_channel() -> Result<(HandshakeReader, HandshakeWriter)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    // SAFETY: pipe2 fills exactly two descriptors into `fds`.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::Daemonize(format!("pipe failed: {}", err)));
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok((
        HandshakeReader { pipe: read },
        HandshakeWriter {
            pipe: Some(write),
        },
    ))
}

pub struct HandshakeReader {
    pipe: File,
}

impl HandshakeReader {
    /// Block for the status word. A short read, EOF or error counts as failure.
    pub fn wait(mut self) -> i32 {
        let mut word = [0u8; 4];
        match self.pipe.read_exact(&mut word) {
            Ok(()) => i32::from_ne_bytes(word),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::error!("Daemon exited without reporting its startup status");
                HANDSHAKE_FAILURE
            }
            Err(e) => {
                log::error!("read() failed: {}", e);
                HANDSHAKE_FAILURE
            }
        }
    }

    /// Every word until the writer is gone
    pub fn collect(mut self) -> Vec<i32> {
        let mut bytes = Vec::new();
        let _ = self.pipe.read_to_end(&mut bytes);
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

pub struct HandshakeWriter {
    pipe: Option<File>,
}

impl HandshakeWriter {
    /// Write the terminal status and close the channel
    pub fn report(mut self, code: i32) -> Result<()> {
        match self.pipe.take() {
            Some(pipe) => write_word(pipe, code),
            None => Ok(()),
        }
    }

    /// Close without writing. Only for the side of a fork that never reports.
    pub fn discard(mut self) {
        self.pipe.take();
    }
}

fn write_word(mut pipe: File, code: i32) -> Result<()> {
    pipe.write_all(&code.to_ne_bytes())
        .map_err(|e| DaemonError::Daemonize(format!("Failed to write startup status: {}", e)))
}

impl Drop for HandshakeWriter {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            let _ = write_word(pipe, HANDSHAKE_FAILURE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_report_is_the_only_word() {
        let (reader, writer) = handshake_channel().unwrap();
        writer.report(HANDSHAKE_SUCCESS).unwrap();
        assert_eq!(reader.collect(), vec![HANDSHAKE_SUCCESS]);
    }

    #[test]
    fn dropped_writer_reports_failure_once() {
        let (reader, writer) = handshake_channel().unwrap();
        drop(writer);
        assert_eq!(reader.collect(), vec![HANDSHAKE_FAILURE]);
    }

    #[test]
    fn discarded_writer_reads_as_failure() {
        let (reader, writer) = handshake_channel().unwrap();
        writer.discard();
        assert_eq!(reader.wait(), HANDSHAKE_FAILURE);
    }

    #[test]
    fn nonzero_status_passes_through() {
        let (reader, writer) = handshake_channel().unwrap();
        writer.report(3).unwrap();
        assert_eq!(reader.wait(), 3);
    }
}

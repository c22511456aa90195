//! Resources held by a starting daemon, released in reverse acquisition order.

use crate::core::daemonize::StdioOwnership;
use crate::core::handshake::{HandshakeWriter, HANDSHAKE_FAILURE};
use crate::core::signals::SignalController;
use crate::runtime::EventLoop;
use crate::safety::autospawn::AutospawnLock;
use crate::safety::pid_file::PidFile;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    SignalBindings,
    EventLoop,
    SingletonLock,
    AutospawnLock,
    Handshake,
    Stdio,
}

/// Field order is release order (and so also drop order).
#[derive(Default)]
pub(crate) struct Acquired {
    pub signals: Option<SignalController>,
    pub event_loop: Option<Box<dyn EventLoop>>,
    pub pid_file: Option<PidFile>,
    pub autospawn: Option<AutospawnLock>,
    pub handshake: Option<HandshakeWriter>,
    pub stdio: Option<StdioOwnership>,
    released: Vec<ResourceKind>,
}

impl Acquired {
    /// Release everything still held. A pending handshake gets `exit_code`.
    pub fn release_all(&mut self, exit_code: i32) {
        if let Some(signals) = self.signals.take() {
            drop(signals);
            self.released.push(ResourceKind::SignalBindings);
        }
        if let Some(event_loop) = self.event_loop.take() {
            drop(event_loop);
            self.released.push(ResourceKind::EventLoop);
        }
        if let Some(pid_file) = self.pid_file.take() {
            if let Err(e) = pid_file.remove() {
                log::warn!("{}", e);
            }
            self.released.push(ResourceKind::SingletonLock);
        }
        if let Some(lock) = self.autospawn.take() {
            lock.release();
            self.released.push(ResourceKind::AutospawnLock);
        }
        if let Some(handshake) = self.handshake.take() {
            if let Err(e) = handshake.report(exit_code) {
                log::warn!("{}", e);
            }
            self.released.push(ResourceKind::Handshake);
        }
        if let Some(stdio) = self.stdio.take() {
            drop(stdio);
            self.released.push(ResourceKind::Stdio);
        }
    }

    /// Drop the autospawn lock now that the start decision is made
    pub fn release_autospawn(&mut self) {
        if let Some(lock) = self.autospawn.take() {
            lock.release();
            self.released.push(ResourceKind::AutospawnLock);
        }
    }

    pub fn take_released(&mut self) -> Vec<ResourceKind> {
        std::mem::take(&mut self.released)
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        self.release_all(HANDSHAKE_FAILURE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handshake::handshake_channel;

    #[test]
    fn pending_handshake_gets_exit_code() {
        let (reader, writer) = handshake_channel().unwrap();
        let mut acquired = Acquired::default();
        acquired.handshake = Some(writer);
        acquired.release_all(0);
        assert_eq!(acquired.take_released(), vec![ResourceKind::Handshake]);
        assert_eq!(reader.collect(), vec![0]);
    }

    #[test]
    fn release_follows_field_order() {
        let dir = tempfile::tempdir().unwrap();
        let (reader, writer) = handshake_channel().unwrap();
        let mut acquired = Acquired::default();
        acquired.pid_file = Some(PidFile::acquire(&dir.path().join("pid"), None).unwrap());
        acquired.autospawn =
            Some(AutospawnLock::acquire(&dir.path().join("autospawn.lock")).unwrap());
        acquired.handshake = Some(writer);
        acquired.release_all(1);
        assert_eq!(
            acquired.take_released(),
            vec![
                ResourceKind::SingletonLock,
                ResourceKind::AutospawnLock,
                ResourceKind::Handshake
            ]
        );
        assert_eq!(reader.collect(), vec![1]);
        assert!(!dir.path().join("pid").exists());
    }

    #[test]
    fn dropping_unreleased_set_still_reports_failure() {
        let (reader, writer) = handshake_channel().unwrap();
        let mut acquired = Acquired::default();
        acquired.handshake = Some(writer);
        drop(acquired);
        assert_eq!(reader.collect(), vec![HANDSHAKE_FAILURE]);
    }
}

//! Collaborator boundary: event loop, module loader, policy check, status.
//!
//! The sequencer only talks to these traits. `Mainloop` and `ModuleRegistry`
//! are the reference implementations the binary runs with.

pub mod mainloop;
pub mod registry;

pub use mainloop::Mainloop;
pub use registry::ModuleRegistry;

use crate::config::types::Result;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Same-thread callback run by the event loop
pub type Callback = Box<dyn FnMut()>;

/// Identifies a registered watch or timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Cloneable request to stop the loop with an exit code. First request wins.
#[derive(Clone, Debug, Default)]
pub struct QuitHandle(Rc<Cell<Option<i32>>>);

impl QuitHandle {
    pub fn quit(&self, code: i32) {
        if self.0.get().is_none() {
            self.0.set(Some(code));
        }
    }

    pub fn requested(&self) -> Option<i32> {
        self.0.get()
    }
}

pub trait EventLoop {
    fn quit_handle(&self) -> QuitHandle;

    /// Run `callback` on the loop thread whenever `fd` becomes readable
    fn watch_readable(&mut self, fd: RawFd, callback: Callback) -> Result<WatchId>;

    /// Run `callback` every `period`
    fn add_timer(&mut self, period: Duration, callback: Callback) -> Result<WatchId>;

    fn remove(&mut self, id: WatchId);

    /// Dispatch until a quit is requested; returns the requested exit code
    fn run(&mut self) -> Result<i32>;
}

pub trait ModuleLoader {
    fn load(&mut self, name: &str, args: Option<&str>) -> Result<()>;

    /// Names of loaded modules, in load order
    fn loaded(&self) -> Vec<String>;
}

/// Shared handle: the sequencer and the signal controller both load modules
pub type SharedLoader = Rc<RefCell<dyn ModuleLoader>>;

pub trait PolicyCheck {
    fn check_privilege(&self, action: &str) -> bool;
}

/// Stand-in when no policy service is reachable: every check fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPolicy;

impl PolicyCheck for NoPolicy {
    fn check_privilege(&self, action: &str) -> bool {
        log::debug!("No policy service, denying '{}'", action);
        false
    }
}

pub trait StatusSource {
    /// Human-readable, multi-line status dump
    fn status_report(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_quit_request_wins() {
        let handle = QuitHandle::default();
        let other = handle.clone();
        assert_eq!(handle.requested(), None);
        other.quit(1);
        handle.quit(0);
        assert_eq!(handle.requested(), Some(1));
    }

    #[test]
    fn missing_policy_denies() {
        assert!(!NoPolicy.check_privilege("org.audiod.acquire-real-time"));
    }
}

//! Signal Controller: maps OS signals to daemon control actions.
//!
//! Bound signals are blocked and read from a signalfd registered with the
//! event loop, so every action runs on the loop thread in ordinary context.
//! All state lives in the controller; there are no process-wide globals.

use crate::config::types::{DaemonError, Result};
use crate::kernel::signal::{parse_signal_name, SignalMaskGuard, SignalSource, UNBINDABLE};
use crate::runtime::{EventLoop, QuitHandle, SharedLoader, StatusSource, WatchId};
use nix::sys::signal::{SigSet, Signal};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlAction {
    Shutdown,
    DumpStatus,
    LoadModule(String),
}

impl ControlAction {
    /// `shutdown`, `dump-status` or `load-module:<name>`
    pub fn parse(action: &str) -> Result<Self> {
        match action.trim() {
            "shutdown" => Ok(Self::Shutdown),
            "dump-status" => Ok(Self::DumpStatus),
            other => match other.strip_prefix("load-module:") {
                Some(name) if !name.trim().is_empty() => Ok(Self::LoadModule(name.trim().to_string())),
                _ => Err(DaemonError::Config(format!("Unknown signal action '{}'", other))),
            },
        }
    }
}

/// Signal -> action table owned by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalBindings {
    entries: Vec<(Signal, ControlAction)>,
}

impl Default for SignalBindings {
    fn default() -> Self {
        Self {
            entries: vec![
                (Signal::SIGINT, ControlAction::Shutdown),
                (Signal::SIGTERM, ControlAction::Shutdown),
                (Signal::SIGHUP, ControlAction::DumpStatus),
                (Signal::SIGUSR1, ControlAction::LoadModule("module-cli".to_string())),
                (
                    Signal::SIGUSR2,
                    ControlAction::LoadModule("module-cli-protocol-unix".to_string()),
                ),
            ],
        }
    }
}

impl SignalBindings {
    /// Defaults with configured overrides applied on top
    pub fn from_config(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut bindings = Self::default();
        for (name, action) in overrides {
            let signal = parse_signal_name(name)
                .ok_or_else(|| DaemonError::Config(format!("Unknown signal '{}'", name)))?;
            if UNBINDABLE.contains(&signal) {
                return Err(DaemonError::Config(format!("Signal {} cannot be bound", signal)));
            }
            bindings.bind(signal, ControlAction::parse(action)?);
        }
        Ok(bindings)
    }

    pub fn bind(&mut self, signal: Signal, action: ControlAction) {
        match self.entries.iter_mut().find(|(s, _)| *s == signal) {
            Some(entry) => entry.1 = action,
            None => self.entries.push((signal, action)),
        }
    }

    pub fn action(&self, signal: Signal) -> Option<&ControlAction> {
        self.entries.iter().find(|(s, _)| *s == signal).map(|(_, a)| a)
    }

    pub fn signal_set(&self) -> SigSet {
        let mut set = SigSet::empty();
        for (signal, _) in &self.entries {
            set.add(*signal);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why the running daemon stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(Signal),
    CpuOverload,
    LoopFailure,
}

impl ShutdownReason {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Signal(_) => 0,
            Self::CpuOverload | Self::LoopFailure => 1,
        }
    }
}

/// First recorded reason wins and stops the loop with its exit code.
#[derive(Clone, Debug, Default)]
pub struct ShutdownState(Rc<Cell<Option<ShutdownReason>>>);

impl ShutdownState {
    pub fn request(&self, reason: ShutdownReason, quit: &QuitHandle) {
        if self.0.get().is_none() {
            self.0.set(Some(reason));
            quit.quit(reason.exit_code());
        }
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.0.get()
    }
}

/// What bound actions operate on
#[derive(Clone)]
pub struct ControlTarget {
    pub loader: SharedLoader,
    pub status: Rc<dyn StatusSource>,
}

struct Dispatcher {
    bindings: SignalBindings,
    target: ControlTarget,
    shutdown: ShutdownState,
    quit: QuitHandle,
    active: Cell<bool>,
}

impl Dispatcher {
    fn dispatch(&self, signal: Signal) -> Option<ControlAction> {
        if !self.active.get() {
            return None;
        }
        let action = match self.bindings.action(signal) {
            Some(action) => action.clone(),
            None => {
                log::debug!("Ignoring unbound signal {}", signal);
                return None;
            }
        };

        match &action {
            ControlAction::Shutdown => {
                log::info!("Got signal {}, exiting", signal);
                self.shutdown.request(ShutdownReason::Signal(signal), &self.quit);
            }
            ControlAction::DumpStatus => {
                for line in self.target.status.status_report().lines() {
                    log::info!("{}", line);
                }
            }
            ControlAction::LoadModule(name) => {
                // try_borrow_mut: a load already in progress on this thread wins
                match self.target.loader.try_borrow_mut() {
                    Ok(mut loader) => {
                        if let Err(e) = loader.load(name, None) {
                            log::warn!("Signal {} could not load {}: {}", signal, name, e);
                        }
                    }
                    Err(_) => log::warn!("Module loader busy, dropping {} request", name),
                }
            }
        }
        Some(action)
    }
}

/// Installed bindings. Dropping it deactivates them and restores the signal mask.
pub struct SignalController {
    dispatcher: Rc<Dispatcher>,
    watch: WatchId,
    _source: Rc<RefCell<SignalSource>>,
    _mask: SignalMaskGuard,
}

impl SignalController {
    pub fn install(
        event_loop: &mut dyn EventLoop,
        bindings: SignalBindings,
        target: ControlTarget,
        shutdown: ShutdownState,
    ) -> Result<Self> {
        let set = bindings.signal_set();
        let mask = SignalMaskGuard::block(&set)?;
        let source = Rc::new(RefCell::new(SignalSource::new(&set)?));
        let count = bindings.len();

        let dispatcher = Rc::new(Dispatcher {
            bindings,
            target,
            shutdown,
            quit: event_loop.quit_handle(),
            active: Cell::new(true),
        });

        let fd = source.borrow().as_raw_fd();
        let loop_source = Rc::clone(&source);
        let loop_dispatcher = Rc::clone(&dispatcher);
        let watch = event_loop.watch_readable(
            fd,
            Box::new(move || {
                let pending = match loop_source.borrow_mut().drain() {
                    Ok(pending) => pending,
                    Err(e) => {
                        log::error!("{}", e);
                        return;
                    }
                };
                for signal in pending {
                    loop_dispatcher.dispatch(signal);
                }
            }),
        )?;

        log::debug!("Installed {} signal bindings", count);
        Ok(Self {
            dispatcher,
            watch,
            _source: source,
            _mask: mask,
        })
    }

    /// Run the action bound to `signal` as if it had been delivered
    pub fn dispatch(&self, signal: Signal) -> Option<ControlAction> {
        self.dispatcher.dispatch(signal)
    }

    pub fn watch_id(&self) -> WatchId {
        self.watch
    }
}

impl Drop for SignalController {
    fn drop(&mut self) {
        self.dispatcher.active.set(false);
        log::debug!("Signal bindings torn down");
    }
}

//! Startup sequencer: the ordered path from a freshly exec'd process to a
//! running daemon, and the unwind back out of it.
//!
//! The order is fixed and encoded in the type of [`Startup`]:
//!
//! ```text
//! Init -> CredentialsNegotiated -> LimitsApplied -> (Foreground | Daemonized)
//!      -> SingletonAcquired -> EventLoopCreated -> SignalsInstalled
//!      -> ModulesBootstrapped -> Running -> ShuttingDown -> Terminated
//! ```
//!
//! Every transition consumes the previous state. A failing step yields a
//! [`Halt`] that still owns everything acquired so far; [`Halt::finish`]
//! releases it in reverse acquisition order and writes the handshake word.
//!
//! Skipping a step does not compile:
//!
//! ```compile_fail
//! use audiod::startup::{Init, Startup};
//!
//! fn skip_privileges(startup: Startup<Init>) {
//!     let _ = startup.acquire_singleton();
//! }
//! ```
//!
//! ```compile_fail
//! use audiod::startup::{SignalsInstalled, Startup};
//!
//! fn ready_without_modules(startup: Startup<SignalsInstalled>) {
//!     let _ = startup.ready();
//! }
//! ```
//!
//! ```compile_fail
//! use audiod::startup::{Init, Startup};
//!
//! fn negotiate_twice(startup: Startup<Init>) {
//!     let _ = startup.negotiate_credentials();
//!     let _ = startup.negotiate_credentials();
//! }
//! ```

mod context;
pub mod resources;

pub use resources::ResourceKind;

use crate::config::types::{DaemonCommand, DaemonConfig, DaemonError, Result, StartupWarning};
use crate::core::daemonize::{Detach, ForkDetacher};
use crate::core::privilege::{PrivilegeOps, SystemPrivileges};
use crate::core::signals::ShutdownReason;
use crate::core::types::{CapabilityDecision, CredentialState, SchedulingGrant};
use crate::observability::logging::LogSink;
use crate::observability::status::InstanceInfo;
use crate::runtime::{EventLoop, Mainloop, ModuleRegistry, NoPolicy, PolicyCheck, SharedLoader};
use crate::utils::paths::RuntimePaths;
use context::StartupContext;
use serde::Serialize;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

/// States the sequencer passes through, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupState {
    Init,
    CredentialsNegotiated,
    LimitsApplied,
    Foreground,
    Daemonized,
    SingletonAcquired,
    EventLoopCreated,
    SignalsInstalled,
    ModulesBootstrapped,
    Running,
    ShuttingDown,
    Terminated,
}

pub struct Init;
pub struct CredentialsNegotiated;
pub struct LimitsApplied;
pub struct Foreground;
pub struct Daemonized;
pub struct SingletonAcquired;
pub struct EventLoopCreated;
pub struct SignalsInstalled;
pub struct ModulesBootstrapped;
pub struct Running;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Foreground {}
    impl Sealed for super::Daemonized {}
}

/// The two states that may take the singleton lock
pub trait ModeState: sealed::Sealed {}
impl ModeState for Foreground {}
impl ModeState for Daemonized {}

/// Builds the event loop once the singleton is held
pub type LoopFactory = Box<dyn FnOnce() -> Result<Box<dyn EventLoop>>>;

/// Everything outside this crate's control that the sequencer drives
pub struct Collaborators {
    pub privileges: Box<dyn PrivilegeOps>,
    pub policy: Box<dyn PolicyCheck>,
    pub detacher: Box<dyn Detach>,
    pub loader: SharedLoader,
    pub event_loop: LoopFactory,
    /// Retargeted to the detached log once the process leaves its terminal
    pub log_sink: Option<LogSink>,
    /// Compared against `/proc/<pid>/comm` when judging a PID file stale
    pub process_name: Option<String>,
}

impl Collaborators {
    /// Live OS implementations
    pub fn system(log_sink: Option<LogSink>) -> Self {
        let loader: SharedLoader = Rc::new(RefCell::new(ModuleRegistry::default()));
        Self {
            privileges: Box::new(SystemPrivileges),
            policy: Box::new(NoPolicy),
            detacher: Box::new(ForkDetacher),
            loader,
            event_loop: Box::new(|| Ok(Box::new(Mainloop::new()) as Box<dyn EventLoop>)),
            log_sink,
            process_name: Some(env!("CARGO_PKG_NAME").to_string()),
        }
    }
}

/// Result of one transition
pub type Step<T> = std::result::Result<Startup<T>, Halt>;

/// A starting daemon in state `S`
pub struct Startup<S> {
    ctx: Box<StartupContext>,
    _state: PhantomData<S>,
}

impl<S> Startup<S> {
    fn advance<T>(mut self, state: StartupState) -> Startup<T> {
        log::debug!("Startup state: {:?}", state);
        self.ctx.states.push(state);
        Startup {
            ctx: self.ctx,
            _state: PhantomData,
        }
    }

    fn step<T>(
        mut self,
        state: StartupState,
        action: impl FnOnce(&mut StartupContext) -> Result<()>,
    ) -> Step<T> {
        match action(&mut *self.ctx) {
            Ok(()) => Ok(self.advance(state)),
            Err(e) => Err(Halt::from_error(self.ctx, e)),
        }
    }

    /// Stop here with `error`; nothing acquired so far is leaked
    pub fn abort(self, error: DaemonError) -> Halt {
        Halt::from_error(self.ctx, error)
    }

    pub fn states(&self) -> &[StartupState] {
        &self.ctx.states
    }

    pub fn warnings(&self) -> &[StartupWarning] {
        &self.ctx.warnings
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.ctx.config
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.ctx.paths
    }

    pub fn instance(&self) -> &InstanceInfo {
        &self.ctx.instance
    }
}

impl<S> std::fmt::Debug for Startup<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Startup")
            .field("states", &self.ctx.states)
            .finish()
    }
}

impl Startup<Init> {
    pub fn new(config: DaemonConfig, paths: RuntimePaths, collaborators: Collaborators) -> Self {
        let ctx = StartupContext::new(config, paths, collaborators);
        log::debug!("Startup state: {:?}", StartupState::Init);
        Self {
            ctx: Box::new(ctx),
            _state: PhantomData,
        }
    }

    /// Use an identity created earlier, e.g. to tag log lines before startup
    pub fn with_instance(mut self, instance: InstanceInfo) -> Self {
        self.ctx.instance = instance;
        self
    }

    /// Credentials the caller already narrowed before touching any file;
    /// `negotiate_credentials` then only justifies scheduling wishes.
    pub fn with_credentials(mut self, credentials: CredentialState) -> Self {
        self.ctx.restricted = Some(credentials);
        self
    }

    /// Narrow to CAP_SYS_NICE on the real ids and justify scheduling wishes
    pub fn negotiate_credentials(self) -> Step<CredentialsNegotiated> {
        self.step(StartupState::CredentialsNegotiated, |ctx| {
            ctx.negotiate_credentials()
        })
    }
}

impl Startup<CredentialsNegotiated> {
    /// Resource limits, nice level, then keep or drop CAP_SYS_NICE for good
    pub fn apply_limits(self) -> Step<LimitsApplied> {
        self.step(StartupState::LimitsApplied, |ctx| ctx.apply_limits())
    }
}

/// Where the process continues after the daemonize decision
pub enum ModeSelected {
    Foreground(Startup<Foreground>),
    Daemonized(Startup<Daemonized>),
}

impl ModeSelected {
    pub fn is_daemonized(&self) -> bool {
        matches!(self, Self::Daemonized(_))
    }

    pub fn acquire_singleton(self) -> Step<SingletonAcquired> {
        match self {
            Self::Foreground(startup) => startup.acquire_singleton(),
            Self::Daemonized(startup) => startup.acquire_singleton(),
        }
    }
}

impl Startup<LimitsApplied> {
    /// Stay attached or fork. In the invoking process this ends in
    /// [`HaltReason::HandedOff`] carrying the child's status word.
    pub fn select_mode(mut self) -> std::result::Result<ModeSelected, Halt> {
        match self.ctx.select_mode() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(Halt {
                    ctx: self.ctx,
                    reason: HaltReason::HandedOff(status),
                })
            }
            Err(e) => return Err(Halt::from_error(self.ctx, e)),
        }
        if let Err(e) = self.ctx.enter_daemon_context() {
            return Err(Halt::from_error(self.ctx, e));
        }

        if self.ctx.detached {
            Ok(ModeSelected::Daemonized(self.advance(StartupState::Daemonized)))
        } else {
            Ok(ModeSelected::Foreground(self.advance(StartupState::Foreground)))
        }
    }
}

impl<M: ModeState> Startup<M> {
    /// PID file lock; the autospawn lock is let go once this is decided
    pub fn acquire_singleton(self) -> Step<SingletonAcquired> {
        self.step(StartupState::SingletonAcquired, |ctx| {
            ctx.acquire_singleton()
        })
    }
}

impl Startup<SingletonAcquired> {
    pub fn create_event_loop(self) -> Step<EventLoopCreated> {
        self.step(StartupState::EventLoopCreated, |ctx| ctx.create_event_loop())
    }
}

impl Startup<EventLoopCreated> {
    pub fn install_signals(self) -> Step<SignalsInstalled> {
        self.step(StartupState::SignalsInstalled, |ctx| ctx.install_signals())
    }
}

impl Startup<SignalsInstalled> {
    /// Load the configured modules; at least one must end up loaded
    pub fn bootstrap_modules(self) -> Step<ModulesBootstrapped> {
        self.step(StartupState::ModulesBootstrapped, |ctx| {
            ctx.bootstrap_modules()
        })
    }
}

impl Startup<ModulesBootstrapped> {
    /// Report success to a waiting parent
    pub fn ready(self) -> Step<Running> {
        self.step(StartupState::Running, |ctx| ctx.report_ready())
    }
}

impl Startup<Running> {
    /// Hand control to the event loop until shutdown, then unwind
    pub fn run(mut self) -> Outcome {
        let exit_code = self.ctx.run_loop();
        self.ctx.finish(exit_code)
    }
}

#[derive(Debug)]
pub enum HaltReason {
    Failed(DaemonError),
    /// Another instance holds the singleton lock
    AlreadyRunning(Option<u32>),
    /// Invoking process after a fork; carries the child's status word
    HandedOff(i32),
}

/// Startup stopped before reaching `Running`
pub struct Halt {
    ctx: Box<StartupContext>,
    reason: HaltReason,
}

impl Halt {
    fn from_error(ctx: Box<StartupContext>, error: DaemonError) -> Self {
        let reason = match error {
            DaemonError::AlreadyRunning { pid } => HaltReason::AlreadyRunning(pid),
            other => HaltReason::Failed(other),
        };
        Self { ctx, reason }
    }

    pub fn reason(&self) -> &HaltReason {
        &self.reason
    }

    pub fn states(&self) -> &[StartupState] {
        &self.ctx.states
    }

    /// Unwind and pick the exit code
    pub fn finish(mut self) -> Outcome {
        let exit_code = match &self.reason {
            HaltReason::Failed(e) => {
                log::error!("{}", e);
                1
            }
            HaltReason::AlreadyRunning(pid) => {
                let e = DaemonError::AlreadyRunning { pid: *pid };
                if self.ctx.config.command == DaemonCommand::Start {
                    log::info!("{}", e);
                    0
                } else {
                    log::error!("{}", e);
                    1
                }
            }
            HaltReason::HandedOff(status) => *status,
        };
        let mut outcome = self.ctx.finish(exit_code);
        outcome.handed_off = matches!(self.reason, HaltReason::HandedOff(_));
        outcome
    }
}

impl std::fmt::Debug for Halt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Halt")
            .field("reason", &self.reason)
            .field("states", &self.ctx.states)
            .finish()
    }
}

/// How the process ended up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub exit_code: i32,
    pub states: Vec<StartupState>,
    /// Resources in the order they were let go
    pub released: Vec<ResourceKind>,
    pub warnings: Vec<StartupWarning>,
    pub credentials: Option<CredentialState>,
    pub grant: Option<SchedulingGrant>,
    pub decision: CapabilityDecision,
    pub shutdown: Option<ShutdownReason>,
    /// This is the invoking process of a daemonized start
    pub handed_off: bool,
}

/// Run every transition up to `Running`
pub fn boot(startup: Startup<Init>) -> Step<Running> {
    startup
        .negotiate_credentials()?
        .apply_limits()?
        .select_mode()?
        .acquire_singleton()?
        .create_event_loop()?
        .install_signals()?
        .bootstrap_modules()?
        .ready()
}

/// Boot, run and unwind
pub fn run(startup: Startup<Init>) -> Outcome {
    match boot(startup) {
        Ok(running) => running.run(),
        Err(halt) => halt.finish(),
    }
}

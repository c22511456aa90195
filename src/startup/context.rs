//! What each sequencer step actually does to the process.

use super::resources::Acquired;
use super::{Collaborators, LoopFactory, Outcome, StartupState};
use crate::config::types::{DaemonCommand, DaemonConfig, DaemonError, Result, StartupWarning};
use crate::core::daemonize::{Detach, Detachment};
use crate::core::handshake::HANDSHAKE_SUCCESS;
use crate::core::privilege::{PrivilegeNegotiator, PrivilegeOps};
use crate::core::signals::{
    ControlTarget, ShutdownReason, ShutdownState, SignalBindings, SignalController,
};
use crate::core::types::{
    CapabilityDecision, CredentialState, SchedulingGrant, SchedulingRequest,
};
use crate::core::watchdog;
use crate::kernel::credentials::SystemIdentity;
use crate::kernel::signal;
use crate::observability::logging::{open_target, LogSink};
use crate::observability::status::{DaemonStatus, InstanceInfo};
use crate::runtime::{PolicyCheck, SharedLoader};
use crate::safety::autospawn::AutospawnLock;
use crate::safety::pid_file::{ensure_vacant, PidFile};
use crate::utils::paths::{export_env, system_identity_env, RuntimePaths, ENV_INTERNAL, ENV_SYSTEM};
use nix::sys::signal::Signal;
use nix::sys::stat::{umask, Mode};
use std::rc::Rc;

const RUNTIME_DIR_MODE: u32 = 0o700;
const SYSTEM_RUNTIME_DIR_MODE: u32 = 0o755;
const SYSTEM_STATE_DIR_MODE: u32 = 0o700;

pub(super) struct StartupContext {
    pub config: DaemonConfig,
    pub paths: RuntimePaths,
    pub instance: InstanceInfo,
    privileges: Box<dyn PrivilegeOps>,
    policy: Box<dyn PolicyCheck>,
    detacher: Box<dyn Detach>,
    loader: SharedLoader,
    event_loop_factory: Option<LoopFactory>,
    log_sink: Option<LogSink>,
    process_name: Option<String>,
    pub restricted: Option<CredentialState>,
    credentials: Option<CredentialState>,
    grant: Option<SchedulingGrant>,
    decision: CapabilityDecision,
    pub warnings: Vec<StartupWarning>,
    system_identity: Option<SystemIdentity>,
    pub detached: bool,
    pub states: Vec<StartupState>,
    shutdown: ShutdownState,
    acquired: Acquired,
}

impl StartupContext {
    pub fn new(config: DaemonConfig, paths: RuntimePaths, collaborators: Collaborators) -> Self {
        Self {
            config,
            paths,
            instance: InstanceInfo::new(),
            privileges: collaborators.privileges,
            policy: collaborators.policy,
            detacher: collaborators.detacher,
            loader: collaborators.loader,
            event_loop_factory: Some(collaborators.event_loop),
            log_sink: collaborators.log_sink,
            process_name: collaborators.process_name,
            restricted: None,
            credentials: None,
            grant: None,
            decision: CapabilityDecision::NotHeld,
            warnings: Vec::new(),
            system_identity: None,
            detached: false,
            states: vec![StartupState::Init],
            shutdown: ShutdownState::default(),
            acquired: Acquired::default(),
        }
    }

    fn scheduling_request(&self) -> SchedulingRequest {
        SchedulingRequest {
            want_high_priority: self.config.high_priority,
            want_realtime: self.config.realtime_scheduling,
            nice_level: self.config.nice_level,
            realtime_priority: self.config.realtime_priority,
        }
    }

    fn negotiated(&self) -> Result<(CredentialState, SchedulingGrant)> {
        match (self.credentials, self.grant) {
            (Some(credentials), Some(grant)) => Ok((credentials, grant)),
            _ => Err(DaemonError::Privilege(
                "Credentials have not been negotiated".to_string(),
            )),
        }
    }

    fn note_warnings(&mut self, warnings: Vec<StartupWarning>) {
        for warning in &warnings {
            log::warn!("{}", warning);
        }
        self.warnings.extend(warnings);
    }

    pub fn negotiate_credentials(&mut self) -> Result<()> {
        let request = self.scheduling_request();
        let mut warnings = Vec::new();
        let restricted = self.restricted.take();
        let mut negotiator =
            PrivilegeNegotiator::new(self.privileges.as_mut(), self.policy.as_ref());
        let credentials = match restricted {
            Some(credentials) => credentials,
            None => negotiator.restrict_identity()?,
        };

        if credentials.is_real_root() && !self.config.system_instance {
            log::warn!("This program is not intended to be run as root (unless --system is specified)");
        } else if !credentials.is_real_root() && self.config.system_instance {
            return Err(DaemonError::Privilege(
                "Root privileges required for a system instance".to_string(),
            ));
        }

        let grant = negotiator.justify_grant(
            &credentials,
            &request,
            &self.config.realtime_group,
            &mut warnings,
        );
        self.credentials = Some(credentials);
        self.grant = Some(grant);
        self.note_warnings(warnings);
        Ok(())
    }

    pub fn apply_limits(&mut self) -> Result<()> {
        let (mut credentials, grant) = self.negotiated()?;
        let request = self.scheduling_request();
        let starts_daemon = self.config.command.starts_daemon();

        let mut negotiator =
            PrivilegeNegotiator::new(self.privileges.as_mut(), self.policy.as_ref());
        let mut warnings = negotiator.apply_limits(&self.config.rlimits);
        if starts_daemon {
            warnings.extend(negotiator.raise_priority(&credentials, &grant, &request));
        }
        let decision =
            negotiator.settle_capability(&mut credentials, &grant, &request, starts_daemon)?;

        self.credentials = Some(credentials);
        self.decision = decision;
        self.note_warnings(warnings);
        Ok(())
    }

    /// `Some(status)` in the invoking process of a fork
    pub fn select_mode(&mut self) -> Result<Option<i32>> {
        if self.config.system_instance {
            let identity = self
                .privileges
                .lookup_system_identity(&self.config.system_user, &self.config.system_group)?;
            let owner = Some((identity.uid, identity.gid));
            self.privileges
                .prepare_dir(&self.paths.runtime_dir, SYSTEM_RUNTIME_DIR_MODE, owner)?;
            self.privileges
                .prepare_dir(&self.paths.state_dir, SYSTEM_STATE_DIR_MODE, owner)?;
            self.system_identity = Some(identity);
        } else {
            self.privileges
                .prepare_dir(&self.paths.runtime_dir, RUNTIME_DIR_MODE, None)?;
        }

        if self.config.command == DaemonCommand::Start {
            self.acquired.autospawn = Some(AutospawnLock::acquire(&self.paths.autospawn_lock)?);
            // Answer a live daemon from here instead of forking a child that would find it
            if self.config.daemonize && self.config.use_pid_file {
                ensure_vacant(&self.paths.pid_file, self.process_name.as_deref())?;
            }
        }

        if !self.config.daemonize {
            return Ok(None);
        }

        self.acquired.stdio = self.detacher.acquire_stdio()?;
        match self.detacher.detach()? {
            Detachment::Parent(status) => Ok(Some(status)),
            Detachment::Child(writer) => {
                self.acquired.handshake = Some(writer);
                if let Some(stdio) = self.acquired.stdio.take() {
                    stdio.relinquish();
                }
                // The invoking process unlinks and unlocks it
                if let Some(lock) = self.acquired.autospawn.take() {
                    lock.close_inherited();
                }
                self.detached = true;
                self.instance.pid = std::process::id();
                self.retarget_log()?;
                Ok(None)
            }
        }
    }

    fn retarget_log(&mut self) -> Result<()> {
        if let Some(sink) = &self.log_sink {
            let writer = open_target(&self.config.log_target, true, &self.paths.runtime_dir)?;
            sink.retarget(writer);
            log::debug!("Logging retargeted after detaching");
        }
        Ok(())
    }

    /// Process-wide settings every daemon runs with, plus the system user switch
    pub fn enter_daemon_context(&mut self) -> Result<()> {
        export_env(ENV_INTERNAL, "1");
        std::env::set_current_dir("/")?;
        umask(Mode::from_bits_truncate(0o022));

        if let Some(identity) = &self.system_identity {
            self.privileges.switch_to_system_user(identity)?;
            for (key, value) in system_identity_env(identity) {
                export_env(key, &value);
            }
            log::info!(
                "Running as system user '{}' (uid {}, gid {})",
                identity.user,
                identity.uid,
                identity.gid
            );
        }

        export_env(ENV_SYSTEM, if self.config.system_instance { "1" } else { "0" });
        Ok(())
    }

    pub fn acquire_singleton(&mut self) -> Result<()> {
        if self.config.use_pid_file {
            let pid_file = PidFile::acquire(&self.paths.pid_file, self.process_name.as_deref())?;
            self.acquired.pid_file = Some(pid_file);
        }
        self.acquired.release_autospawn();
        signal::ignore(Signal::SIGPIPE)?;
        Ok(())
    }

    pub fn create_event_loop(&mut self) -> Result<()> {
        let factory = self
            .event_loop_factory
            .take()
            .ok_or_else(|| DaemonError::EventLoop("Event loop already created".to_string()))?;
        let mut event_loop = factory()?;

        if self.config.no_cpu_limit {
            log::debug!("CPU load watchdog disabled");
        } else {
            watchdog::install(event_loop.as_mut(), self.shutdown.clone())?;
        }
        self.acquired.event_loop = Some(event_loop);
        Ok(())
    }

    pub fn install_signals(&mut self) -> Result<()> {
        let (credentials, grant) = self.negotiated()?;
        let bindings = SignalBindings::from_config(&self.config.signal_bindings)?;
        let status = DaemonStatus {
            instance: self.instance.clone(),
            system_instance: self.config.system_instance,
            runtime_dir: self.paths.runtime_dir.clone(),
            credentials,
            grant,
            decision: self.decision,
            loader: Rc::clone(&self.loader),
        };
        let target = ControlTarget {
            loader: Rc::clone(&self.loader),
            status: Rc::new(status),
        };

        let event_loop = self
            .acquired
            .event_loop
            .as_mut()
            .ok_or_else(|| DaemonError::EventLoop("No event loop to install signals on".to_string()))?;
        let controller =
            SignalController::install(event_loop.as_mut(), bindings, target, self.shutdown.clone())?;
        self.acquired.signals = Some(controller);
        Ok(())
    }

    pub fn bootstrap_modules(&mut self) -> Result<()> {
        for spec in &self.config.modules {
            let result = self.loader.borrow_mut().load(&spec.name, spec.args.as_deref());
            match result {
                Ok(()) => log::debug!("Loaded {}", spec.name),
                Err(e) if self.config.fail => {
                    log::error!("Module load failed: {}", spec.name);
                    return Err(e);
                }
                Err(e) => log::warn!("Module {} failed to load, continuing: {}", spec.name, e),
            }
        }

        let loaded = self.loader.borrow().loaded();
        if loaded.is_empty() {
            return Err(DaemonError::NoModulesLoaded);
        }
        log::info!("{} module(s) loaded: {}", loaded.len(), loaded.join(", "));
        Ok(())
    }

    pub fn report_ready(&mut self) -> Result<()> {
        if let Some(writer) = self.acquired.handshake.take() {
            writer.report(HANDSHAKE_SUCCESS)?;
        }
        log::info!("Daemon startup complete");
        Ok(())
    }

    /// Exit code for a daemon that reached `Running`
    pub fn run_loop(&mut self) -> i32 {
        let event_loop = match self.acquired.event_loop.as_mut() {
            Some(event_loop) => event_loop,
            None => {
                log::error!("Running without an event loop");
                return 1;
            }
        };
        let quit = event_loop.quit_handle();
        match event_loop.run() {
            Ok(code) => self.shutdown.reason().map_or(code, ShutdownReason::exit_code),
            Err(e) => {
                log::error!("{}", e);
                self.shutdown.request(ShutdownReason::LoopFailure, &quit);
                ShutdownReason::LoopFailure.exit_code()
            }
        }
    }

    /// Release everything in reverse acquisition order
    pub fn finish(&mut self, exit_code: i32) -> Outcome {
        self.states.push(StartupState::ShuttingDown);
        log::debug!("Startup state: {:?}", StartupState::ShuttingDown);
        self.acquired.release_all(exit_code);
        self.states.push(StartupState::Terminated);
        log::info!("Daemon terminated with exit code {}", exit_code);

        Outcome {
            exit_code,
            states: std::mem::take(&mut self.states),
            released: self.acquired.take_released(),
            warnings: std::mem::take(&mut self.warnings),
            credentials: self.credentials,
            grant: self.grant,
            decision: self.decision,
            shutdown: self.shutdown.reason(),
            handed_off: false,
        }
    }
}

//! In-process stand-ins for the OS seams of the sequencer
//!
//! Every fake keeps its state in plain fields or behind a probe handle so
//! tests can inject failures at any transition and inspect what happened
//! afterwards, without root, forking or a real event loop.

use crate::config::types::{DaemonError, Result};
use crate::core::daemonize::{Detach, Detachment, StdioOwnership};
use crate::core::handshake::{handshake_channel, HandshakeReader};
use crate::core::privilege::PrivilegeOps;
use crate::kernel::capabilities::{CapabilityMask, CapabilityNumber};
use crate::kernel::credentials::{ProcessIds, SystemIdentity};
use crate::kernel::rlimit::LimitKind;
use crate::runtime::{Callback, EventLoop, ModuleLoader, PolicyCheck, QuitHandle, WatchId};
use crate::startup::LoopFactory;
use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// Every capability up to CAP_CHECKPOINT_RESTORE
const ALL_CAPABILITIES: CapabilityMask = CapabilityMask::from_bits((1 << 41) - 1);

/// Credential and limit state of a pretend process.
#[derive(Clone, Debug)]
pub struct FakePrivileges {
    pub ruid: u32,
    pub euid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub permitted: CapabilityMask,
    pub effective: CapabilityMask,
    pub groups: Vec<String>,
    pub limits: BTreeMap<LimitKind, (u64, u64)>,
    pub failing_limits: Vec<LimitKind>,
    /// RLIMIT_RTPRIO values above this are refused
    pub rtprio_ceiling: Option<u64>,
    pub nice: Option<i32>,
    pub fail_nice: bool,
    /// Privilege operations in the order they were made
    pub calls: Vec<&'static str>,
    /// Whether `watched` existed at each uid drop
    pub watched: Option<PathBuf>,
    pub watched_at_drop: Vec<bool>,
    pub drop_to_real_calls: usize,
    pub fail_drop_to_real: bool,
    pub fail_restrict: bool,
    pub system_identity: Option<SystemIdentity>,
    pub switched_to: Option<u32>,
    pub prepared_dirs: Vec<(PathBuf, u32)>,
}

impl FakePrivileges {
    fn with_ids(ruid: u32, euid: u32, caps: CapabilityMask) -> Self {
        Self {
            ruid,
            euid,
            rgid: ruid,
            egid: euid,
            permitted: caps,
            effective: caps,
            groups: Vec::new(),
            limits: BTreeMap::new(),
            failing_limits: Vec::new(),
            rtprio_ceiling: None,
            nice: None,
            fail_nice: false,
            calls: Vec::new(),
            watched: None,
            watched_at_drop: Vec::new(),
            drop_to_real_calls: 0,
            fail_drop_to_real: false,
            fail_restrict: false,
            system_identity: None,
            switched_to: None,
            prepared_dirs: Vec::new(),
        }
    }

    pub fn real_root() -> Self {
        Self::with_ids(0, 0, ALL_CAPABILITIES)
    }

    pub fn suid_root(uid: u32) -> Self {
        Self::with_ids(uid, 0, ALL_CAPABILITIES)
    }

    pub fn unprivileged(uid: u32) -> Self {
        Self::with_ids(uid, uid, CapabilityMask::EMPTY)
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.groups.push(group.to_string());
        self
    }

    pub fn with_system_identity(mut self, identity: SystemIdentity) -> Self {
        self.system_identity = Some(identity);
        self
    }

    /// Record whether `path` exists each time the uid is dropped
    pub fn watching(mut self, path: &Path) -> Self {
        self.watched = Some(path.to_path_buf());
        self
    }
}

impl PrivilegeOps for FakePrivileges {
    fn process_ids(&self) -> Result<ProcessIds> {
        Ok(ProcessIds {
            real_uid: self.ruid,
            effective_uid: self.euid,
            saved_uid: self.euid,
            real_gid: self.rgid,
            effective_gid: self.egid,
        })
    }

    fn restrict_to_sys_nice(&mut self) -> Result<()> {
        self.calls.push("restrict_to_sys_nice");
        if self.fail_restrict {
            return Err(DaemonError::Privilege("capset failed: EPERM".to_string()));
        }
        self.permitted = if self.permitted.contains(CapabilityNumber::SYS_NICE) {
            CapabilityMask::only(CapabilityNumber::SYS_NICE)
        } else {
            CapabilityMask::EMPTY
        };
        self.effective = self.permitted;
        Ok(())
    }

    fn drop_to_real_ids(&mut self) -> Result<()> {
        self.calls.push("drop_to_real_ids");
        self.drop_to_real_calls += 1;
        if let Some(path) = &self.watched {
            self.watched_at_drop.push(path.exists());
        }
        if self.fail_drop_to_real {
            return Err(DaemonError::Privilege("setresuid failed: EPERM".to_string()));
        }
        self.euid = self.ruid;
        self.egid = self.rgid;
        // Kept capabilities survive in the permitted set only
        self.effective = CapabilityMask::EMPTY;
        Ok(())
    }

    fn drop_all_capabilities(&mut self) -> Result<()> {
        self.calls.push("drop_all_capabilities");
        self.permitted = CapabilityMask::EMPTY;
        self.effective = CapabilityMask::EMPTY;
        Ok(())
    }

    fn effective_capabilities(&self) -> Result<CapabilityMask> {
        Ok(self.effective)
    }

    fn in_group(&self, group: &str) -> Result<bool> {
        Ok(self.groups.iter().any(|g| g == group))
    }

    fn get_rlimit(&self, kind: LimitKind) -> Result<(u64, u64)> {
        Ok(self.limits.get(&kind).copied().unwrap_or((0, u64::MAX)))
    }

    fn set_rlimit(&mut self, kind: LimitKind, soft: u64, hard: u64) -> Result<()> {
        let over_ceiling = kind == LimitKind::Rtprio && self.rtprio_ceiling.map_or(false, |c| soft > c);
        if over_ceiling || self.failing_limits.contains(&kind) {
            return Err(DaemonError::Privilege(format!(
                "setrlimit({}) failed: EPERM",
                kind.name()
            )));
        }
        self.limits.insert(kind, (soft, hard));
        Ok(())
    }

    fn set_nice(&mut self, level: i32) -> Result<()> {
        if self.fail_nice {
            return Err(DaemonError::Privilege(format!("setpriority({}) failed: EACCES", level)));
        }
        self.nice = Some(level);
        Ok(())
    }

    fn lookup_system_identity(&self, user: &str, group: &str) -> Result<SystemIdentity> {
        self.system_identity.clone().ok_or_else(|| {
            DaemonError::Identity(format!("Failed to find user '{}' / group '{}'", user, group))
        })
    }

    fn switch_to_system_user(&mut self, identity: &SystemIdentity) -> Result<()> {
        self.ruid = identity.uid;
        self.euid = identity.uid;
        self.rgid = identity.gid;
        self.egid = identity.gid;
        self.permitted = CapabilityMask::EMPTY;
        self.effective = CapabilityMask::EMPTY;
        self.switched_to = Some(identity.uid);
        Ok(())
    }

    fn prepare_dir(&mut self, path: &Path, mode: u32, _owner: Option<(u32, u32)>) -> Result<()> {
        self.prepared_dirs.push((path.to_path_buf(), mode));
        Ok(())
    }
}

/// Policy service answering yes to a fixed set of actions
#[derive(Clone, Debug, Default)]
pub struct FakePolicy {
    allowed: Vec<String>,
}

impl FakePolicy {
    pub fn allowing(actions: &[&str]) -> Self {
        Self {
            allowed: actions.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl PolicyCheck for FakePolicy {
    fn check_privilege(&self, action: &str) -> bool {
        self.allowed.iter().any(|a| a == action)
    }
}

/// One iteration of a [`ScriptedLoop`]
#[derive(Clone, Debug)]
pub enum LoopStep {
    /// raise(3) the signal on this thread, then run the readable callbacks
    Raise(Signal),
    FireTimers,
    Fail(String),
}

#[derive(Debug, Default)]
struct LoopRecord {
    created: bool,
    dropped: bool,
    watches: usize,
    timers: usize,
    quit_after_step: Vec<Option<i32>>,
}

/// Read-only view of a [`ScriptedLoop`] after it moved into the sequencer.
#[derive(Clone, Debug, Default)]
pub struct LoopProbe(Rc<RefCell<LoopRecord>>);

impl LoopProbe {
    pub fn created(&self) -> bool {
        self.0.borrow().created
    }

    pub fn dropped(&self) -> bool {
        self.0.borrow().dropped
    }

    pub fn watches(&self) -> usize {
        self.0.borrow().watches
    }

    pub fn timers(&self) -> usize {
        self.0.borrow().timers
    }

    /// Quit request observed after each executed step
    pub fn quit_after_step(&self) -> Vec<Option<i32>> {
        self.0.borrow().quit_after_step.clone()
    }
}

/// Event loop that runs a fixed script instead of polling.
pub struct ScriptedLoop {
    script: VecDeque<LoopStep>,
    quit: QuitHandle,
    readable: Vec<(WatchId, Callback)>,
    timers: Vec<(WatchId, Callback)>,
    next_id: u64,
    probe: LoopProbe,
}

impl ScriptedLoop {
    pub fn new(script: Vec<LoopStep>) -> (Self, LoopProbe) {
        let probe = LoopProbe::default();
        let event_loop = Self {
            script: script.into(),
            quit: QuitHandle::default(),
            readable: Vec::new(),
            timers: Vec::new(),
            next_id: 0,
            probe: probe.clone(),
        };
        (event_loop, probe)
    }

    pub fn into_factory(self) -> LoopFactory {
        Box::new(move || {
            self.probe.0.borrow_mut().created = true;
            Ok(Box::new(self) as Box<dyn EventLoop>)
        })
    }

    /// Factory whose construction fails
    pub fn failing_factory(message: &str) -> LoopFactory {
        let message = message.to_string();
        Box::new(move || Err(DaemonError::EventLoop(message)))
    }

    fn next_id(&mut self) -> WatchId {
        self.next_id += 1;
        WatchId(self.next_id)
    }
}

impl EventLoop for ScriptedLoop {
    fn quit_handle(&self) -> QuitHandle {
        self.quit.clone()
    }

    fn watch_readable(&mut self, _fd: RawFd, callback: Callback) -> Result<WatchId> {
        let id = self.next_id();
        self.readable.push((id, callback));
        self.probe.0.borrow_mut().watches += 1;
        Ok(id)
    }

    fn add_timer(&mut self, _period: Duration, callback: Callback) -> Result<WatchId> {
        let id = self.next_id();
        self.timers.push((id, callback));
        self.probe.0.borrow_mut().timers += 1;
        Ok(id)
    }

    fn remove(&mut self, id: WatchId) {
        self.readable.retain(|(w, _)| *w != id);
        self.timers.retain(|(w, _)| *w != id);
    }

    fn run(&mut self) -> Result<i32> {
        while let Some(step) = self.script.pop_front() {
            match step {
                LoopStep::Raise(signal) => {
                    // SAFETY: raise(3) only queues a signal for this thread.
                    unsafe { libc::raise(signal as libc::c_int) };
                    for (_, callback) in self.readable.iter_mut() {
                        callback();
                    }
                }
                LoopStep::FireTimers => {
                    for (_, callback) in self.timers.iter_mut() {
                        callback();
                    }
                }
                LoopStep::Fail(message) => return Err(DaemonError::EventLoop(message)),
            }

            let requested = self.quit.requested();
            self.probe.0.borrow_mut().quit_after_step.push(requested);
            if let Some(code) = requested {
                return Ok(code);
            }
        }
        Err(DaemonError::EventLoop(
            "Script ended without a quit request".to_string(),
        ))
    }
}

impl Drop for ScriptedLoop {
    fn drop(&mut self) {
        self.probe.0.borrow_mut().dropped = true;
    }
}

/// Module loader that records every attempt
#[derive(Clone, Debug, Default)]
pub struct RecordingLoader {
    pub attempts: Vec<String>,
    pub loaded: Vec<String>,
    pub failing: Vec<String>,
}

impl RecordingLoader {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl ModuleLoader for RecordingLoader {
    fn load(&mut self, name: &str, _args: Option<&str>) -> Result<()> {
        self.attempts.push(name.to_string());
        if self.failing.iter().any(|n| n == name) {
            return Err(DaemonError::Module(format!("{} failed to initialize", name)));
        }
        if !self.loaded.iter().any(|n| n == name) {
            self.loaded.push(name.to_string());
        }
        Ok(())
    }

    fn loaded(&self) -> Vec<String> {
        self.loaded.clone()
    }
}

/// Reading end of the handshake an [`InProcessDetacher`] handed out.
#[derive(Clone, Default)]
pub struct HandshakeProbe(Rc<RefCell<Option<HandshakeReader>>>);

impl HandshakeProbe {
    /// Every status word written. Only call once the writer is gone.
    pub fn words(&self) -> Vec<i32> {
        match self.0.borrow_mut().take() {
            Some(reader) => reader.collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Child,
    Parent(i32),
}

/// Detacher that never forks: plays either side of the fork.
pub struct InProcessDetacher {
    role: Role,
    fail_stdio: bool,
    probe: HandshakeProbe,
}

impl InProcessDetacher {
    /// Continue as the detached child; the probe sees what it reports
    pub fn child() -> (Self, HandshakeProbe) {
        let probe = HandshakeProbe::default();
        let detacher = Self {
            role: Role::Child,
            fail_stdio: false,
            probe: probe.clone(),
        };
        (detacher, probe)
    }

    /// Continue as the invoking process whose child reported `status`
    pub fn parent(status: i32) -> Self {
        Self {
            role: Role::Parent(status),
            fail_stdio: false,
            probe: HandshakeProbe::default(),
        }
    }

    pub fn failing_stdio() -> Self {
        Self {
            fail_stdio: true,
            ..Self::parent(0)
        }
    }
}

impl Detach for InProcessDetacher {
    fn acquire_stdio(&mut self) -> Result<Option<StdioOwnership>> {
        if self.fail_stdio {
            return Err(DaemonError::Daemonize(
                "Failed to acquire stdio: terminal is owned by another process group".to_string(),
            ));
        }
        Ok(None)
    }

    fn detach(&mut self) -> Result<Detachment> {
        match self.role {
            Role::Child => {
                let (reader, writer) = handshake_channel()?;
                *self.probe.0.borrow_mut() = Some(reader);
                Ok(Detachment::Child(writer))
            }
            Role::Parent(status) => Ok(Detachment::Parent(status)),
        }
    }
}

//! Privilege negotiation: narrow credentials, justify scheduling grants,
//! apply resource limits and settle the one capability we may keep.
//!
//! Steps run in a fixed order:
//! 1. classify the starting identity (real root is left untouched)
//! 2. restrict capabilities to CAP_SYS_NICE, drop to the real ids, re-raise
//! 3. justify requested scheduling via realtime group or policy service
//! 4. apply the configured resource limits (failures are warnings)
//! 5. keep or drop CAP_SYS_NICE; dropping is one-way

use crate::config::types::{DaemonError, Result, StartupWarning};
use crate::core::types::{
    Capability, CapabilityDecision, CredentialState, DropReason, GrantSource, SchedulingGrant,
    SchedulingRequest, StartIdentity,
};
use crate::kernel::capabilities::{self, CapabilityMask, CapabilityNumber};
use crate::kernel::credentials::{self, ProcessIds, SystemIdentity};
use crate::kernel::rlimit::{self, LimitKind, ResourceLimitSet};
use crate::runtime::PolicyCheck;
use crate::utils::paths::ensure_dir;
use std::path::Path;

pub const ACTION_HIGH_PRIORITY: &str = "org.audiod.acquire-high-priority";
pub const ACTION_REAL_TIME: &str = "org.audiod.acquire-real-time";

/// RLIMIT_RTPRIO ceiling tried when substituting for CAP_SYS_NICE
const MIN_RTPRIO_SUBSTITUTE: u64 = 9;

/// OS operations the negotiator needs. `SystemPrivileges` is the real one.
pub trait PrivilegeOps {
    fn process_ids(&self) -> Result<ProcessIds>;
    /// Permitted and effective sets become CAP_SYS_NICE (or nothing)
    fn restrict_to_sys_nice(&mut self) -> Result<()>;
    /// All uids and gids become the real ones, keeping permitted capabilities
    fn drop_to_real_ids(&mut self) -> Result<()>;
    fn drop_all_capabilities(&mut self) -> Result<()>;
    fn effective_capabilities(&self) -> Result<CapabilityMask>;
    fn in_group(&self, group: &str) -> Result<bool>;
    fn get_rlimit(&self, kind: LimitKind) -> Result<(u64, u64)>;
    fn set_rlimit(&mut self, kind: LimitKind, soft: u64, hard: u64) -> Result<()>;
    fn set_nice(&mut self, level: i32) -> Result<()>;
    fn lookup_system_identity(&self, user: &str, group: &str) -> Result<SystemIdentity>;
    fn switch_to_system_user(&mut self, identity: &SystemIdentity) -> Result<()>;

    /// Create a runtime or state directory, optionally handing it to `owner`
    fn prepare_dir(&mut self, path: &Path, mode: u32, owner: Option<(u32, u32)>) -> Result<()> {
        ensure_dir(path, mode, owner)
    }
}

/// Live process credentials.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPrivileges;

impl PrivilegeOps for SystemPrivileges {
    fn process_ids(&self) -> Result<ProcessIds> {
        ProcessIds::current()
    }

    fn restrict_to_sys_nice(&mut self) -> Result<()> {
        capabilities::restrict_to(CapabilityNumber::SYS_NICE)
    }

    fn drop_to_real_ids(&mut self) -> Result<()> {
        credentials::drop_to_real_ids()
    }

    fn drop_all_capabilities(&mut self) -> Result<()> {
        capabilities::drop_all_capabilities()
    }

    fn effective_capabilities(&self) -> Result<CapabilityMask> {
        capabilities::effective_capabilities()
    }

    fn in_group(&self, group: &str) -> Result<bool> {
        credentials::in_group(group)
    }

    fn get_rlimit(&self, kind: LimitKind) -> Result<(u64, u64)> {
        rlimit::get_limit(kind)
    }

    fn set_rlimit(&mut self, kind: LimitKind, soft: u64, hard: u64) -> Result<()> {
        rlimit::set_limit(kind, soft, hard)
    }

    fn set_nice(&mut self, level: i32) -> Result<()> {
        // SAFETY: setpriority on our own process (who = 0) touches no memory.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, level) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(DaemonError::Privilege(format!(
                "setpriority({}) failed: {}",
                level, err
            )));
        }
        Ok(())
    }

    fn lookup_system_identity(&self, user: &str, group: &str) -> Result<SystemIdentity> {
        credentials::lookup_system_identity(user, group)
    }

    fn switch_to_system_user(&mut self, identity: &SystemIdentity) -> Result<()> {
        credentials::switch_to_system_user(identity)
    }
}

/// Everything `negotiate` decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Negotiation {
    pub credentials: CredentialState,
    pub grant: SchedulingGrant,
    pub decision: CapabilityDecision,
    pub warnings: Vec<StartupWarning>,
}

pub struct PrivilegeNegotiator<'a> {
    ops: &'a mut dyn PrivilegeOps,
    policy: &'a dyn PolicyCheck,
}

impl<'a> PrivilegeNegotiator<'a> {
    pub fn new(ops: &'a mut dyn PrivilegeOps, policy: &'a dyn PolicyCheck) -> Self {
        Self { ops, policy }
    }

    /// Full negotiation in one call
    pub fn negotiate(
        &mut self,
        request: &SchedulingRequest,
        limits: &ResourceLimitSet,
        realtime_group: &str,
        starts_daemon: bool,
    ) -> Result<Negotiation> {
        let mut warnings = Vec::new();
        let mut credentials = self.restrict_identity()?;
        let grant = self.justify_grant(&credentials, request, realtime_group, &mut warnings);
        warnings.extend(self.apply_limits(limits));
        if starts_daemon {
            warnings.extend(self.raise_priority(&credentials, &grant, request));
        }
        let decision = self.settle_capability(&mut credentials, &grant, request, starts_daemon)?;
        Ok(Negotiation {
            credentials,
            grant,
            decision,
            warnings,
        })
    }

    /// Classify, and for anything but real root narrow to CAP_SYS_NICE on the real ids.
    pub fn restrict_identity(&mut self) -> Result<CredentialState> {
        let ids = self.ops.process_ids()?;
        let origin = StartIdentity::classify(ids.real_uid, ids.effective_uid);

        if origin.is_real_root() {
            log::debug!("Started as real root, credentials left untouched");
            return Ok(CredentialState {
                origin,
                retained: None,
            });
        }

        if let Err(e) = self.ops.restrict_to_sys_nice() {
            if origin.is_suid_root() {
                return Err(e);
            }
            log::debug!("Could not restrict capability sets: {}", e);
        }

        // Fatal on failure: never continue half de-privileged.
        self.ops.drop_to_real_ids()?;

        // The uid change cleared the effective set; raise CAP_SYS_NICE again.
        if let Err(e) = self.ops.restrict_to_sys_nice() {
            if origin.is_suid_root() {
                return Err(e);
            }
            log::debug!("Could not re-raise capability sets: {}", e);
        }

        let held = self
            .ops
            .effective_capabilities()
            .map(|mask| mask.contains(CapabilityNumber::SYS_NICE))
            .unwrap_or(false);

        Ok(CredentialState {
            origin,
            retained: held.then_some(Capability::SysNice),
        })
    }

    /// Group membership first, then the policy service. Never assumed.
    pub fn justify_grant(
        &self,
        credentials: &CredentialState,
        request: &SchedulingRequest,
        realtime_group: &str,
        warnings: &mut Vec<StartupWarning>,
    ) -> SchedulingGrant {
        let mut grant = SchedulingGrant::denied(request);
        if credentials.is_real_root() || !(request.want_high_priority || request.want_realtime) {
            return grant;
        }

        match self.ops.in_group(realtime_group) {
            Ok(true) => {
                log::info!("Member of group '{}', allowing elevated scheduling", realtime_group);
                grant.granted_high_priority = request.want_high_priority;
                grant.granted_realtime = request.want_realtime;
                grant.grant_source = GrantSource::GroupMembership;
                return grant;
            }
            Ok(false) => {}
            Err(e) => log::warn!("Group membership check failed: {}", e),
        }

        if request.want_high_priority && self.policy.check_privilege(ACTION_HIGH_PRIORITY) {
            grant.granted_high_priority = true;
        }
        if request.want_realtime && self.policy.check_privilege(ACTION_REAL_TIME) {
            grant.granted_realtime = true;
        }
        if grant.any_granted() {
            grant.grant_source = GrantSource::PolicyService;
        }

        if request.want_high_priority && !grant.granted_high_priority {
            warnings.push(StartupWarning::DegradedCapability(
                "high-priority scheduling requested but not allowed".to_string(),
            ));
        }
        if request.want_realtime && !grant.granted_realtime {
            warnings.push(StartupWarning::DegradedCapability(
                "real-time scheduling requested but not allowed".to_string(),
            ));
        }
        grant
    }

    /// soft = hard = value per configured kind; each failure is a warning
    pub fn apply_limits(&mut self, limits: &ResourceLimitSet) -> Vec<StartupWarning> {
        let mut warnings = Vec::new();
        for (kind, value) in limits.configured() {
            if let Err(e) = self.ops.set_rlimit(kind, value, value) {
                warnings.push(StartupWarning::ResourceLimit {
                    kind,
                    value,
                    reason: e.to_string(),
                });
            }
        }
        warnings
    }

    /// Apply the nice level whenever high priority was asked for. Without a
    /// grant this can still succeed through RLIMIT_NICE.
    pub fn raise_priority(
        &mut self,
        credentials: &CredentialState,
        grant: &SchedulingGrant,
        request: &SchedulingRequest,
    ) -> Option<StartupWarning> {
        if !request.want_high_priority {
            return None;
        }
        match self.ops.set_nice(request.nice_level) {
            Ok(()) => {
                log::info!("Successfully gained nice level {}", request.nice_level);
                None
            }
            Err(e) => {
                if !(credentials.is_real_root() || grant.granted_high_priority) {
                    log::info!("Raise RLIMIT_NICE or join the realtime group to allow high priority");
                }
                Some(StartupWarning::DegradedCapability(e.to_string()))
            }
        }
    }

    /// Keep CAP_SYS_NICE only for a daemon with a realtime grant that no
    /// verified RLIMIT_RTPRIO ceiling can stand in for.
    pub fn settle_capability(
        &mut self,
        credentials: &mut CredentialState,
        grant: &SchedulingGrant,
        request: &SchedulingRequest,
        starts_daemon: bool,
    ) -> Result<CapabilityDecision> {
        if credentials.is_real_root() || credentials.retained.is_none() {
            return Ok(CapabilityDecision::NotHeld);
        }

        let reason = if !starts_daemon {
            Some(DropReason::NotDaemon)
        } else if !grant.any_granted() {
            Some(DropReason::NoGrant)
        } else if !grant.granted_realtime {
            Some(DropReason::RealtimeNotGranted)
        } else {
            self.rtprio_substitute(request.realtime_priority as u64)
                .map(|ceiling| DropReason::RtprioSubstitute { ceiling })
        };

        match reason {
            Some(reason) => {
                self.ops.drop_all_capabilities()?;
                credentials.retained = None;
                log::info!("Dropped CAP_SYS_NICE ({:?})", reason);
                Ok(CapabilityDecision::Dropped(reason))
            }
            None => {
                log::info!("Retaining CAP_SYS_NICE for real-time scheduling");
                Ok(CapabilityDecision::Retained)
            }
        }
    }

    /// Verified RLIMIT_RTPRIO soft limit if it covers `wanted`
    fn rtprio_substitute(&mut self, wanted: u64) -> Option<u64> {
        let (soft, _) = self.ops.get_rlimit(LimitKind::Rtprio).ok()?;
        if soft < wanted {
            let target = wanted.max(MIN_RTPRIO_SUBSTITUTE);
            if let Err(e) = self.ops.set_rlimit(LimitKind::Rtprio, target, target) {
                log::debug!("Could not raise RLIMIT_RTPRIO to {}: {}", target, e);
            }
        }
        let (verified, _) = self.ops.get_rlimit(LimitKind::Rtprio).ok()?;
        (verified >= wanted).then_some(verified)
    }

    /// Narrow credentials for commands that never run a daemon
    pub fn relinquish_for_command(&mut self) -> Result<CredentialState> {
        let mut credentials = self.restrict_identity()?;
        self.release_retained(&mut credentials)?;
        Ok(credentials)
    }

    /// Give up a capability kept by `restrict_identity`
    pub fn release_retained(&mut self, credentials: &mut CredentialState) -> Result<()> {
        if credentials.retained.take().is_some() {
            self.ops.drop_all_capabilities()?;
        }
        Ok(())
    }
}

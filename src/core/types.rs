//! Credential and scheduling state produced by privilege negotiation.

use serde::Serialize;

/// How the process was started, from the real/effective uid comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartIdentity {
    RealRoot,
    SuidRoot,
    Unprivileged,
}

impl StartIdentity {
    pub fn classify(real_uid: u32, effective_uid: u32) -> Self {
        if real_uid == 0 {
            Self::RealRoot
        } else if effective_uid == 0 {
            Self::SuidRoot
        } else {
            Self::Unprivileged
        }
    }

    pub fn is_real_root(self) -> bool {
        self == Self::RealRoot
    }

    pub fn is_suid_root(self) -> bool {
        self == Self::SuidRoot
    }
}

/// The only capability the daemon may ever keep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Capability {
    SysNice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialState {
    pub origin: StartIdentity,
    pub retained: Option<Capability>,
}

impl CredentialState {
    pub fn is_real_root(&self) -> bool {
        self.origin.is_real_root()
    }

    pub fn is_suid_root(&self) -> bool {
        self.origin.is_suid_root()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulingRequest {
    pub want_high_priority: bool,
    pub want_realtime: bool,
    pub nice_level: i32,
    pub realtime_priority: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantSource {
    GroupMembership,
    PolicyService,
    None,
}

/// Invariant: a granted flag is only ever set together with a source other than `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SchedulingGrant {
    pub wants_high_priority: bool,
    pub wants_realtime: bool,
    pub granted_high_priority: bool,
    pub granted_realtime: bool,
    pub grant_source: GrantSource,
}

impl SchedulingGrant {
    pub fn denied(request: &SchedulingRequest) -> Self {
        Self {
            wants_high_priority: request.want_high_priority,
            wants_realtime: request.want_realtime,
            granted_high_priority: false,
            granted_realtime: false,
            grant_source: GrantSource::None,
        }
    }

    pub fn any_granted(&self) -> bool {
        self.granted_high_priority || self.granted_realtime
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    /// Neither group membership nor policy justified a grant
    NoGrant,
    RealtimeNotGranted,
    /// The command does not go on to run a daemon
    NotDaemon,
    /// A verified RLIMIT_RTPRIO ceiling covers the requested priority
    RtprioSubstitute { ceiling: u64 },
}

/// What happened to the retained capability at the end of negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityDecision {
    /// Real root, or nothing was held to begin with
    NotHeld,
    Dropped(DropReason),
    Retained,
}

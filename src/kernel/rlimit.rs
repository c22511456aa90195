//! Resource limits (`getrlimit`/`setrlimit`).
//!
//! Each configured limit is applied as soft = hard = value. Unset entries are
//! left at whatever the process inherited.

use crate::config::types::{DaemonError, Result};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Fsize,
    Data,
    Stack,
    Core,
    Rss,
    Nproc,
    Nofile,
    Memlock,
    As,
    Locks,
    Sigpending,
    Msgqueue,
    Nice,
    Rtprio,
    Rttime,
}

impl LimitKind {
    pub const ALL: [LimitKind; 15] = [
        Self::Fsize,
        Self::Data,
        Self::Stack,
        Self::Core,
        Self::Rss,
        Self::Nproc,
        Self::Nofile,
        Self::Memlock,
        Self::As,
        Self::Locks,
        Self::Sigpending,
        Self::Msgqueue,
        Self::Nice,
        Self::Rtprio,
        Self::Rttime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Fsize => "RLIMIT_FSIZE",
            Self::Data => "RLIMIT_DATA",
            Self::Stack => "RLIMIT_STACK",
            Self::Core => "RLIMIT_CORE",
            Self::Rss => "RLIMIT_RSS",
            Self::Nproc => "RLIMIT_NPROC",
            Self::Nofile => "RLIMIT_NOFILE",
            Self::Memlock => "RLIMIT_MEMLOCK",
            Self::As => "RLIMIT_AS",
            Self::Locks => "RLIMIT_LOCKS",
            Self::Sigpending => "RLIMIT_SIGPENDING",
            Self::Msgqueue => "RLIMIT_MSGQUEUE",
            Self::Nice => "RLIMIT_NICE",
            Self::Rtprio => "RLIMIT_RTPRIO",
            Self::Rttime => "RLIMIT_RTTIME",
        }
    }

    fn resource(self) -> Resource {
        match self {
            Self::Fsize => Resource::RLIMIT_FSIZE,
            Self::Data => Resource::RLIMIT_DATA,
            Self::Stack => Resource::RLIMIT_STACK,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Rss => Resource::RLIMIT_RSS,
            Self::Nproc => Resource::RLIMIT_NPROC,
            Self::Nofile => Resource::RLIMIT_NOFILE,
            Self::Memlock => Resource::RLIMIT_MEMLOCK,
            Self::As => Resource::RLIMIT_AS,
            Self::Locks => Resource::RLIMIT_LOCKS,
            Self::Sigpending => Resource::RLIMIT_SIGPENDING,
            Self::Msgqueue => Resource::RLIMIT_MSGQUEUE,
            Self::Nice => Resource::RLIMIT_NICE,
            Self::Rtprio => Resource::RLIMIT_RTPRIO,
            Self::Rttime => Resource::RLIMIT_RTTIME,
        }
    }
}

/// Ordered limit-kind -> optional ceiling. `None` means "leave at OS default".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLimitSet(BTreeMap<LimitKind, Option<u64>>);

impl ResourceLimitSet {
    pub fn set(&mut self, kind: LimitKind, value: Option<u64>) {
        self.0.insert(kind, value);
    }

    pub fn get(&self, kind: LimitKind) -> Option<u64> {
        self.0.get(&kind).copied().flatten()
    }

    /// Entries that carry a value, in kind order
    pub fn configured(&self) -> impl Iterator<Item = (LimitKind, u64)> + '_ {
        self.0
            .iter()
            .filter_map(|(kind, value)| value.map(|v| (*kind, v)))
    }

    pub fn is_empty(&self) -> bool {
        self.configured().next().is_none()
    }
}

/// Current (soft, hard) pair for `kind`
pub fn get_limit(kind: LimitKind) -> Result<(u64, u64)> {
    getrlimit(kind.resource())
        .map(|(soft, hard)| (soft as u64, hard as u64))
        .map_err(|e| DaemonError::Io(std::io::Error::from(e)))
}

/// Set soft and hard limit for `kind`
pub fn set_limit(kind: LimitKind, soft: u64, hard: u64) -> Result<()> {
    setrlimit(
        kind.resource(),
        soft as libc::rlim_t,
        hard as libc::rlim_t,
    )
    .map_err(|e| DaemonError::Io(std::io::Error::from(e)))?;
    log::debug!("Set {} to ({}, {})", kind.name(), soft, hard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_skips_unset_entries_in_order() {
        let mut limits = ResourceLimitSet::default();
        limits.set(LimitKind::Rtprio, Some(9));
        limits.set(LimitKind::Core, None);
        limits.set(LimitKind::Fsize, Some(4096));

        let configured: Vec<_> = limits.configured().collect();
        assert_eq!(
            configured,
            vec![(LimitKind::Fsize, 4096), (LimitKind::Rtprio, 9)]
        );
        assert_eq!(limits.get(LimitKind::Core), None);
        assert!(!limits.is_empty());
    }

    #[test]
    fn empty_set_has_nothing_configured() {
        let mut limits = ResourceLimitSet::default();
        assert!(limits.is_empty());
        limits.set(LimitKind::Nofile, None);
        assert!(limits.is_empty());
    }

    #[test]
    fn current_limits_are_readable() {
        for kind in LimitKind::ALL {
            let (soft, hard) = get_limit(kind).unwrap();
            assert!(soft <= hard, "{} soft above hard", kind.name());
        }
    }

    #[test]
    fn lowering_soft_nofile_within_hard_succeeds() {
        let (soft, hard) = get_limit(LimitKind::Nofile).unwrap();
        assert!(set_limit(LimitKind::Nofile, soft, hard).is_ok());
    }
}

//! UID/GID transitions for privilege dropping.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid.

mod transition;
mod validation;

pub use transition::{drop_to_real_ids, switch_to_system_user};
pub use validation::{lookup_system_identity, validate_system_identity, SystemIdentity};

use crate::config::types::{DaemonError, Result};

/// Real/effective/saved id snapshot of the calling process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessIds {
    pub real_uid: u32,
    pub effective_uid: u32,
    pub saved_uid: u32,
    pub real_gid: u32,
    pub effective_gid: u32,
}

impl ProcessIds {
    pub fn current() -> Result<Self> {
        let uids = nix::unistd::getresuid()?;
        let gids = nix::unistd::getresgid()?;
        Ok(Self {
            real_uid: uids.real.as_raw(),
            effective_uid: uids.effective.as_raw(),
            saved_uid: uids.saved.as_raw(),
            real_gid: gids.real.as_raw(),
            effective_gid: gids.effective.as_raw(),
        })
    }

    pub fn is_real_root(&self) -> bool {
        self.real_uid == 0
    }

    /// Root only through the set-user-id bit
    pub fn is_suid_root(&self) -> bool {
        self.real_uid != 0 && self.effective_uid == 0
    }
}

/// Whether the process is a member (primary or supplementary) of `group`.
///
/// An unknown group is reported as non-membership.
pub fn in_group(group: &str) -> Result<bool> {
    let gid = match nix::unistd::Group::from_name(group) {
        Ok(Some(g)) => g.gid,
        Ok(None) => {
            log::debug!("Group '{}' does not exist", group);
            return Ok(false);
        }
        Err(e) => {
            return Err(DaemonError::Identity(format!(
                "Failed to look up group '{}': {}",
                group, e
            )))
        }
    };

    if nix::unistd::getgid() == gid || nix::unistd::getegid() == gid {
        return Ok(true);
    }
    let supplementary = nix::unistd::getgroups()?;
    Ok(supplementary.contains(&gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_matches_libc() {
        let ids = ProcessIds::current().unwrap();
        assert_eq!(ids.real_uid, nix::unistd::getuid().as_raw());
        assert_eq!(ids.effective_uid, nix::unistd::geteuid().as_raw());
        assert!(!(ids.is_real_root() && ids.is_suid_root()));
    }

    #[test]
    fn unknown_group_is_not_membership() {
        assert!(!in_group("audiod-no-such-group-xyz").unwrap());
    }

    #[test]
    fn primary_group_counts_as_membership() {
        let gid = nix::unistd::getgid();
        if let Ok(Some(group)) = nix::unistd::Group::from_gid(gid) {
            assert!(in_group(&group.name).unwrap());
        }
    }
}

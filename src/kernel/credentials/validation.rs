//! System user/group lookup for the system-wide instance.

use crate::config::types::{DaemonError, Result};
use std::path::PathBuf;

/// Resolved identity the system instance runs as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemIdentity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Resolve `user` and `group`; both must exist and agree on the primary gid.
pub fn lookup_system_identity(user: &str, group: &str) -> Result<SystemIdentity> {
    let pw = nix::unistd::User::from_name(user)
        .map_err(|e| DaemonError::Identity(format!("Failed to look up user '{}': {}", user, e)))?
        .ok_or_else(|| DaemonError::Identity(format!("Failed to find user '{}'", user)))?;

    let gr = nix::unistd::Group::from_name(group)
        .map_err(|e| DaemonError::Identity(format!("Failed to look up group '{}': {}", group, e)))?
        .ok_or_else(|| DaemonError::Identity(format!("Failed to find group '{}'", group)))?;

    let identity = SystemIdentity {
        user: pw.name,
        uid: pw.uid.as_raw(),
        gid: pw.gid.as_raw(),
        home: pw.dir,
    };
    validate_system_identity(&identity, gr.gid.as_raw())?;
    Ok(identity)
}

/// Reject root targets and a primary gid that differs from the configured group.
pub fn validate_system_identity(identity: &SystemIdentity, group_gid: u32) -> Result<()> {
    if identity.uid == 0 || identity.gid == 0 {
        return Err(DaemonError::Identity(format!(
            "System user '{}' must not be root (uid={}, gid={})",
            identity.user, identity.uid, identity.gid
        )));
    }
    if identity.gid != group_gid {
        return Err(DaemonError::Identity(format!(
            "GID of user '{}' ({}) and of group ({}) don't match",
            identity.user, identity.gid, group_gid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uid: u32, gid: u32) -> SystemIdentity {
        SystemIdentity {
            user: "audiod".to_string(),
            uid,
            gid,
            home: PathBuf::from("/var/lib/audiod"),
        }
    }

    #[test]
    fn rejects_root_identity() {
        assert!(validate_system_identity(&identity(0, 500), 500).is_err());
        assert!(validate_system_identity(&identity(500, 0), 0).is_err());
    }

    #[test]
    fn rejects_gid_mismatch() {
        let err = validate_system_identity(&identity(500, 500), 501).unwrap_err();
        assert!(matches!(err, DaemonError::Identity(_)));
    }

    #[test]
    fn accepts_consistent_identity() {
        assert!(validate_system_identity(&identity(500, 500), 500).is_ok());
    }

    #[test]
    fn missing_user_is_identity_error() {
        let err = lookup_system_identity("audiod-no-such-user-xyz", "root").unwrap_err();
        assert!(matches!(err, DaemonError::Identity(_)));
    }
}

//! UID/GID transitions away from root.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid, otherwise the gid
//! change is no longer permitted.

use super::validation::SystemIdentity;
use crate::config::types::{DaemonError, Result};
use crate::kernel::capabilities::set_keep_caps;
use std::ffi::CString;

/// Give up set-user-id root: all ids become the real ids.
///
/// Permitted capabilities survive (keep-caps); the effective set is cleared
/// by the kernel and must be re-raised by the caller.
pub fn drop_to_real_ids() -> Result<()> {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    set_keep_caps(true)?;
    let dropped = set_gid(gid).and_then(|_| set_uid(uid));
    let reset = set_keep_caps(false);
    dropped?;
    reset?;
    verify_transition(uid, gid)?;

    log::info!("Dropped root, now running as UID={}, GID={}", uid, gid);
    Ok(())
}

/// initgroups -> setresgid -> setresuid -> verify.
pub fn switch_to_system_user(identity: &SystemIdentity) -> Result<()> {
    let name = CString::new(identity.user.as_str()).map_err(|_| {
        DaemonError::Identity(format!("Invalid user name '{}'", identity.user))
    })?;
    nix::unistd::initgroups(&name, nix::unistd::Gid::from_raw(identity.gid)).map_err(|e| {
        DaemonError::Privilege(format!(
            "Failed to initialize supplementary groups for '{}': {}",
            identity.user, e
        ))
    })?;

    // CRITICAL: GID before UID
    set_gid(identity.gid)?;
    set_uid(identity.uid)?;
    verify_transition(identity.uid, identity.gid)?;

    log::info!(
        "Switched to system user '{}' (UID={}, GID={})",
        identity.user,
        identity.uid,
        identity.gid
    );
    Ok(())
}

/// MUST be called BEFORE set_uid.
fn set_gid(gid: u32) -> Result<()> {
    // SAFETY: setresgid atomically sets all three GIDs and touches no memory.
    let result =
        unsafe { libc::setresgid(gid as libc::gid_t, gid as libc::gid_t, gid as libc::gid_t) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::Privilege(format!(
            "Failed to setresgid({}): {}",
            gid, err
        )));
    }
    log::debug!("Set GID to {}", gid);
    Ok(())
}

/// MUST be called AFTER set_gid.
fn set_uid(uid: u32) -> Result<()> {
    // SAFETY: setresuid atomically sets all three UIDs and touches no memory.
    let result =
        unsafe { libc::setresuid(uid as libc::uid_t, uid as libc::uid_t, uid as libc::uid_t) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::Privilege(format!(
            "Failed to setresuid({}): {}",
            uid, err
        )));
    }
    log::debug!("Set UID to {}", uid);
    Ok(())
}

fn verify_transition(expected_uid: u32, expected_gid: u32) -> Result<()> {
    let uids = nix::unistd::getresuid()?;
    let gids = nix::unistd::getresgid()?;

    let uid_ok = [uids.real, uids.effective, uids.saved]
        .iter()
        .all(|u| u.as_raw() == expected_uid);
    if !uid_ok {
        return Err(DaemonError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}, saved={}",
            expected_uid, uids.real, uids.effective, uids.saved
        )));
    }

    let gid_ok = [gids.real, gids.effective, gids.saved]
        .iter()
        .all(|g| g.as_raw() == expected_gid);
    if !gid_ok {
        return Err(DaemonError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}, saved={}",
            expected_gid, gids.real, gids.effective, gids.saved
        )));
    }
    Ok(())
}

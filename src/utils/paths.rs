//! Runtime/state directory resolution and environment exports for helpers.

use crate::config::types::{DaemonError, Result};
use crate::kernel::credentials::SystemIdentity;
use crate::safety::autospawn::AUTOSPAWN_LOCK_NAME;
use crate::safety::pid_file::PID_FILE_NAME;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const ENV_RUNTIME_PATH: &str = "AUDIOD_RUNTIME_PATH";
pub const ENV_STATE_PATH: &str = "AUDIOD_STATE_PATH";
pub const ENV_CONFIG_PATH: &str = "AUDIOD_CONFIG_PATH";
pub const ENV_INTERNAL: &str = "AUDIOD_INTERNAL";
pub const ENV_SYSTEM: &str = "AUDIOD_SYSTEM";

pub const SYSTEM_RUNTIME_DIR: &str = "/var/run/audiod";
pub const SYSTEM_STATE_DIR: &str = "/var/lib/audiod";
pub const SYSTEM_CONFIG_DIR: &str = "/etc/audiod";

/// Filesystem locations one daemon instance works with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimePaths {
    pub runtime_dir: PathBuf,
    pub state_dir: PathBuf,
    pub pid_file: PathBuf,
    pub autospawn_lock: PathBuf,
}

impl RuntimePaths {
    pub fn resolve<F>(system: bool, configured_runtime: Option<&Path>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let runtime = runtime_dir(system, configured_runtime, &lookup);
        let state = state_dir(system, &lookup);
        Self::new(runtime, state)
    }

    pub fn new(runtime_dir: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            pid_file: runtime_dir.join(PID_FILE_NAME),
            autospawn_lock: runtime_dir.join(AUTOSPAWN_LOCK_NAME),
            runtime_dir,
            state_dir,
        }
    }
}

/// Per-instance runtime directory (PID file, autospawn lock, detached log)
pub fn runtime_dir<F>(system: bool, configured: Option<&Path>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if system {
        return PathBuf::from(SYSTEM_RUNTIME_DIR);
    }
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    if let Some(dir) = lookup(ENV_RUNTIME_PATH).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = lookup("XDG_RUNTIME_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("audiod");
    }
    PathBuf::from(format!("/tmp/audiod-{}", nix::unistd::getuid()))
}

pub fn state_dir<F>(system: bool, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if system {
        return PathBuf::from(SYSTEM_STATE_DIR);
    }
    if let Some(dir) = lookup(ENV_STATE_PATH).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = lookup("XDG_STATE_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("audiod");
    }
    match lookup("HOME").filter(|d| !d.is_empty()) {
        Some(home) => PathBuf::from(home).join(".local/state/audiod"),
        None => PathBuf::from(format!("/tmp/audiod-state-{}", nix::unistd::getuid())),
    }
}

/// Create `path` with `mode`, optionally owned by `owner`, and refuse
/// anything that is not a plain directory owned by the expected uid.
pub fn ensure_dir(path: &Path, mode: u32, owner: Option<(u32, u32)>) -> Result<()> {
    if !path.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)?;
    }

    let meta = std::fs::symlink_metadata(path)?;
    if !meta.file_type().is_dir() {
        return Err(DaemonError::Config(format!(
            "{} exists but is not a directory",
            path.display()
        )));
    }

    if let Some((uid, gid)) = owner {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )?;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;

    let expected_uid = owner.map(|(uid, _)| uid).unwrap_or_else(|| nix::unistd::geteuid().as_raw());
    let meta = std::fs::metadata(path)?;
    if meta.uid() != expected_uid {
        return Err(DaemonError::Config(format!(
            "{} is owned by uid {}, expected {}",
            path.display(),
            meta.uid(),
            expected_uid
        )));
    }
    Ok(())
}

/// Only called while the process is still single-threaded
pub fn export_env(key: &str, value: &str) {
    std::env::set_var(key, value);
}

/// Variables helper processes of the system instance rely on
pub fn system_identity_env(identity: &SystemIdentity) -> Vec<(&'static str, String)> {
    let home = identity.home.display().to_string();
    vec![
        ("USER", identity.user.clone()),
        ("USERNAME", identity.user.clone()),
        ("LOGNAME", identity.user.clone()),
        ("HOME", home),
        (ENV_RUNTIME_PATH, SYSTEM_RUNTIME_DIR.to_string()),
        (ENV_STATE_PATH, SYSTEM_STATE_DIR.to_string()),
        (ENV_CONFIG_PATH, SYSTEM_CONFIG_DIR.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_precedence() {
        let env = |key: &str| match key {
            ENV_RUNTIME_PATH => Some("/run/custom".to_string()),
            "XDG_RUNTIME_DIR" => Some("/run/user/1000".to_string()),
            _ => None,
        };
        assert_eq!(runtime_dir(true, None, env), PathBuf::from(SYSTEM_RUNTIME_DIR));
        assert_eq!(
            runtime_dir(false, Some(Path::new("/srv/audiod")), env),
            PathBuf::from("/srv/audiod")
        );
        assert_eq!(runtime_dir(false, None, env), PathBuf::from("/run/custom"));

        let xdg = |key: &str| (key == "XDG_RUNTIME_DIR").then(|| "/run/user/1000".to_string());
        assert_eq!(runtime_dir(false, None, xdg), PathBuf::from("/run/user/1000/audiod"));

        let fallback = runtime_dir(false, None, |_| None);
        assert!(fallback.to_string_lossy().starts_with("/tmp/audiod-"));
    }

    #[test]
    fn lock_files_live_in_runtime_dir() {
        let paths = RuntimePaths::new(PathBuf::from("/run/a"), PathBuf::from("/var/lib/a"));
        assert_eq!(paths.pid_file, PathBuf::from("/run/a/pid"));
        assert_eq!(paths.autospawn_lock, PathBuf::from("/run/a/autospawn.lock"));
    }

    #[test]
    fn state_dir_falls_back_to_home() {
        let home = |key: &str| (key == "HOME").then(|| "/home/alice".to_string());
        assert_eq!(
            state_dir(false, home),
            PathBuf::from("/home/alice/.local/state/audiod")
        );
        assert_eq!(state_dir(true, home), PathBuf::from(SYSTEM_STATE_DIR));
    }

    #[test]
    fn ensure_dir_creates_with_mode() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("runtime");
        ensure_dir(&dir, 0o700, None).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        ensure_dir(&dir, 0o700, None).unwrap();
    }

    #[test]
    fn ensure_dir_rejects_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(ensure_dir(file.path(), 0o700, None).is_err());
    }

    #[test]
    fn system_env_names_identity() {
        let identity = SystemIdentity {
            user: "audiod".to_string(),
            uid: 500,
            gid: 500,
            home: PathBuf::from("/var/lib/audiod"),
        };
        let env = system_identity_env(&identity);
        assert!(env.contains(&("LOGNAME", "audiod".to_string())));
        assert!(env.contains(&("HOME", "/var/lib/audiod".to_string())));
        assert!(env.contains(&(ENV_RUNTIME_PATH, SYSTEM_RUNTIME_DIR.to_string())));
    }
}

/// Core types and structures shared across the audiod bootstrap
use crate::kernel::rlimit::{LimitKind, ResourceLimitSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Which top-level action the process was invoked for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonCommand {
    /// Run the daemon unconditionally (fails if an instance already runs)
    Daemon,
    /// Start the daemon only if no instance is running yet
    Start,
    /// Report whether an instance is running
    Check,
    /// Ask the running instance to terminate
    Kill,
    /// Print the effective configuration
    DumpConf,
    /// Remove stale shared memory segments
    CleanupShm,
}

impl DaemonCommand {
    /// Commands that go on to create a running daemon
    pub fn starts_daemon(self) -> bool {
        matches!(self, Self::Daemon | Self::Start)
    }
}

impl Default for DaemonCommand {
    fn default() -> Self {
        Self::Daemon
    }
}

/// One module to load during bootstrap
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

impl ModuleSpec {
    /// Parse `name` or `name args...` as given on the command line
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err("empty module specification".to_string());
        }
        match spec.split_once(char::is_whitespace) {
            Some((name, args)) => Ok(Self {
                name: name.to_string(),
                args: Some(args.trim().to_string()).filter(|a| !a.is_empty()),
            }),
            None => Ok(Self {
                name: spec.to_string(),
                args: None,
            }),
        }
    }
}

/// Where log records go
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    /// stderr in the foreground, `<runtime_dir>/daemon.log` once detached
    Auto,
    Stderr,
    File(PathBuf),
    Null,
}

impl LogTarget {
    pub fn parse(target: &str) -> std::result::Result<Self, String> {
        match target {
            "auto" => Ok(Self::Auto),
            "stderr" => Ok(Self::Stderr),
            "null" => Ok(Self::Null),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
                _ => Err(format!(
                    "Invalid log target '{}' (expected auto, stderr, null or file:<path>)",
                    other
                )),
            },
        }
    }
}

/// Fully parsed daemon settings. Read-only once the sequencer starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Command selected on the command line (never read from the file)
    #[serde(skip)]
    pub command: DaemonCommand,
    /// Fork into the background after privilege negotiation
    pub daemonize: bool,
    /// Run as the system-wide instance under the dedicated system user
    pub system_instance: bool,
    /// Enforce single-instance semantics through the PID file
    pub use_pid_file: bool,
    /// Treat any module load failure during bootstrap as fatal
    pub fail: bool,
    /// Request high-priority (negative nice) scheduling
    pub high_priority: bool,
    /// Request real-time scheduling
    pub realtime_scheduling: bool,
    pub nice_level: i32,
    pub realtime_priority: u32,
    pub rlimits: ResourceLimitSet,
    pub modules: Vec<ModuleSpec>,
    /// Disable the CPU load watchdog
    pub no_cpu_limit: bool,
    pub log_level: String,
    pub log_target: LogTarget,
    /// Membership in this group justifies scheduling grants
    pub realtime_group: String,
    pub system_user: String,
    pub system_group: String,
    /// Extra or overriding signal bindings: signal name -> action
    pub signal_bindings: BTreeMap<String, String>,
    /// Overrides the per-user runtime directory
    pub runtime_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let mut rlimits = ResourceLimitSet::default();
        // Defaults carried over from the classic daemon.conf
        rlimits.set(LimitKind::Core, Some(u64::MAX));
        rlimits.set(LimitKind::Nofile, Some(256));
        rlimits.set(LimitKind::Nice, Some(31));
        rlimits.set(LimitKind::Rtprio, Some(9));
        rlimits.set(LimitKind::Rttime, Some(1_000_000));

        Self {
            command: DaemonCommand::Daemon,
            daemonize: false,
            system_instance: false,
            use_pid_file: true,
            fail: true,
            high_priority: false,
            realtime_scheduling: false,
            nice_level: -11,
            realtime_priority: 5,
            rlimits,
            modules: Vec::new(),
            no_cpu_limit: false,
            log_level: "info".to_string(),
            log_target: LogTarget::Auto,
            realtime_group: "audiod-rt".to_string(),
            system_user: "audiod".to_string(),
            system_group: "audiod".to_string(),
            signal_bindings: BTreeMap::new(),
            runtime_dir: None,
        }
    }
}

/// How the sequencer reacts to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort startup, unwind, nonzero exit, handshake reports failure
    FatalStartup,
    /// Success-equivalent in start-if-not-running mode, fatal otherwise
    AlreadyRunning,
}

/// Error types for the audiod bootstrap
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity lookup error: {0}")]
    Identity(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Daemonization error: {0}")]
    Daemonize(String),

    #[error("Daemon already running{}", pid_suffix(.pid))]
    AlreadyRunning { pid: Option<u32> },

    #[error("PID file error: {0}")]
    PidFile(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Event loop error: {0}")]
    EventLoop(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Daemon startup without any loaded modules, refusing to work")]
    NoModulesLoaded,
}

fn pid_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" as PID {}", pid),
        None => String::new(),
    }
}

impl DaemonError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyRunning { .. } => ErrorClass::AlreadyRunning,
            _ => ErrorClass::FatalStartup,
        }
    }
}

impl From<nix::Error> for DaemonError {
    fn from(err: nix::Error) -> Self {
        Self::Io(std::io::Error::from(err))
    }
}

/// Result type for audiod operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Conditions that are logged and survived rather than propagated
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartupWarning {
    /// A requested privilege or scheduling grant could not be obtained
    DegradedCapability(String),
    /// A resource limit could not be applied
    ResourceLimit {
        kind: LimitKind,
        value: u64,
        reason: String,
    },
}

impl std::fmt::Display for StartupWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DegradedCapability(msg) => write!(f, "degraded capability: {}", msg),
            Self::ResourceLimit {
                kind,
                value,
                reason,
            } => write!(f, "setrlimit({}, {}) failed: {}", kind.name(), value, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_spec_splits_name_and_args() {
        let spec = ModuleSpec::parse("module-null-sink sink_name=dummy rate=48000").unwrap();
        assert_eq!(spec.name, "module-null-sink");
        assert_eq!(spec.args.as_deref(), Some("sink_name=dummy rate=48000"));

        let bare = ModuleSpec::parse("  module-cli ").unwrap();
        assert_eq!(bare.name, "module-cli");
        assert!(bare.args.is_none());

        assert!(ModuleSpec::parse("   ").is_err());
    }

    #[test]
    fn log_target_parses_known_forms() {
        assert_eq!(LogTarget::parse("auto").unwrap(), LogTarget::Auto);
        assert_eq!(LogTarget::parse("null").unwrap(), LogTarget::Null);
        assert_eq!(
            LogTarget::parse("file:/var/log/audiod.log").unwrap(),
            LogTarget::File(PathBuf::from("/var/log/audiod.log"))
        );
        assert!(LogTarget::parse("file:").is_err());
        assert!(LogTarget::parse("syslog").is_err());
    }

    #[test]
    fn already_running_is_its_own_class() {
        assert_eq!(
            DaemonError::AlreadyRunning { pid: Some(42) }.class(),
            ErrorClass::AlreadyRunning
        );
        assert_eq!(DaemonError::NoModulesLoaded.class(), ErrorClass::FatalStartup);
        assert_eq!(
            DaemonError::AlreadyRunning { pid: Some(42) }.to_string(),
            "Daemon already running as PID 42"
        );
    }

    #[test]
    fn only_daemon_and_start_start_a_daemon() {
        assert!(DaemonCommand::Daemon.starts_daemon());
        assert!(DaemonCommand::Start.starts_daemon());
        assert!(!DaemonCommand::Check.starts_daemon());
        assert!(!DaemonCommand::DumpConf.starts_daemon());
    }
}

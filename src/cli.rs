use crate::config::types::{DaemonCommand, DaemonConfig, LogTarget, ModuleSpec};
use crate::core::privilege::{PrivilegeNegotiator, PrivilegeOps, SystemPrivileges};
use crate::core::types::CredentialState;
use crate::kernel::signal::reset_dispositions;
use crate::observability::logging::{self, LogSink};
use crate::observability::status::InstanceInfo;
use crate::runtime::NoPolicy;
use crate::safety::pid_file::{check_running, kill_running};
use crate::safety::shm::{cleanup_stale_segments, SHM_DIR};
use crate::startup::{self, Collaborators, Startup};
use crate::utils::fd_closure::{close_inherited_fds, passed_fd_from_env};
use crate::utils::paths::RuntimePaths;
use anyhow::Result;
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use std::io::Write;
use std::path::{Path, PathBuf};

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Parser)]
#[command(author, version, about = "Audio daemon bootstrap and lifecycle control", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $AUDIOD_CONFIG_PATH/daemon.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Detach from the terminal once startup has been negotiated
    #[arg(short = 'D', long, global = true)]
    daemonize: bool,
    /// Run as the system-wide instance
    #[arg(long, global = true)]
    system: bool,
    /// auto, stderr, null or file:<path>
    #[arg(long, global = true, value_name = "TARGET")]
    log_target: Option<String>,
    /// env_logger filter, e.g. "debug" or "audiod::startup=trace"
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,
    /// Disable the CPU load watchdog
    #[arg(long, global = true)]
    no_cpu_limit: bool,
    /// Load a module at startup: "name [args]"; repeatable, replaces the configured list
    #[arg(short = 'L', long = "load", global = true, value_name = "MODULE")]
    load: Vec<String>,
    /// Request high-priority scheduling
    #[arg(long, global = true)]
    high_priority: bool,
    /// Request real-time scheduling
    #[arg(long, global = true)]
    realtime: bool,
    /// Enforce a single instance through the PID file
    #[arg(long, global = true, value_name = "BOOL")]
    use_pid_file: Option<bool>,
    /// Abort startup when any module fails to load
    #[arg(long, global = true, value_name = "BOOL")]
    fail: Option<bool>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Subcommand)]
enum Commands {
    /// Run the daemon (fails if one is already running)
    Daemon,
    /// Start the daemon unless one is already running
    Start,
    /// Exit 0 if a daemon is running, 1 otherwise
    Check,
    /// Ask the running daemon to exit
    Kill,
    /// Print the effective configuration
    DumpConf,
    /// Remove shared memory segments left by dead daemons
    CleanupShm,
}

impl From<Commands> for DaemonCommand {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Daemon => Self::Daemon,
            Commands::Start => Self::Start,
            Commands::Check => Self::Check,
            Commands::Kill => Self::Kill,
            Commands::DumpConf => Self::DumpConf,
            Commands::CleanupShm => Self::CleanupShm,
        }
    }
}

impl Cli {
    /// Command line wins over the environment and the file
    fn apply(&self, config: &mut DaemonConfig) -> std::result::Result<(), String> {
        config.command = self.command.map_or(DaemonCommand::Daemon, DaemonCommand::from);
        config.daemonize |= self.daemonize;
        config.system_instance |= self.system;
        config.no_cpu_limit |= self.no_cpu_limit;
        config.high_priority |= self.high_priority;
        config.realtime_scheduling |= self.realtime;
        if let Some(use_pid_file) = self.use_pid_file {
            config.use_pid_file = use_pid_file;
        }
        if let Some(fail) = self.fail {
            config.fail = fail;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(target) = &self.log_target {
            config.log_target = LogTarget::parse(target)?;
        }
        if !self.load.is_empty() {
            config.modules = self
                .load
                .iter()
                .map(|spec| ModuleSpec::parse(spec))
                .collect::<std::result::Result<_, _>>()?;
        }
        Ok(())
    }
}

/// What the binary gathered before handing over to the sequencer
struct Prepared {
    config: DaemonConfig,
    paths: RuntimePaths,
    credentials: CredentialState,
    log_writer: Box<dyn Write + Send>,
}

/// Entry point of the `audiod` binary; returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut privileges = SystemPrivileges;
    let prepared = match prepare(&cli, &mut privileges, || {
        close_inherited_fds(passed_fd_from_env(|key| std::env::var(key).ok()))?;
        reset_dispositions()?;
        Ok(())
    }) {
        Ok(prepared) => prepared,
        Err(code) => return Ok(code),
    };
    let Prepared {
        config,
        paths,
        credentials,
        log_writer,
    } = prepared;

    let instance = InstanceInfo::new();
    let sink = LogSink::new(log_writer);
    logging::init(&config.log_level, sink.clone(), &instance.short_id())?;

    if config.command.starts_daemon() {
        let startup = Startup::new(config, paths, Collaborators::system(Some(sink)))
            .with_instance(instance)
            .with_credentials(credentials);
        return Ok(startup::run(startup).exit_code);
    }

    Ok(match config.command {
        DaemonCommand::DumpConf => match config.dump() {
            Ok(dump) => {
                println!("{}", dump);
                EXIT_SUCCESS
            }
            Err(e) => {
                log::error!("{}", e);
                EXIT_FAILURE
            }
        },
        DaemonCommand::Check => check(&paths),
        DaemonCommand::Kill => kill(&paths),
        DaemonCommand::CleanupShm => cleanup_shm(Path::new(SHM_DIR)),
        DaemonCommand::Daemon | DaemonCommand::Start => EXIT_FAILURE,
    })
}

/// Narrow credentials first, then run `hygiene` and only after that read
/// configuration and open the log target. A SUID binary must not touch a
/// caller-chosen file with root's ids. `Err` carries the exit code.
fn prepare(
    cli: &Cli,
    privileges: &mut dyn PrivilegeOps,
    hygiene: impl FnOnce() -> Result<()>,
) -> std::result::Result<Prepared, i32> {
    let command = cli.command.map_or(DaemonCommand::Daemon, DaemonCommand::from);

    let mut negotiator = PrivilegeNegotiator::new(privileges, &NoPolicy);
    let mut credentials = match negotiator.restrict_identity() {
        Ok(credentials) => credentials,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Err(EXIT_FAILURE);
        }
    };
    // Commands that never become a daemon keep no privileges at all
    if !command.starts_daemon() {
        if let Err(e) = negotiator.release_retained(&mut credentials) {
            eprintln!("Error: {}", e);
            return Err(EXIT_FAILURE);
        }
    }

    if let Err(e) = hygiene() {
        eprintln!("Error: {}", e);
        return Err(EXIT_FAILURE);
    }

    let mut config = match DaemonConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Err(EXIT_FAILURE);
        }
    };
    if let Err(e) = config.apply_env() {
        eprintln!("Error: {}", e);
        return Err(EXIT_FAILURE);
    }
    if let Err(e) = cli.apply(&mut config) {
        eprintln!("Error: {}", e);
        return Err(EXIT_USAGE);
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return Err(EXIT_FAILURE);
    }

    let paths = RuntimePaths::resolve(
        config.system_instance,
        config.runtime_dir.as_deref(),
        |key| std::env::var(key).ok(),
    );
    let log_writer = match logging::open_target(&config.log_target, false, &paths.runtime_dir) {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Err(EXIT_FAILURE);
        }
    };

    Ok(Prepared {
        config,
        paths,
        credentials,
        log_writer,
    })
}

fn check(paths: &RuntimePaths) -> i32 {
    match check_running(&paths.pid_file, Some(env!("CARGO_PKG_NAME"))) {
        Ok(Some(pid)) => {
            log::info!("Daemon running as PID {}", pid);
            EXIT_SUCCESS
        }
        Ok(None) => {
            log::info!("Daemon not running");
            EXIT_FAILURE
        }
        Err(e) => {
            log::error!("{}", e);
            EXIT_FAILURE
        }
    }
}

fn kill(paths: &RuntimePaths) -> i32 {
    match kill_running(&paths.pid_file, Signal::SIGINT, Some(env!("CARGO_PKG_NAME"))) {
        Ok(_) => EXIT_SUCCESS,
        Err(e) => {
            log::error!("Failed to kill daemon: {}", e);
            EXIT_FAILURE
        }
    }
}

fn cleanup_shm(dir: &Path) -> i32 {
    match cleanup_stale_segments(dir) {
        Ok(report) => {
            println!(
                "Removed {} stale segment(s), {} still in use, {} not ours",
                report.removed.len(),
                report.in_use,
                report.foreign
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            log::error!("Failed to clean up shared memory: {}", e);
            EXIT_FAILURE
        }
    }
}

//! System-wide instance. Lives in its own test binary because a successful
//! start exports the system user's environment into the process.

use audiod::config::types::{DaemonConfig, DaemonError, ModuleSpec};
use audiod::core::daemonize::ForkDetacher;
use audiod::core::types::{CapabilityDecision, StartIdentity};
use audiod::kernel::credentials::SystemIdentity;
use audiod::runtime::NoPolicy;
use audiod::startup::{self, Collaborators, HaltReason, Startup, StartupState};
use audiod::testing::{FakePrivileges, LoopStep, RecordingLoader, ScriptedLoop};
use audiod::utils::paths::{RuntimePaths, ENV_SYSTEM, SYSTEM_RUNTIME_DIR};
use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

fn system_config() -> DaemonConfig {
    DaemonConfig {
        system_instance: true,
        modules: vec![ModuleSpec::parse("module-null-sink").unwrap()],
        no_cpu_limit: true,
        ..DaemonConfig::default()
    }
}

fn identity() -> SystemIdentity {
    SystemIdentity {
        user: "audiod".to_string(),
        uid: 492,
        gid: 492,
        home: PathBuf::from("/var/lib/audiod"),
    }
}

fn collaborators(privileges: FakePrivileges, script: Vec<LoopStep>) -> Collaborators {
    let (event_loop, _probe) = ScriptedLoop::new(script);
    Collaborators {
        privileges: Box::new(privileges),
        policy: Box::new(NoPolicy),
        detacher: Box::new(ForkDetacher),
        loader: Rc::new(RefCell::new(RecordingLoader::default())),
        event_loop: event_loop.into_factory(),
        log_sink: None,
        process_name: None,
    }
}

#[test]
fn missing_system_user_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().to_path_buf(), dir.path().join("state"));
    let startup = Startup::new(
        system_config(),
        paths,
        collaborators(FakePrivileges::real_root(), Vec::new()),
    );

    let halt = startup::boot(startup).unwrap_err();
    assert!(matches!(halt.reason(), HaltReason::Failed(DaemonError::Identity(_))));
    assert_eq!(halt.states().last(), Some(&StartupState::LimitsApplied));
    assert_eq!(halt.finish().exit_code, 1);
}

#[test]
fn system_instance_runs_as_system_user() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().to_path_buf(), dir.path().join("state"));
    let privileges = FakePrivileges::real_root().with_system_identity(identity());
    let startup = Startup::new(
        system_config(),
        paths,
        collaborators(privileges, vec![LoopStep::Raise(Signal::SIGTERM)]),
    );

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.states.contains(&StartupState::Running));
    let credentials = outcome.credentials.unwrap();
    assert_eq!(credentials.origin, StartIdentity::RealRoot);
    assert_eq!(outcome.decision, CapabilityDecision::NotHeld);

    assert_eq!(std::env::var(ENV_SYSTEM).unwrap(), "1");
    assert_eq!(std::env::var("USER").unwrap(), "audiod");
    assert_eq!(std::env::var("HOME").unwrap(), "/var/lib/audiod");
    assert_eq!(
        std::env::var("AUDIOD_RUNTIME_PATH").unwrap(),
        SYSTEM_RUNTIME_DIR
    );
}

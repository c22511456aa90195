//! Detached startup: the invoking process must read exactly one status word
//! from the child, whichever step the child stops at.

use audiod::config::types::{DaemonCommand, DaemonConfig, DaemonError, LogTarget, ModuleSpec};
use audiod::observability::logging::LogSink;
use audiod::runtime::NoPolicy;
use audiod::safety::pid_file::PidFile;
use audiod::startup::{
    self, Collaborators, HaltReason, Init, LoopFactory, ModeSelected, Outcome, ResourceKind,
    Startup, StartupState,
};
use audiod::testing::{
    FakePrivileges, HandshakeProbe, InProcessDetacher, LoopProbe, LoopStep, RecordingLoader,
    ScriptedLoop,
};
use audiod::utils::paths::RuntimePaths;
use nix::sys::signal::Signal;
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;

fn config() -> DaemonConfig {
    DaemonConfig {
        daemonize: true,
        modules: vec![ModuleSpec::parse("module-null-sink").unwrap()],
        no_cpu_limit: true,
        log_target: LogTarget::Null,
        ..DaemonConfig::default()
    }
}

struct Child {
    dir: TempDir,
    handshake: HandshakeProbe,
    probe: LoopProbe,
}

fn collaborators(
    detacher: InProcessDetacher,
    loader: RecordingLoader,
    event_loop: LoopFactory,
    log_sink: Option<LogSink>,
) -> Collaborators {
    Collaborators {
        privileges: Box::new(FakePrivileges::unprivileged(1000)),
        policy: Box::new(NoPolicy),
        detacher: Box::new(detacher),
        loader: Rc::new(RefCell::new(loader)),
        event_loop,
        log_sink,
        process_name: None,
    }
}

fn paths(dir: &TempDir) -> RuntimePaths {
    RuntimePaths::new(dir.path().to_path_buf(), dir.path().join("state"))
}

fn child_with(
    config: DaemonConfig,
    loader: RecordingLoader,
    script: Vec<LoopStep>,
) -> (Startup<Init>, Child) {
    let dir = tempfile::tempdir().unwrap();
    let (detacher, handshake) = InProcessDetacher::child();
    let (event_loop, probe) = ScriptedLoop::new(script);
    let startup = Startup::new(
        config,
        paths(&dir),
        collaborators(detacher, loader, event_loop.into_factory(), None),
    );
    (startup, Child { dir, handshake, probe })
}

fn child(script: Vec<LoopStep>) -> (Startup<Init>, Child) {
    child_with(config(), RecordingLoader::default(), script)
}

#[test]
fn successful_start_reports_zero_once() {
    let (startup, child) = child(vec![LoopStep::Raise(Signal::SIGTERM)]);

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.states.contains(&StartupState::Daemonized));
    assert!(!outcome.states.contains(&StartupState::Foreground));
    assert_eq!(child.handshake.words(), vec![0]);
    // Reported at readiness, not again at exit
    assert!(!outcome.released.contains(&ResourceKind::Handshake));
    assert!(child.probe.dropped());
}

#[test]
fn loop_failure_after_ready_keeps_the_single_success_word() {
    let (startup, child) = child(vec![LoopStep::Fail("poll() failed".to_string())]);

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(child.handshake.words(), vec![0]);
}

#[test]
fn zero_modules_reports_failure() {
    let empty = DaemonConfig {
        modules: Vec::new(),
        ..config()
    };
    let (startup, child) = child_with(empty, RecordingLoader::default(), Vec::new());

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(child.handshake.words(), vec![1]);
    assert!(outcome.released.contains(&ResourceKind::Handshake));
}

#[test]
fn module_failure_reports_failure() {
    let (startup, child) = child_with(
        config(),
        RecordingLoader::failing(&["module-null-sink"]),
        Vec::new(),
    );

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(child.handshake.words(), vec![1]);
}

#[test]
fn unbindable_signal_reports_failure() {
    let mut bad = config();
    bad.signal_bindings
        .insert("SIGSEGV".to_string(), "dump-status".to_string());
    let (startup, child) = child_with(bad, RecordingLoader::default(), Vec::new());

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(child.handshake.words(), vec![1]);
    assert_eq!(
        outcome.released,
        vec![
            ResourceKind::EventLoop,
            ResourceKind::SingletonLock,
            ResourceKind::Handshake
        ]
    );
}

#[test]
fn event_loop_failure_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (detacher, handshake) = InProcessDetacher::child();
    let startup = Startup::new(
        config(),
        paths(&dir),
        collaborators(
            detacher,
            RecordingLoader::default(),
            ScriptedLoop::failing_factory("no poll backend"),
            None,
        ),
    );

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(handshake.words(), vec![1]);
}

#[test]
fn unopenable_detached_log_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (detacher, handshake) = InProcessDetacher::child();
    let bad_log = DaemonConfig {
        log_target: LogTarget::File(dir.path().join("missing").join("daemon.log")),
        ..config()
    };
    let sink = LogSink::new(Box::new(std::io::sink()));
    let startup = Startup::new(
        bad_log,
        paths(&dir),
        collaborators(
            detacher,
            RecordingLoader::default(),
            ScriptedLoop::new(Vec::new()).0.into_factory(),
            Some(sink),
        ),
    );

    let halt = startup::boot(startup).unwrap_err();
    assert!(matches!(halt.reason(), HaltReason::Failed(DaemonError::Config(_))));
    assert_eq!(halt.states().last(), Some(&StartupState::LimitsApplied));

    let outcome = halt.finish();
    assert_eq!(outcome.exit_code, 1);
    assert_eq!(handshake.words(), vec![1]);
}

#[test]
fn daemon_already_running_reports_failure() {
    let (startup, child) = child(Vec::new());
    let _held = PidFile::acquire(&child.dir.path().join("pid"), None).unwrap();

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(child.handshake.words(), vec![1]);
}

#[test]
fn start_already_running_answers_without_forking() {
    let start = DaemonConfig {
        command: DaemonCommand::Start,
        ..config()
    };
    let (startup, child) = child_with(start, RecordingLoader::default(), Vec::new());
    let _held = PidFile::acquire(&child.dir.path().join("pid"), None).unwrap();

    let outcome = startup::run(startup);

    assert_eq!(outcome.exit_code, 0);
    // Decided under the autospawn lock, before any child existed
    assert!(child.handshake.words().is_empty());
    assert!(!outcome.states.contains(&StartupState::Daemonized));
    assert_eq!(outcome.states.last(), Some(&StartupState::Terminated));
    assert_eq!(outcome.released, vec![ResourceKind::AutospawnLock]);
    assert!(!child.dir.path().join("autospawn.lock").exists());
    assert!(child.dir.path().join("pid").exists());
    assert!(!child.probe.created());
}

/// Drive a detached child to `stop` completed transitions, then abort.
fn abort_after(stop: usize) -> (Outcome, Vec<i32>) {
    let (startup, child) = child(Vec::new());
    let injected = || DaemonError::EventLoop("injected".to_string());

    let negotiated = startup.negotiate_credentials().unwrap();
    if stop == 1 {
        let outcome = negotiated.abort(injected()).finish();
        return (outcome, child.handshake.words());
    }
    let limits = negotiated.apply_limits().unwrap();
    if stop == 2 {
        let outcome = limits.abort(injected()).finish();
        return (outcome, child.handshake.words());
    }
    let daemonized = match limits.select_mode().unwrap() {
        ModeSelected::Daemonized(daemonized) => daemonized,
        ModeSelected::Foreground(_) => panic!("child continued in the foreground"),
    };
    if stop == 3 {
        let outcome = daemonized.abort(injected()).finish();
        return (outcome, child.handshake.words());
    }
    let singleton = daemonized.acquire_singleton().unwrap();
    if stop == 4 {
        let outcome = singleton.abort(injected()).finish();
        return (outcome, child.handshake.words());
    }
    let event_loop = singleton.create_event_loop().unwrap();
    if stop == 5 {
        let outcome = event_loop.abort(injected()).finish();
        return (outcome, child.handshake.words());
    }
    let signals = event_loop.install_signals().unwrap();
    if stop == 6 {
        let outcome = signals.abort(injected()).finish();
        return (outcome, child.handshake.words());
    }
    let modules = signals.bootstrap_modules().unwrap();
    let outcome = modules.abort(injected()).finish();
    (outcome, child.handshake.words())
}

#[test]
fn abort_at_every_state_writes_exactly_one_word() {
    // Before the fork there is nobody to report to
    for stop in 1..=2 {
        let (outcome, words) = abort_after(stop);
        assert_eq!(outcome.exit_code, 1);
        assert!(words.is_empty(), "stop {}: {:?}", stop, words);
    }
    for stop in 3..=7 {
        let (outcome, words) = abort_after(stop);
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(words, vec![1], "stop {}", stop);
        assert_eq!(outcome.released.last(), Some(&ResourceKind::Handshake));
        assert_eq!(outcome.states.last(), Some(&StartupState::Terminated));
    }
}

#[test]
fn invoking_process_exits_with_child_status() {
    let dir = tempfile::tempdir().unwrap();
    let start = DaemonConfig {
        command: DaemonCommand::Start,
        ..config()
    };
    let (event_loop, probe) = ScriptedLoop::new(Vec::new());
    let startup = Startup::new(
        start,
        paths(&dir),
        collaborators(
            InProcessDetacher::parent(3),
            RecordingLoader::default(),
            event_loop.into_factory(),
            None,
        ),
    );

    let halt = startup::boot(startup).unwrap_err();
    assert!(matches!(halt.reason(), HaltReason::HandedOff(3)));

    let outcome = halt.finish();
    assert_eq!(outcome.exit_code, 3);
    assert!(outcome.handed_off);
    assert_eq!(
        outcome.states,
        vec![
            StartupState::Init,
            StartupState::CredentialsNegotiated,
            StartupState::LimitsApplied,
            StartupState::ShuttingDown,
            StartupState::Terminated,
        ]
    );
    // Held until the child has answered
    assert_eq!(outcome.released, vec![ResourceKind::AutospawnLock]);
    assert!(!dir.path().join("autospawn.lock").exists());
    assert!(!probe.created());
}

#[test]
fn unusable_terminal_is_fatal_before_forking() {
    let dir = tempfile::tempdir().unwrap();
    let (event_loop, _probe) = ScriptedLoop::new(Vec::new());
    let startup = Startup::new(
        config(),
        paths(&dir),
        collaborators(
            InProcessDetacher::failing_stdio(),
            RecordingLoader::default(),
            event_loop.into_factory(),
            None,
        ),
    );

    let halt = startup::boot(startup).unwrap_err();
    assert!(matches!(halt.reason(), HaltReason::Failed(DaemonError::Daemonize(_))));
    assert_eq!(halt.finish().exit_code, 1);
}

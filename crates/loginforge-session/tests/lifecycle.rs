//! Integration tests for the session lifecycle using in-process doubles.
//!
//! The backend, identity store and process layer are all fakes that write
//! into shared logs, so a test can drive a session through authentication
//! and fork without root and without forking the test runner.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::rc::Rc;

use loginforge_auth::{
    AuthBackend, AuthError, AuthEvent, AuthSession, EventSender, EventStream, event_channel,
};
use loginforge_privsep::{
    ChildExit, ChildHandle, ChildStep, ChildSys, Credentials, ExecTarget, ForkOutcome, Gid,
    Identity, IdentityStore, Pid, PrivsepError, ProcessControl, RootRecovery, TerminalAcquirer,
    TerminalError, Uid,
};
use loginforge_session::{ForkSide, Progress, Session, SessionConfig, SessionError, SessionState};
use nix::errno::Errno;

// =========================================================================
// Fake authentication backend
// =========================================================================

#[derive(Default)]
struct BackendLog {
    fail_open: bool,
    refuse_start: bool,
    username: Option<String>,
    opens: Vec<(String, Option<String>)>,
    /// `(adapter index, key, value)` for every putenv an adapter received.
    putenvs: Vec<(usize, String, String)>,
    stops: Vec<ExitStatus>,
    senders: Vec<EventSender>,
}

#[derive(Clone, Default)]
struct FakeBackend {
    log: Rc<RefCell<BackendLog>>,
}

impl FakeBackend {
    fn send(&self, event: AuthEvent) -> bool {
        let log = self.log.borrow();
        log.senders.last().expect("no adapter opened").send(event)
    }

    fn putenvs_of(&self, adapter: usize) -> Vec<(String, String)> {
        self.log
            .borrow()
            .putenvs
            .iter()
            .filter(|(index, ..)| *index == adapter)
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

struct FakeAdapter {
    index: usize,
    log: Rc<RefCell<BackendLog>>,
}

impl AuthSession for FakeAdapter {
    fn putenv(&mut self, key: &str, value: &str) -> Result<(), AuthError> {
        self.log
            .borrow_mut()
            .putenvs
            .push((self.index, key.to_string(), value.to_string()));
        Ok(())
    }

    fn start(&mut self) -> bool {
        !self.log.borrow().refuse_start
    }

    fn stop(&mut self, status: ExitStatus) {
        self.log.borrow_mut().stops.push(status);
    }

    fn username(&self) -> Option<String> {
        self.log.borrow().username.clone()
    }

    fn session_id(&self) -> Option<String> {
        Some(format!("fake-{}", self.index))
    }
}

impl AuthBackend for FakeBackend {
    type Session = FakeAdapter;

    fn open(
        &self,
        service: &str,
        identity: Option<&str>,
    ) -> Result<(FakeAdapter, EventStream), AuthError> {
        let mut log = self.log.borrow_mut();
        if log.fail_open {
            return Err(AuthError::UnknownService(service.to_string()));
        }
        log.opens
            .push((service.to_string(), identity.map(str::to_string)));
        let (sender, stream) = event_channel();
        log.senders.push(sender);
        let adapter = FakeAdapter {
            index: log.opens.len() - 1,
            log: Rc::clone(&self.log),
        };
        Ok((adapter, stream))
    }
}

// =========================================================================
// Fake identity store
// =========================================================================

#[derive(Clone)]
struct FakeIdentities(HashMap<String, Identity>);

impl FakeIdentities {
    fn with_alice() -> Self {
        let alice = Identity {
            name: "alice".into(),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home: PathBuf::from("/home/alice"),
            shell: PathBuf::from("/bin/bash"),
        };
        Self(HashMap::from([("alice".to_string(), alice)]))
    }
}

impl IdentityStore for FakeIdentities {
    fn lookup(&self, name: &str) -> Result<Identity, PrivsepError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| PrivsepError::UnknownUser(name.to_string()))
    }
}

// =========================================================================
// Fake process layer
// =========================================================================

#[derive(Clone, Copy)]
enum Side {
    Parent { pid: i32, raw_status: i32 },
    Child,
}

struct ProcessLog {
    side: Side,
    forks: usize,
    waited: Vec<Pid>,
    exits: Vec<ChildExit>,
    child_calls: Rc<RefCell<Vec<String>>>,
}

#[derive(Clone)]
struct FakeProcess {
    log: Rc<RefCell<ProcessLog>>,
}

impl FakeProcess {
    fn new(side: Side) -> Self {
        Self {
            log: Rc::new(RefCell::new(ProcessLog {
                side,
                forks: 0,
                waited: Vec::new(),
                exits: Vec::new(),
                child_calls: Rc::default(),
            })),
        }
    }

    fn parent(pid: i32, raw_status: i32) -> Self {
        Self::new(Side::Parent { pid, raw_status })
    }

    fn forks(&self) -> usize {
        self.log.borrow().forks
    }
}

struct FakeChild {
    calls: Rc<RefCell<Vec<String>>>,
}

impl Credentials for FakeChild {
    fn init_groups(&mut self, _user: &CStr, _gid: Gid) -> Result<(), Errno> {
        self.calls.borrow_mut().push("initgroups".into());
        Ok(())
    }

    fn set_gid(&mut self, _gid: Gid) -> Result<(), Errno> {
        self.calls.borrow_mut().push("setgid".into());
        Ok(())
    }

    fn set_uid(&mut self, _uid: Uid) -> Result<(), Errno> {
        self.calls.borrow_mut().push("setuid".into());
        Ok(())
    }

    fn regain_root(&mut self, _uid: Uid) -> RootRecovery {
        RootRecovery::Unrecoverable
    }
}

impl ChildSys for FakeChild {
    fn acquire_terminal(&mut self, _acquirer: &TerminalAcquirer) -> Result<(), TerminalError> {
        self.calls.borrow_mut().push("terminal".into());
        Ok(())
    }

    fn new_session(&mut self) -> Result<(), Errno> {
        self.calls.borrow_mut().push("setsid".into());
        Ok(())
    }

    fn change_dir(&mut self, _dir: &Path) -> Result<(), Errno> {
        self.calls.borrow_mut().push("chdir".into());
        Ok(())
    }

    fn exec(&mut self, _program: &CString, _argv: &[CString], _envp: &[CString]) -> Errno {
        self.calls.borrow_mut().push("exec".into());
        Errno::ENOENT
    }
}

impl ProcessControl for FakeProcess {
    type Child = FakeChild;

    fn fork(&mut self) -> Result<ForkOutcome, PrivsepError> {
        let mut log = self.log.borrow_mut();
        log.forks += 1;
        Ok(match log.side {
            Side::Parent { pid, .. } => {
                ForkOutcome::ParentWaiting(ChildHandle::new(Pid::from_raw(pid)))
            }
            Side::Child => ForkOutcome::ChildTransitioning,
        })
    }

    fn wait(&mut self, child: ChildHandle) -> Result<ExitStatus, PrivsepError> {
        let mut log = self.log.borrow_mut();
        log.waited.push(child.pid());
        match log.side {
            Side::Parent { raw_status, .. } => Ok(ExitStatus::from_raw(raw_status)),
            Side::Child => panic!("child side never waits"),
        }
    }

    fn child_sys(&mut self) -> FakeChild {
        FakeChild {
            calls: Rc::clone(&self.log.borrow().child_calls),
        }
    }

    fn exit_child(&mut self, exit: &ChildExit) {
        self.log.borrow_mut().exits.push(exit.clone());
    }
}

// =========================================================================
// Helpers
// =========================================================================

type TestSession = Session<FakeBackend, FakeIdentities, FakeProcess>;

fn session_with(backend: &FakeBackend, process: &FakeProcess) -> TestSession {
    let config = SessionConfig {
        target: ExecTarget {
            program: "/usr/bin/session-program".into(),
            args: vec![],
        },
        ..SessionConfig::default()
    };
    Session::new(
        "login",
        config,
        backend.clone(),
        FakeIdentities::with_alice(),
        process.clone(),
    )
}

fn created(id: &str) -> AuthEvent {
    AuthEvent::SessionCreated {
        session_id: id.to_string(),
    }
}

// =========================================================================
// Environment staging
// =========================================================================

#[tokio::test]
async fn test_putenv_before_start_last_write_wins_and_flushes_once() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(10, 0));

    session.putenv("XDG_SEAT", "seat0").unwrap();
    session.putenv("XDG_VTNR", "1").unwrap();
    session.putenv("XDG_SEAT", "seat1").unwrap();
    assert_eq!(session.pending_environment().len(), 2);

    session.start(Some("alice")).unwrap();

    assert!(session.pending_environment().is_empty());
    assert_eq!(
        backend.putenvs_of(0),
        vec![
            ("XDG_SEAT".to_string(), "seat1".to_string()),
            ("XDG_VTNR".to_string(), "1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_putenv_after_start_goes_straight_to_adapter() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(10, 0));
    session.putenv("XDG_SEAT", "seat0").unwrap();
    session.start(Some("alice")).unwrap();

    session.putenv("XDG_SESSION_TYPE", "tty").unwrap();

    assert!(session.pending_environment().is_empty());
    assert_eq!(
        backend.putenvs_of(0),
        vec![
            ("XDG_SEAT".to_string(), "seat0".to_string()),
            ("XDG_SESSION_TYPE".to_string(), "tty".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_putenv_invalid_names_rejected() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(10, 0));

    for key in ["", "A=B", "NUL\0"] {
        assert!(
            matches!(session.putenv(key, "v"), Err(SessionError::InvalidVariable(_))),
            "{key:?} should be rejected"
        );
    }
    assert!(session.pending_environment().is_empty());
}

// =========================================================================
// Successful login
// =========================================================================

#[tokio::test]
async fn test_session_created_parent_reports_exact_child_status() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(4242, 3 << 8);
    let mut session = session_with(&backend, &process);

    session.start(Some("alice")).unwrap();
    assert_eq!(session.state(), SessionState::Authenticating);
    assert!(backend.send(created("S1")));

    let progress = session.run().await.unwrap();

    let expected = ExitStatus::from_raw(3 << 8);
    assert_eq!(
        progress,
        Progress::Finished {
            child: ChildHandle::new(Pid::from_raw(4242)),
            status: expected,
        }
    );
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(process.forks(), 1);
    assert_eq!(process.log.borrow().waited, vec![Pid::from_raw(4242)]);

    let log = backend.log.borrow();
    assert_eq!(log.opens, vec![("login".to_string(), Some("alice".to_string()))]);
    assert_eq!(log.stops, vec![expected]);
}

#[tokio::test]
async fn test_session_created_signaled_child_status_passed_through() {
    let backend = FakeBackend::default();
    // SIGKILL, no core dump.
    let mut session = session_with(&backend, &FakeProcess::parent(7, 9));
    session.start(Some("alice")).unwrap();
    backend.send(created("S1"));

    session.run().await.unwrap();

    let stops = &backend.log.borrow().stops;
    assert_eq!(stops[0].signal(), Some(9));
    assert_eq!(stops[0].into_raw(), 9);
}

#[tokio::test]
async fn test_session_created_without_identity_uses_adapter_username() {
    let backend = FakeBackend::default();
    backend.log.borrow_mut().username = Some("alice".into());
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);

    session.start(None).unwrap();
    assert_eq!(backend.log.borrow().opens[0].1, None);
    backend.send(created("S1"));

    let progress = session.run().await.unwrap();

    assert!(matches!(progress, Progress::Finished { .. }));
    assert_eq!(session.identity(), Some("alice"));
}

#[tokio::test]
async fn test_session_created_without_any_identity_returns_unknown_identity() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);
    session.start(None).unwrap();
    backend.send(created("S1"));

    let result = session.run().await;

    assert!(matches!(result, Err(SessionError::UnknownIdentity)));
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(process.forks(), 0);
}

#[tokio::test]
async fn test_session_created_unknown_user_terminates_without_fork() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);
    session.start(Some("mallory")).unwrap();
    backend.send(created("S1"));

    let result = session.run().await;

    assert!(matches!(
        result,
        Err(SessionError::Privsep(PrivsepError::UnknownUser(ref name))) if name == "mallory"
    ));
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(process.forks(), 0);
    assert!(backend.log.borrow().stops.is_empty());
}

#[tokio::test]
async fn test_session_created_child_side_runs_pipeline_and_exits() {
    let backend = FakeBackend::default();
    let process = FakeProcess::new(Side::Child);
    let mut session = session_with(&backend, &process);
    session.start(Some("alice")).unwrap();
    backend.send(created("S1"));

    let progress = session.run().await.unwrap();

    let Progress::ChildExited(exit) = progress else {
        panic!("expected child exit, got {progress:?}");
    };
    assert_eq!(exit.step, ChildStep::Exec);
    assert_eq!(exit.code, 127);
    assert_eq!(session.state(), SessionState::Forked(ForkSide::Child));

    let log = process.log.borrow();
    assert_eq!(log.exits, vec![exit]);
    assert_eq!(
        *log.child_calls.borrow(),
        vec!["terminal", "setsid", "initgroups", "setgid", "setuid", "chdir", "exec"]
    );
    assert!(backend.log.borrow().stops.is_empty());
}

#[tokio::test]
async fn test_handle_event_session_created_while_idle_is_invalid_state() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);

    let result = session.handle_event(created("S1"));

    assert!(matches!(
        result,
        Err(SessionError::InvalidState { state: SessionState::Idle, .. })
    ));
    assert_eq!(process.forks(), 0);
}

// =========================================================================
// Failures before the fork
// =========================================================================

#[tokio::test]
async fn test_start_adapter_creation_fails_stays_idle_without_fork() {
    let backend = FakeBackend::default();
    backend.log.borrow_mut().fail_open = true;
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);

    let result = session.start(Some("alice"));

    assert!(matches!(
        result,
        Err(SessionError::AdapterCreationFailed { ref service, .. }) if service == "login"
    ));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(process.forks(), 0);
    assert_eq!(session.next_event().await, None);
}

#[tokio::test]
async fn test_start_refused_by_adapter_returns_start_rejected() {
    let backend = FakeBackend::default();
    backend.log.borrow_mut().refuse_start = true;
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));

    let result = session.start(Some("alice"));

    assert!(matches!(result, Err(SessionError::StartRejected(_))));
    assert_eq!(session.state(), SessionState::Idle);
    // The refused adapter was released, so its sender sees a closed channel.
    assert!(!backend.send(created("S1")));
}

#[tokio::test]
async fn test_auth_error_then_start_again_succeeds() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);
    session.putenv("XDG_SEAT", "seat0").unwrap();
    session.start(Some("alice")).unwrap();
    session.putenv("XDG_VTNR", "2").unwrap();

    backend.send(AuthEvent::AuthError(AuthError::Rejected("bad password".into())));
    let progress = session.run().await.unwrap();

    assert_eq!(
        progress,
        Progress::AuthFailed(AuthError::Rejected("bad password".into()))
    );
    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(process.forks(), 0);

    session.start(Some("alice")).unwrap();

    assert_eq!(backend.log.borrow().opens.len(), 2);
    assert_eq!(
        backend.putenvs_of(1),
        vec![
            ("XDG_SEAT".to_string(), "seat0".to_string()),
            ("XDG_VTNR".to_string(), "2".to_string()),
        ]
    );

    backend.send(created("S2"));
    assert!(matches!(session.run().await.unwrap(), Progress::Finished { .. }));
    assert_eq!(process.forks(), 1);
}

#[tokio::test]
async fn test_start_retry_with_none_clears_previous_identity() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);
    session.start(Some("alice")).unwrap();
    backend.send(AuthEvent::AuthError(AuthError::Rejected("unknown user".into())));
    session.run().await.unwrap();

    session.start(None).unwrap();

    assert_eq!(session.identity(), None);
    assert_eq!(
        backend.log.borrow().opens,
        vec![
            ("login".to_string(), Some("alice".to_string())),
            ("login".to_string(), None),
        ]
    );

    // The user now comes from the backend instead of the first attempt.
    backend.log.borrow_mut().username = Some("alice".into());
    backend.send(created("S2"));
    assert!(matches!(session.run().await.unwrap(), Progress::Finished { .. }));
    assert_eq!(session.identity(), Some("alice"));
}

#[tokio::test]
async fn test_start_while_authenticating_without_failure_is_invalid_state() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));
    session.start(Some("alice")).unwrap();

    let result = session.start(Some("alice"));

    assert!(matches!(
        result,
        Err(SessionError::InvalidState { operation: "start", state: SessionState::Authenticating })
    ));
    assert_eq!(backend.log.borrow().opens.len(), 1);
}

#[tokio::test]
async fn test_start_after_termination_is_invalid_state() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));
    session.start(Some("alice")).unwrap();
    backend.send(created("S1"));
    session.run().await.unwrap();

    let result = session.start(Some("alice"));

    assert!(matches!(
        result,
        Err(SessionError::InvalidState { state: SessionState::Terminated, .. })
    ));
}

#[tokio::test]
async fn test_session_error_is_logged_without_state_change() {
    let backend = FakeBackend::default();
    let process = FakeProcess::parent(5, 0);
    let mut session = session_with(&backend, &process);
    session.start(Some("alice")).unwrap();
    backend.send(AuthEvent::SessionError(None));

    let progress = session.run().await.unwrap();

    assert_eq!(progress, Progress::SessionFailed(None));
    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(process.forks(), 0);
}

// =========================================================================
// Stop, events and disposal
// =========================================================================

#[tokio::test]
async fn test_stop_on_never_started_session_succeeds() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));

    assert!(session.stop());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_run_without_adapter_returns_closed() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));

    assert_eq!(session.run().await.unwrap(), Progress::Closed);
}

#[tokio::test]
async fn test_run_after_adapter_drops_sender_returns_closed() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));
    session.start(Some("alice")).unwrap();
    backend.log.borrow_mut().senders.clear();

    assert_eq!(session.run().await.unwrap(), Progress::Closed);
}

#[tokio::test]
async fn test_events_are_delivered_in_send_order() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));
    session.start(Some("alice")).unwrap();

    backend.send(AuthEvent::SessionError(None));
    backend.send(created("S1"));

    assert_eq!(session.next_event().await, Some(AuthEvent::SessionError(None)));
    assert_eq!(session.next_event().await, Some(created("S1")));
}

#[tokio::test]
async fn test_session_id_comes_from_adapter() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));
    assert_eq!(session.session_id(), None);

    session.start(Some("alice")).unwrap();

    assert_eq!(session.session_id(), Some("fake-0".to_string()));
}

#[tokio::test]
async fn test_drop_session_detaches_adapter_events() {
    let backend = FakeBackend::default();
    let mut session = session_with(&backend, &FakeProcess::parent(5, 0));
    session.start(Some("alice")).unwrap();
    assert!(backend.send(AuthEvent::SessionError(None)));

    drop(session);

    assert!(!backend.send(created("S1")));
}

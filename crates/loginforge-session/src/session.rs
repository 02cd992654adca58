//! The session lifecycle controller.
//!
//! One [`Session`] is one login attempt. It owns its authentication
//! adapter and that adapter's event stream, and on success it becomes
//! either the waiting parent or the child that turns into the user's
//! session.

use std::collections::BTreeMap;
use std::fmt;
use std::process::ExitStatus;

use loginforge_auth::{AuthBackend, AuthError, AuthEvent, AuthSession, EventStream};
use loginforge_privsep::{
    ChildExit, ChildHandle, ChildPipeline, ForkOutcome, Identity, IdentityStore,
    ProcessControl, SystemIdentityStore, SystemProcess, TerminalAcquirer,
};

use crate::{SessionConfig, SessionError};

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Which side of the fork a session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    Parent,
    Child,
}

/// The lifecycle state of a session.
///
/// ```text
/// Idle ──start──→ Authenticating ──session-created──→ Forked(Parent) ──wait──→ Terminated
///  ↑                   │                      └─────→ Forked(Child)  ──exec
///  └──start failed─────┘ (auth-error: start may be called again)
/// ```
///
/// `Idle` and `Terminated` are rest states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Authenticating,
    Forked(ForkSide),
    Terminated,
}

impl SessionState {
    /// Returns `true` for the states a session can sit in indefinitely.
    pub fn is_rest(&self) -> bool {
        matches!(self, Self::Idle | Self::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Forked(ForkSide::Parent) => write!(f, "Forked(Parent)"),
            Self::Forked(ForkSide::Child) => write!(f, "Forked(Child)"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// What handling one adapter event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Authentication failed. The session stays put and may be started
    /// again.
    AuthFailed(AuthError),

    /// The backend failed to establish its session.
    SessionFailed(Option<AuthError>),

    /// Parent side: the user's session ran and exited with `status`.
    Finished {
        child: ChildHandle,
        status: ExitStatus,
    },

    /// Child side: the pipeline ended without becoming the target
    /// program. Only observable with an in-process [`ProcessControl`].
    ChildExited(ChildExit),

    /// The adapter closed its event stream, or there is no adapter.
    Closed,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An open adapter together with the only stream its events arrive on.
///
/// The two always live and die together: dropping this drops the stream,
/// which closes the channel the adapter sends on.
struct Attached<S> {
    handle: S,
    events: EventStream,
}

/// One login attempt and, on success, the process that runs it.
///
/// A session is created `Idle` for a fixed authentication service. It
/// owns at most one adapter at a time and never shares it.
///
/// ## Lifecycle
///
/// ```text
/// putenv()* ──→ start() ──→ run() ──→ [Finished]     (parent)
///                  ↑          │  └──→ exec / _exit   (child)
///                  └─auth-error
/// ```
///
/// The three type parameters are the seams to the outside world: the
/// authentication backend, the user database and the process layer.
/// [`Session::system`] fills in the real ones for the last two.
pub struct Session<B: AuthBackend, I = SystemIdentityStore, P = SystemProcess> {
    /// Authentication service name, for example `"login"`. Fixed at
    /// construction.
    service_name: String,

    /// Target user. Set by every `start` call, or learned from the
    /// adapter's `username()` on `session-created`.
    identity: Option<String>,

    /// Staged before any adapter exists.
    pending_environment: BTreeMap<String, String>,

    /// Everything already handed to an adapter. Replayed on retry.
    applied_environment: BTreeMap<String, String>,

    /// The current adapter, if `start` has opened one.
    auth: Option<Attached<B::Session>>,

    state: SessionState,

    /// Set by an `auth-error` while `Authenticating`. Lets `start` open a
    /// fresh adapter without going through `Idle` first.
    retry_allowed: bool,

    /// What the child runs and its hardening policy.
    config: SessionConfig,

    /// Opens one adapter per `start`.
    backend: B,

    /// Resolves the user name to uid, gid, home and shell before forking.
    identities: I,

    /// Forks, waits and ends the child.
    process: P,
}

impl<B: AuthBackend> Session<B> {
    /// A session backed by the system user database and real `fork`.
    pub fn system(
        service: impl Into<String>,
        config: SessionConfig,
        backend: B,
    ) -> Self {
        Self::new(service, config, backend, SystemIdentityStore, SystemProcess)
    }
}

impl<B, I, P> Session<B, I, P>
where
    B: AuthBackend,
    I: IdentityStore,
    P: ProcessControl,
{
    /// Creates an `Idle` session for `service`.
    ///
    /// Nothing is opened yet; the backend is first used by
    /// [`start`](Self::start).
    pub fn new(
        service: impl Into<String>,
        config: SessionConfig,
        backend: B,
        identities: I,
        process: P,
    ) -> Self {
        let service_name = service.into();
        tracing::debug!(service = %service_name, "session created");
        Self {
            service_name,
            identity: None,
            pending_environment: BTreeMap::new(),
            applied_environment: BTreeMap::new(),
            auth: None,
            state: SessionState::Idle,
            retry_allowed: false,
            config,
            backend,
            identities,
            process,
        }
    }

    /// The authentication service this session was created for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The target user, once given to [`start`](Self::start) or learned
    /// from the adapter.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Current lifecycle state.
    ///
    /// On the child side of a real fork this is never observed after
    /// `Forked(Child)`: the process either becomes the session program or
    /// exits.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Variables staged while no adapter exists.
    pub fn pending_environment(&self) -> &BTreeMap<String, String> {
        &self.pending_environment
    }

    /// The configuration the child pipeline will be built from.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The backend's session identifier, if the adapter has one.
    pub fn session_id(&self) -> Option<String> {
        self.auth.as_ref().and_then(|a| a.handle.session_id())
    }

    /// Sets a variable in the authentication session's environment.
    ///
    /// Before [`start`](Self::start) the variable is staged (last write
    /// wins) and flushed into the adapter when it is created. Afterwards
    /// it goes straight to the adapter.
    ///
    /// These variables are never part of the child's exec environment.
    ///
    /// # Errors
    /// - [`SessionError::InvalidVariable`]: empty key, `=` or NUL in it
    /// - [`SessionError::Adapter`]: the adapter rejected the variable
    pub fn putenv(&mut self, key: &str, value: &str) -> Result<(), SessionError> {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(SessionError::InvalidVariable(key.to_string()));
        }

        match &mut self.auth {
            Some(auth) => {
                auth.handle
                    .putenv(key, value)
                    .map_err(SessionError::Adapter)?;
                self.applied_environment
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                self.pending_environment
                    .insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Opens an adapter and begins authentication.
    ///
    /// `identity` pre-binds the attempt to a user; `None` lets the
    /// backend discover it. Each call replaces the previous identity,
    /// including with `None`.
    ///
    /// Valid from `Idle` and, after an `auth-error`, from
    /// `Authenticating`. The retry gets a fresh adapter that first
    /// receives every variable the previous one was given.
    ///
    /// # Errors
    /// - [`SessionError::InvalidState`]: any other state
    /// - [`SessionError::AdapterCreationFailed`]: the backend could not
    ///   open an adapter (state stays `Idle`)
    /// - [`SessionError::Adapter`]: flushing the environment failed
    /// - [`SessionError::StartRejected`]: the adapter refused to begin
    pub fn start(&mut self, identity: Option<&str>) -> Result<(), SessionError> {
        let retry = self.state == SessionState::Authenticating && self.retry_allowed;
        if self.state != SessionState::Idle && !retry {
            return Err(SessionError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.identity = identity.map(str::to_string);

        if retry {
            tracing::info!(service = %self.service_name, "restarting authentication");
            self.auth = None;
            self.state = SessionState::Idle;
            self.retry_allowed = false;
        }

        let (mut handle, events) = self
            .backend
            .open(&self.service_name, self.identity.as_deref())
            .map_err(|source| SessionError::AdapterCreationFailed {
                service: self.service_name.clone(),
                source,
            })?;

        let pending = std::mem::take(&mut self.pending_environment);
        self.applied_environment.extend(pending);
        for (key, value) in &self.applied_environment {
            handle.putenv(key, value).map_err(SessionError::Adapter)?;
        }

        if !handle.start() {
            tracing::warn!(service = %self.service_name, "authentication adapter refused to start");
            return Err(SessionError::StartRejected(self.service_name.clone()));
        }

        self.auth = Some(Attached { handle, events });
        self.state = SessionState::Authenticating;
        tracing::info!(
            service = %self.service_name,
            user = self.identity.as_deref().unwrap_or("<unknown>"),
            "authentication started"
        );
        Ok(())
    }

    /// Waits for the adapter's next event.
    ///
    /// Returns `None` when there is no adapter or it closed its stream.
    pub async fn next_event(&mut self) -> Option<AuthEvent> {
        match &mut self.auth {
            Some(auth) => auth.events.recv().await,
            None => None,
        }
    }

    /// Applies one adapter event.
    ///
    /// `session-created` forks. On the parent side this call blocks in
    /// `waitpid` until the user's session exits. On the child side it
    /// does not return with the real [`SystemProcess`].
    ///
    /// # Errors
    /// - [`SessionError::InvalidState`]: `session-created` outside
    ///   `Authenticating`
    /// - [`SessionError::UnknownIdentity`]: no user name known
    /// - [`SessionError::Privsep`]: lookup, fork or wait failed; the
    ///   session is `Terminated`
    pub fn handle_event(&mut self, event: AuthEvent) -> Result<Progress, SessionError> {
        match event {
            AuthEvent::AuthError(error) => {
                tracing::warn!(service = %self.service_name, %error, "authentication failed");
                if self.state == SessionState::Authenticating {
                    self.retry_allowed = true;
                }
                Ok(Progress::AuthFailed(error))
            }
            AuthEvent::SessionError(error) => {
                match &error {
                    Some(error) => {
                        tracing::warn!(service = %self.service_name, %error, "session error")
                    }
                    None => {
                        tracing::warn!(service = %self.service_name, "session error without details")
                    }
                }
                Ok(Progress::SessionFailed(error))
            }
            AuthEvent::SessionCreated { session_id } => self.establish(&session_id),
        }
    }

    /// Waits for the next event and applies it.
    pub async fn run(&mut self) -> Result<Progress, SessionError> {
        match self.next_event().await {
            Some(event) => self.handle_event(event),
            None => Ok(Progress::Closed),
        }
    }

    /// Acknowledges a stop request. Always succeeds; a running user
    /// session is not signalled.
    pub fn stop(&mut self) -> bool {
        tracing::debug!(service = %self.service_name, state = %self.state, "stop requested");
        true
    }

    fn establish(&mut self, session_id: &str) -> Result<Progress, SessionError> {
        if self.state != SessionState::Authenticating {
            return Err(SessionError::InvalidState {
                operation: "establish",
                state: self.state,
            });
        }
        tracing::debug!(service = %self.service_name, %session_id, "authentication session created");

        let identity = match self.resolve_identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(service = %self.service_name, error = %e, "cannot resolve session user");
                self.state = SessionState::Terminated;
                return Err(e);
            }
        };

        let outcome = self.process.fork().inspect_err(|e| {
            tracing::warn!(service = %self.service_name, error = %e, "fork failed");
            self.state = SessionState::Terminated;
        })?;

        match outcome {
            ForkOutcome::ParentWaiting(child) => {
                self.state = SessionState::Forked(ForkSide::Parent);
                tracing::debug!(user = %identity.name, pid = %child, "session child forked");

                let status = self.process.wait(child).inspect_err(|e| {
                    tracing::warn!(pid = %child, error = %e, "wait failed");
                    self.state = SessionState::Terminated;
                })?;
                tracing::debug!(pid = %child, ?status, "session child exited");

                if let Some(auth) = &mut self.auth {
                    auth.handle.stop(status);
                }
                self.state = SessionState::Terminated;
                tracing::info!(user = %identity.name, ?status, "session finished");
                Ok(Progress::Finished { child, status })
            }
            ForkOutcome::ChildTransitioning => {
                self.state = SessionState::Forked(ForkSide::Child);
                let pipeline = ChildPipeline {
                    identity,
                    search_path: self.config.search_path.clone(),
                    target: self.config.target.clone(),
                    terminal: TerminalAcquirer::new(self.config.device_dir.clone()),
                    policy: self.config.policy,
                };
                let mut sys = self.process.child_sys();
                let exit = pipeline.run(&mut sys);
                self.process.exit_child(&exit);
                Ok(Progress::ChildExited(exit))
            }
        }
    }

    fn resolve_identity(&mut self) -> Result<Identity, SessionError> {
        if self.identity.is_none() {
            self.identity = self.auth.as_ref().and_then(|a| a.handle.username());
        }
        let name = self.identity.as_deref().ok_or(SessionError::UnknownIdentity)?;
        Ok(self.identities.lookup(name)?)
    }
}

impl<B: AuthBackend, I, P> Drop for Session<B, I, P> {
    fn drop(&mut self) {
        tracing::debug!(service = %self.service_name, state = %self.state, "disposing session");
        self.auth = None;
    }
}

impl<B: AuthBackend, I, P> fmt::Debug for Session<B, I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("service_name", &self.service_name)
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("pending_environment", &self.pending_environment)
            .field("attached", &self.auth.is_some())
            .finish()
    }
}

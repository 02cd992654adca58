//! The session manager: a registry of login attempts.
//!
//! A login manager typically serves several seats or greeters at once,
//! each with its own in-flight [`Session`]. The manager hands out
//! [`SessionId`]s, keeps the sessions alive, and releases them (and with
//! them their authentication adapters) on request.
//!
//! Like the sessions it holds, `SessionManager` is not thread-safe. It is
//! owned by the single task that drives the login manager's event loop.

use std::collections::HashMap;
use std::fmt;

use loginforge_auth::AuthBackend;
use loginforge_privsep::{IdentityStore, ProcessControl, SystemIdentityStore, SystemProcess};

use crate::{Session, SessionConfig, SessionError, SessionState};

/// Opaque handle to a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Creates, tracks and releases [`Session`]s sharing one backend.
///
/// ```text
/// create() ──→ get_mut().start() ──→ ... ──→ [Terminated] ──→ release_terminated()
///                                                 │
///               release(id) at any point ─────────┘
/// ```
pub struct SessionManager<B: AuthBackend, I = SystemIdentityStore, P = SystemProcess> {
    /// All registered sessions, whatever their state.
    sessions: HashMap<SessionId, Session<B, I, P>>,

    /// The id handed out by the next `create`. Ids are never reused, so a
    /// stale id can only miss, never hit a newer session.
    next_id: u64,

    /// Copied into every new session.
    config: SessionConfig,

    /// Cloned into every new session. Backends that share state (a PAM
    /// handle pool, a test log) do so through `Rc`/`Arc` inside.
    backend: B,
    identities: I,
    process: P,
}

impl<B: AuthBackend + Clone> SessionManager<B> {
    /// A manager whose sessions use the system user database and real
    /// `fork`.
    pub fn system(config: SessionConfig, backend: B) -> Self {
        Self::new(config, backend, SystemIdentityStore, SystemProcess)
    }
}

impl<B, I, P> SessionManager<B, I, P>
where
    B: AuthBackend + Clone,
    I: IdentityStore + Clone,
    P: ProcessControl + Clone,
{
    /// Every session created by this manager gets a copy of `config` and
    /// a clone of each collaborator.
    pub fn new(config: SessionConfig, backend: B, identities: I, process: P) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            config,
            backend,
            identities,
            process,
        }
    }

    /// Registers a new idle session for `service` and returns its id.
    ///
    /// The session is not started; call `start` on it through
    /// [`get_mut`](Self::get_mut).
    pub fn create(&mut self, service: &str) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let session = Session::new(
            service,
            self.config.clone(),
            self.backend.clone(),
            self.identities.clone(),
            self.process.clone(),
        );
        self.sessions.insert(id, session);

        tracing::info!(%id, %service, "session registered");
        id
    }

    /// Looks up a session by id. `None` if it was never created or has
    /// been released.
    pub fn get(&self, id: SessionId) -> Option<&Session<B, I, P>> {
        self.sessions.get(&id)
    }

    /// Like [`get`](Self::get), for driving the session: `putenv`,
    /// `start`, `run`.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<B, I, P>> {
        self.sessions.get_mut(&id)
    }

    /// Drops a session, releasing its adapter.
    ///
    /// # Errors
    /// Returns [`SessionError::NotFound`] if `id` is not registered.
    pub fn release(&mut self, id: SessionId) -> Result<(), SessionError> {
        match self.sessions.remove(&id) {
            Some(_) => {
                tracing::info!(%id, "session released");
                Ok(())
            }
            None => Err(SessionError::NotFound(id)),
        }
    }

    /// Drops every session in `Terminated`. Returns how many were removed.
    pub fn release_terminated(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.state() != SessionState::Terminated);
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "released terminated sessions");
        }
        removed
    }

    /// Number of registered sessions, terminated ones included until
    /// [`release_terminated`](Self::release_terminated) runs.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// `true` when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

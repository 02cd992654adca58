//! Authentication adapter contract for Loginforge.
//!
//! Loginforge does not verify credentials itself. A backend (PAM, a test
//! double, a development "trust" backend) implements the two traits here:
//!
//! - [`AuthBackend`] opens one [`AuthSession`] per login attempt, keyed by
//!   service name and (optionally) identity.
//! - [`AuthSession`] accepts environment variables, starts the attempt,
//!   and is told the final exit status of the user's session.
//!
//! Asynchronous results are not return values. They arrive as
//! [`AuthEvent`]s on the [`EventStream`] handed out by
//! [`AuthBackend::open`].
//!
//! ```text
//! Session Layer (above)   ← owns the AuthSession + EventStream
//!     ↕
//! Auth Layer (this crate) ← start / putenv / stop, events
//!     ↕
//! Backend (below)         ← PAM conversation, credential checks
//! ```

use std::process::ExitStatus;
use std::rc::Rc;
use std::sync::Arc;

mod error;
mod event;

pub use error::AuthError;
pub use event::{AuthEvent, EventSender, EventStream, event_channel};

/// Opens authentication sessions.
pub trait AuthBackend {
    /// The per-attempt handle produced by this backend.
    type Session: AuthSession;

    /// Creates a handle for `service`, optionally pre-bound to `identity`.
    ///
    /// The returned [`EventStream`] is the only place this handle reports
    /// asynchronous progress. Dropping it detaches the handle's callbacks.
    ///
    /// # Errors
    /// Fails when the backend cannot serve the request at all, for
    /// example [`AuthError::UnknownService`].
    fn open(
        &self,
        service: &str,
        identity: Option<&str>,
    ) -> Result<(Self::Session, EventStream), AuthError>;
}

/// One authentication attempt.
///
/// Implementations must stop delivering events once the owner drops the
/// paired [`EventStream`]; [`EventSender::send`] reports that case.
pub trait AuthSession {
    /// Adds a variable to the backend's session environment.
    ///
    /// Valid both before and after [`start`](Self::start).
    fn putenv(&mut self, key: &str, value: &str) -> Result<(), AuthError>;

    /// Begins authentication.
    ///
    /// Returns `false` if the backend refuses to even begin. Everything
    /// after that is reported through events.
    fn start(&mut self) -> bool;

    /// Reports the exact wait status of the user's session process.
    ///
    /// Called at most once, after `session-created`. Ends the handle's
    /// involvement.
    fn stop(&mut self, status: ExitStatus);

    /// The authenticated user name, once the backend has resolved it.
    fn username(&self) -> Option<String>;

    /// The backend session identifier, once one exists.
    fn session_id(&self) -> Option<String> {
        None
    }
}

impl<T: AuthBackend + ?Sized> AuthBackend for Rc<T> {
    type Session = T::Session;

    fn open(
        &self,
        service: &str,
        identity: Option<&str>,
    ) -> Result<(Self::Session, EventStream), AuthError> {
        (**self).open(service, identity)
    }
}

impl<T: AuthBackend + ?Sized> AuthBackend for Arc<T> {
    type Session = T::Session;

    fn open(
        &self,
        service: &str,
        identity: Option<&str>,
    ) -> Result<(Self::Session, EventStream), AuthError> {
        (**self).open(service, identity)
    }
}

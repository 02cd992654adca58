//! Error types for the session layer.

use loginforge_auth::AuthError;
use loginforge_privsep::PrivsepError;

use crate::{SessionId, SessionState};

/// Errors returned by [`Session`](crate::Session) and
/// [`SessionManager`](crate::SessionManager).
///
/// Asynchronous authentication failures are not errors here. They arrive
/// as events and are reported through [`Progress`](crate::Progress).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The variable name is empty or contains `=` or NUL.
    #[error("invalid environment variable name {0:?}")]
    InvalidVariable(String),

    /// The operation is not valid in the current state.
    #[error("cannot {operation} a session in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The backend could not produce an adapter for this service.
    #[error("cannot open authentication adapter for service {service}: {source}")]
    AdapterCreationFailed { service: String, source: AuthError },

    /// The adapter refused to begin authentication.
    #[error("authentication adapter for service {0} refused to start")]
    StartRejected(String),

    /// The adapter rejected a forwarded call.
    #[error(transparent)]
    Adapter(AuthError),

    /// Authentication succeeded but no user name is known.
    #[error("session created without a known identity")]
    UnknownIdentity,

    /// Identity lookup, fork or wait failed.
    #[error(transparent)]
    Privsep(#[from] PrivsepError),

    /// No session is registered under this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session configuration could not be parsed.
    #[error("invalid session configuration: {0}")]
    Config(#[from] serde_json::Error),
}

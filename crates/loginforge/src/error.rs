//! Unified error type for Loginforge.

use loginforge_auth::AuthError;
use loginforge_privsep::{PrivsepError, TerminalError};
use loginforge_session::SessionError;

/// Top-level error that wraps all crate-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum LoginforgeError {
    /// An authentication adapter error.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Identity lookup, privilege drop, fork or wait.
    #[error(transparent)]
    Privsep(#[from] PrivsepError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    /// A session lifecycle error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Reading configuration or other host I/O.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reported by an authentication backend.
///
/// These travel two ways: synchronously out of [`AuthBackend::open`] and
/// [`AuthSession::putenv`], and asynchronously inside
/// [`AuthEvent`](crate::AuthEvent) payloads.
///
/// [`AuthBackend::open`]: crate::AuthBackend::open
/// [`AuthSession::putenv`]: crate::AuthSession::putenv
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The backend has no policy for the requested service name.
    #[error("unknown authentication service: {0}")]
    UnknownService(String),

    /// The credentials were rejected.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// The backend could not accept an environment variable.
    #[error("invalid environment variable: {0}")]
    InvalidVariable(String),

    /// Any other backend failure (conversation aborted, module error, ...).
    #[error("authentication backend failure: {0}")]
    Backend(String),
}

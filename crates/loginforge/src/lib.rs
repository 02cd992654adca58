//! # Loginforge
//!
//! The session-establishment core of a login manager.
//!
//! Loginforge takes a login attempt from "which service, which user" to a
//! running user session: it drives an asynchronous authentication
//! backend, and on success forks a child that acquires the terminal,
//! drops to the user's credentials and execs the session program with a
//! freshly built environment.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loginforge::prelude::*;
//!
//! // Implement AuthBackend for your authentication stack, then:
//! // let mut session = Session::system("login", SessionConfig::default(), backend);
//! // session.start(Some("alice"))?;
//! // match session.run().await? { ... }
//! ```
//!
//! Drive sessions from a `current_thread` runtime; `fork` is only sound
//! while the process has a single thread.

mod error;

pub use error::LoginforgeError;

pub use loginforge_auth as auth;
pub use loginforge_privsep as privsep;
pub use loginforge_session as session;

use tracing_subscriber::EnvFilter;

pub mod prelude {
    pub use crate::LoginforgeError;
    pub use loginforge_auth::{
        AuthBackend, AuthError, AuthEvent, AuthSession, EventSender, EventStream, event_channel,
    };
    pub use loginforge_privsep::{ExecTarget, FailurePolicy, Identity, IdentityStore, StepPolicy};
    pub use loginforge_session::{
        ForkSide, Progress, Session, SessionConfig, SessionError, SessionId, SessionManager,
        SessionState,
    };
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (for example `"info"` or `"loginforge_session=debug"`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

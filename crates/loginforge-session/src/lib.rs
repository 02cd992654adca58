//! Login session lifecycle for Loginforge.
//!
//! A [`Session`] drives one login attempt from start to exit:
//!
//! 1. **Staging**: variables set with [`Session::putenv`] wait until an
//!    adapter exists
//! 2. **Authentication**: [`Session::start`] opens an adapter through the
//!    [`AuthBackend`](loginforge_auth::AuthBackend) and events arrive on
//!    [`Session::next_event`]
//! 3. **Establishment**: on `session-created` the session forks; the
//!    parent waits and reports the exit status, the child runs the
//!    privilege-separated pipeline and execs the session program
//!
//! # How it fits in the stack
//!
//! ```text
//! Login manager (above)        ← one SessionManager, many sessions
//!     ↕
//! Session Layer (this crate)   ← state machine, event handling, fork
//!     ↕
//! Auth / Privsep Layers (below) ← adapter contract, child pipeline
//! ```
//!
//! # Runtime
//!
//! `fork` is only sound while the process has a single thread. Drive
//! sessions from a `current_thread` Tokio runtime.

mod config;
mod error;
mod manager;
mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use manager::{SessionId, SessionManager};
pub use session::{ForkSide, Progress, Session, SessionState};

//! Lifecycle events raised by an authentication adapter.
//!
//! Events travel over an unbounded Tokio channel. The adapter keeps the
//! [`EventSender`]; the session that owns the adapter keeps the
//! [`EventStream`]. When the owner drops its stream the channel closes and
//! every later [`EventSender::send`] returns `false`, so an adapter can
//! never call back into an owner that no longer exists.

use std::fmt;

use tokio::sync::mpsc;

use crate::AuthError;

/// One lifecycle event of an authentication attempt.
///
/// Exactly one of these is the terminal event of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Identity verification failed.
    AuthError(AuthError),

    /// Authentication succeeded and the backend opened its session.
    SessionCreated {
        /// Opaque backend session identifier.
        session_id: String,
    },

    /// The backend failed to establish the session after authenticating.
    ///
    /// Some backends raise this without any detail, hence the `Option`.
    SessionError(Option<AuthError>),
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthError(_) => write!(f, "auth-error"),
            Self::SessionCreated { .. } => write!(f, "session-created"),
            Self::SessionError(_) => write!(f, "session-error"),
        }
    }
}

/// Adapter-side half of an event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::UnboundedSender<AuthEvent>,
}

impl EventSender {
    /// Delivers an event to the owner.
    ///
    /// Returns `false` once the owner has released its [`EventStream`].
    pub fn send(&self, event: AuthEvent) -> bool {
        match self.inner.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::debug!(%event, "event dropped, owner released");
                false
            }
        }
    }

    /// Returns `true` if the owning stream has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Owner-side half of an event channel. Events arrive in send order.
#[derive(Debug)]
pub struct EventStream {
    inner: mpsc::UnboundedReceiver<AuthEvent>,
}

impl EventStream {
    /// Waits for the next event.
    ///
    /// Returns `None` when every sender has been dropped and the buffer
    /// is drained.
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        self.inner.recv().await
    }

    /// Returns an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<AuthEvent> {
        self.inner.try_recv().ok()
    }
}

/// Creates a connected sender/stream pair.
pub fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { inner: tx }, EventStream { inner: rx })
}

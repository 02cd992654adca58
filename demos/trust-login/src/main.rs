//! A login that trusts whoever it is told to log in.
//!
//! Usage: `trust-login [CONFIG.json] [USER]`
//!
//! Must run as root to drop into another user. Without root the
//! privilege steps fail, are logged, and the session program still
//! starts as the invoking user (unless the config sets
//! `"policy": { "privileges": "abort" }`).

use std::collections::BTreeMap;
use std::process::ExitStatus;

use loginforge::prelude::*;
use rand::Rng;

// ---------------------------------------------------------------------------
// Trust backend
// ---------------------------------------------------------------------------

/// Accepts every user without a credential check. Development only.
struct TrustBackend;

struct TrustSession {
    service: String,
    user: Option<String>,
    session_id: Option<String>,
    environment: BTreeMap<String, String>,
    events: EventSender,
}

impl AuthSession for TrustSession {
    fn putenv(&mut self, key: &str, value: &str) -> Result<(), AuthError> {
        tracing::debug!(%key, %value, "backend environment");
        self.environment.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn start(&mut self) -> bool {
        let event = match &self.user {
            Some(_) => {
                let id = generate_session_id();
                self.session_id = Some(id.clone());
                AuthEvent::SessionCreated { session_id: id }
            }
            None => AuthEvent::AuthError(AuthError::Rejected(
                "trust backend needs a user name".into(),
            )),
        };
        self.events.send(event)
    }

    fn stop(&mut self, status: ExitStatus) {
        tracing::info!(
            service = %self.service,
            session_id = self.session_id.as_deref().unwrap_or("-"),
            variables = self.environment.len(),
            ?status,
            "backend session closed"
        );
    }

    fn username(&self) -> Option<String> {
        self.user.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

impl AuthBackend for TrustBackend {
    type Session = TrustSession;

    fn open(
        &self,
        service: &str,
        identity: Option<&str>,
    ) -> Result<(TrustSession, EventStream), AuthError> {
        let (events, stream) = event_channel();
        let session = TrustSession {
            service: service.to_string(),
            user: identity.map(str::to_string),
            session_id: None,
            environment: BTreeMap::new(),
            events,
        };
        Ok((session, stream))
    }
}

/// 16 random bytes as hex.
fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), LoginforgeError> {
    loginforge::init_tracing("info");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SessionConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SessionConfig::default(),
    };
    let user = args
        .next()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string());

    let mut session = Session::system("login", config, TrustBackend);
    session.putenv("XDG_SESSION_TYPE", "tty")?;
    session.putenv("XDG_SESSION_CLASS", "user")?;
    session.start(Some(&user))?;

    match session.run().await? {
        Progress::Finished { child, status } => {
            tracing::info!(%child, ?status, "user session ended");
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
        }
        Progress::ChildExited(exit) => {
            // Unreachable with the real process layer.
            std::process::exit(exit.code);
        }
        other => {
            tracing::warn!(?other, "login did not complete");
            std::process::exit(1);
        }
    }
    Ok(())
}

//! Session configuration.

use std::path::PathBuf;

use loginforge_privsep::{DEFAULT_DEVICE_DIR, DEFAULT_SEARCH_PATH, ExecTarget, StepPolicy};
use serde::{Deserialize, Serialize};

use crate::SessionError;

/// What a session child runs and how strictly it hardens itself.
///
/// Every field has a default, so a partial JSON document only overrides
/// the fields it names:
///
/// ```json
/// { "target": { "program": "/bin/sh", "args": ["-l"] },
///   "policy": { "privileges": "abort" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// The fixed `PATH` of the session environment. Never inherited.
    pub search_path: String,

    /// Program the child replaces itself with.
    pub target: ExecTarget,

    /// Terminals must live under this directory.
    pub device_dir: PathBuf,

    /// Failure policy of each child step.
    pub policy: StepPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search_path: DEFAULT_SEARCH_PATH.to_string(),
            target: ExecTarget::default(),
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            policy: StepPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    /// Returns [`SessionError::Config`] for malformed JSON or mistyped
    /// fields.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(json)?)
    }
}

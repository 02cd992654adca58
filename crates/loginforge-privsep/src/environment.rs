//! The environment handed to the session program.
//!
//! The child starts from nothing: no variable of the login manager's own
//! environment survives. Exactly five variables are set, and the map is
//! passed straight to `execve` rather than being installed with `setenv`.
//!
//! Variables a caller stages with `Session::putenv` belong to the
//! authentication backend and never appear here.

use std::collections::BTreeMap;
use std::ffi::CString;

use crate::{Identity, PrivsepError};

/// Search path used by every session, independent of the parent.
pub const DEFAULT_SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// An explicit, ordered environment for one session child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvironment {
    vars: BTreeMap<String, String>,
}

impl SessionEnvironment {
    /// Builds PATH, USER, LOGNAME, HOME and SHELL for `identity`.
    pub fn for_identity(identity: &Identity, search_path: &str) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("PATH".to_string(), search_path.to_string());
        vars.insert("USER".to_string(), identity.name.clone());
        vars.insert("LOGNAME".to_string(), identity.name.clone());
        vars.insert(
            "HOME".to_string(),
            identity.home.to_string_lossy().into_owned(),
        );
        vars.insert(
            "SHELL".to_string(),
            identity.shell.to_string_lossy().into_owned(),
        );
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// The search path programs are resolved against.
    pub fn search_path(&self) -> &str {
        self.get("PATH").unwrap_or(DEFAULT_SEARCH_PATH)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `KEY=value` strings for `execve`.
    ///
    /// # Errors
    /// [`PrivsepError::InteriorNul`] if a value contains a NUL byte.
    pub fn to_envp(&self) -> Result<Vec<CString>, PrivsepError> {
        self.vars
            .iter()
            .map(|(k, v)| {
                CString::new(format!("{k}={v}"))
                    .map_err(|_| PrivsepError::InteriorNul(k.clone()))
            })
            .collect()
    }
}

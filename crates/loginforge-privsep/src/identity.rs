//! Identity resolution: user name → uid, gid, home, shell.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid, User};

use crate::PrivsepError;

/// A resolved login identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    /// Primary group.
    pub gid: Gid,
    pub home: PathBuf,
    pub shell: PathBuf,
}

/// Looks identities up by name.
pub trait IdentityStore {
    /// # Errors
    /// [`PrivsepError::UnknownUser`] when no such identity exists.
    fn lookup(&self, name: &str) -> Result<Identity, PrivsepError>;
}

/// The system password database (`getpwnam_r`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentityStore;

impl IdentityStore for SystemIdentityStore {
    fn lookup(&self, name: &str) -> Result<Identity, PrivsepError> {
        let user = User::from_name(name)
            .map_err(|source| PrivsepError::Lookup {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| PrivsepError::UnknownUser(name.to_string()))?;

        Ok(Identity {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            home: user.dir,
            shell: user.shell,
        })
    }
}

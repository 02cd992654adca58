//! Privilege transition: supplementary groups → GID → UID.
//!
//! The order is fixed. The UID goes last because once it is dropped the
//! process can no longer change its groups or GID; dropping it first would
//! leave the target user running with the manager's groups.
//!
//! Each step can be made fatal or merely logged through
//! [`FailurePolicy`]. The default, [`FailurePolicy::Log`], keeps running
//! after a failed step. A child that continues after a failed `set_uid`
//! still runs as the manager's identity, so deployments that cannot
//! tolerate that should select [`FailurePolicy::Abort`].

use std::ffi::{CStr, CString};
use std::fmt;

use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};
use serde::{Deserialize, Serialize};

use crate::{Identity, PrivsepError};

/// What to do when a hardening step fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log a warning and carry on.
    #[default]
    Log,
    /// Stop before anything else runs.
    Abort,
}

impl FailurePolicy {
    pub fn is_abort(self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// One step of the transition, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeStep {
    Groups,
    Gid,
    Uid,
}

impl fmt::Display for PrivilegeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Groups => write!(f, "initgroups()"),
            Self::Gid => write!(f, "setresgid()"),
            Self::Uid => write!(f, "setresuid()"),
        }
    }
}

/// The credential syscalls a transition needs.
pub trait Credentials {
    fn init_groups(&mut self, user: &CStr, gid: Gid) -> Result<(), Errno>;

    /// Sets real, effective and saved GID.
    fn set_gid(&mut self, gid: Gid) -> Result<(), Errno>;

    /// Sets real, effective and saved UID.
    fn set_uid(&mut self, uid: Uid) -> Result<(), Errno>;

    /// Tries to become root again, then drops back to `uid`.
    fn regain_root(&mut self, uid: Uid) -> RootRecovery;
}

/// Result of trying to regain root after the UID drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootRecovery {
    /// `setuid(0)` failed: the drop is irreversible.
    Unrecoverable,
    /// Root was regained and dropped again.
    Recoverable,
    /// Root was regained and the second drop failed. The process is root.
    StuckAsRoot(Errno),
}

/// The real credential syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCredentials;

impl Credentials for SystemCredentials {
    fn init_groups(&mut self, user: &CStr, gid: Gid) -> Result<(), Errno> {
        unistd::initgroups(user, gid)
    }

    fn set_gid(&mut self, gid: Gid) -> Result<(), Errno> {
        unistd::setresgid(gid, gid, gid)
    }

    fn set_uid(&mut self, uid: Uid) -> Result<(), Errno> {
        unistd::setresuid(uid, uid, uid)
    }

    fn regain_root(&mut self, uid: Uid) -> RootRecovery {
        if unistd::setuid(Uid::from_raw(0)).is_err() {
            return RootRecovery::Unrecoverable;
        }
        match unistd::setresuid(uid, uid, uid) {
            Ok(()) => RootRecovery::Recoverable,
            Err(errno) => RootRecovery::StuckAsRoot(errno),
        }
    }
}

/// Outcome of [`transition`] under [`FailurePolicy::Log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionReport {
    /// Steps that failed, in execution order.
    pub failed: Vec<PrivilegeStep>,
    /// Root could be regained after the drop.
    pub privileges_recoverable: bool,
}

impl TransitionReport {
    /// Every step succeeded and the drop is irreversible.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.privileges_recoverable
    }
}

/// Drops the calling process to `identity`.
///
/// Must run in the forked child, after terminal acquisition and `setsid`,
/// before the environment is built and the program is executed.
///
/// # Errors
/// Only under [`FailurePolicy::Abort`]: the first failing step, or
/// [`PrivsepError::PrivilegesRecoverable`].
pub fn transition<C: Credentials>(
    creds: &mut C,
    identity: &Identity,
    policy: FailurePolicy,
) -> Result<TransitionReport, PrivsepError> {
    tracing::debug!(
        ruid = %unistd::getuid(),
        euid = %unistd::geteuid(),
        rgid = %unistd::getgid(),
        egid = %unistd::getegid(),
        user = %identity.name,
        "dropping privileges"
    );

    let user = CString::new(identity.name.as_str())
        .map_err(|_| PrivsepError::InteriorNul(identity.name.clone()))?;
    let mut report = TransitionReport::default();

    for step in [PrivilegeStep::Groups, PrivilegeStep::Gid, PrivilegeStep::Uid] {
        let result = match step {
            PrivilegeStep::Groups => creds.init_groups(&user, identity.gid),
            PrivilegeStep::Gid => creds.set_gid(identity.gid),
            PrivilegeStep::Uid => creds.set_uid(identity.uid),
        };
        if let Err(source) = result {
            tracing::warn!(%step, error = %source, user = %identity.name, "privilege step failed");
            if policy.is_abort() {
                return Err(PrivsepError::Privilege { step, source });
            }
            report.failed.push(step);
        }
    }

    if report.failed.is_empty() && !identity.uid.is_root() {
        match creds.regain_root(identity.uid) {
            RootRecovery::Unrecoverable => {}
            RootRecovery::Recoverable => {
                tracing::error!(uid = %identity.uid, "root privileges still recoverable");
                if policy.is_abort() {
                    return Err(PrivsepError::PrivilegesRecoverable(identity.uid));
                }
                report.privileges_recoverable = true;
            }
            RootRecovery::StuckAsRoot(source) => {
                tracing::error!(uid = %identity.uid, error = %source, "cannot drop root again after regaining it");
                if policy.is_abort() {
                    return Err(PrivsepError::Privilege {
                        step: PrivilegeStep::Uid,
                        source,
                    });
                }
                report.failed.push(PrivilegeStep::Uid);
                report.privileges_recoverable = true;
            }
        }
    }

    Ok(report)
}

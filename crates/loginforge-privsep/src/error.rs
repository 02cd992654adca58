//! Error types for the privilege-separation layer.

use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Uid;

use crate::privilege::PrivilegeStep;

/// Errors raised while validating and binding a controlling terminal.
///
/// Every variant is recoverable: terminal acquisition is best-effort
/// hardening and the child continues without a terminal by default.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    /// Descriptor 0 is not attached to a terminal.
    #[error("no terminal attached to stdin")]
    NoTerminal,

    #[error("terminal {} not accessible: {source}", .path.display())]
    Inaccessible { path: PathBuf, source: Errno },

    #[error("lstat of {} failed: {source}", .path.display())]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The device has more than one hard link.
    #[error("terminal {} has {links} links", .path.display())]
    SharedDevice { path: PathBuf, links: u64 },

    /// The path is not a character device (symlinks are not followed).
    #[error("{} is not a character device", .0.display())]
    NotCharDevice(PathBuf),

    #[error("terminal {} is outside {}", .path.display(), .dir.display())]
    OutsideDeviceDir { path: PathBuf, dir: PathBuf },

    #[error("open of {} failed: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The device opened fine but is not a terminal.
    #[error("{} is not a terminal", .0.display())]
    NotATerminal(PathBuf),

    /// Rebinding the standard descriptors failed.
    #[error("dup2 onto descriptor {fd} failed: {source}")]
    Rebind { fd: i32, source: Errno },
}

/// Errors that can occur in the privilege-separation layer.
#[derive(Debug, thiserror::Error)]
pub enum PrivsepError {
    /// The identity store has no entry for this name.
    #[error("unknown user {0}")]
    UnknownUser(String),

    /// The identity store itself failed.
    #[error("user lookup for {name} failed: {source}")]
    Lookup { name: String, source: Errno },

    /// A string headed for a C interface contains a NUL byte.
    #[error("{0} contains an interior NUL byte")]
    InteriorNul(String),

    #[error("{step} failed: {source}")]
    Privilege { step: PrivilegeStep, source: Errno },

    /// The child dropped to `uid` but could still become root again.
    #[error("privileges still recoverable after dropping to uid {0}")]
    PrivilegesRecoverable(Uid),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("waiting for child failed: {0}")]
    Wait(Errno),

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

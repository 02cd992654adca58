//! Privilege separation for Loginforge session children.
//!
//! Everything that happens between `fork` and `execve`, plus the
//! identity lookups it depends on:
//!
//! - [`IdentityStore`]: user name → uid, gid, home, shell
//! - [`TerminalAcquirer`]: validate and bind the controlling terminal
//! - [`privilege::transition`]: groups → GID → UID
//! - [`SessionEnvironment`]: the five-variable session environment
//! - [`ExecTarget`]: what the child becomes
//! - [`ChildPipeline`]: the ordered child steps and their policies
//! - [`ProcessControl`]: fork / wait / exit
//!
//! The OS operations live behind traits ([`Credentials`], [`ChildSys`],
//! [`ProcessControl`]) so the order of operations can be tested without
//! root and without forking the test runner.

pub mod child;
pub mod environment;
mod error;
pub mod exec;
mod identity;
pub mod privilege;
pub mod process;
pub mod terminal;

pub use child::{ChildExit, ChildPipeline, ChildStep, ChildSys, StepPolicy, SystemChild};
pub use environment::{DEFAULT_SEARCH_PATH, SessionEnvironment};
pub use error::{PrivsepError, TerminalError};
pub use exec::ExecTarget;
pub use identity::{Identity, IdentityStore, SystemIdentityStore};
pub use privilege::{Credentials, FailurePolicy, RootRecovery, SystemCredentials, TransitionReport};
pub use process::{ChildHandle, ForkOutcome, ProcessControl, SystemProcess};
pub use terminal::{DEFAULT_DEVICE_DIR, DeviceInfo, TerminalAcquirer};

pub use nix::unistd::{Gid, Pid, Uid};

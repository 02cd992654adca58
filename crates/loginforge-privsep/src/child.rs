//! The child half of session establishment.
//!
//! After `fork`, the child runs a fixed pipeline:
//!
//! ```text
//! terminal → detach (setsid) → privileges → environment → chdir(home) → exec
//! ```
//!
//! Every step except `exec` has a named [`FailurePolicy`] in
//! [`StepPolicy`]. Exec failure is always fatal: there is no fallback
//! shell, the child exits with 127 (program not found) or 126.

use std::ffi::{CStr, CString};
use std::fmt;
use std::path::Path;

use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};
use serde::{Deserialize, Serialize};

use crate::environment::SessionEnvironment;
use crate::exec::{ExecTarget, path_to_cstring, resolve_program};
use crate::privilege::{self, Credentials, FailurePolicy, RootRecovery, SystemCredentials};
use crate::terminal::TerminalAcquirer;
use crate::{Identity, TerminalError};

/// Exit code when the target program cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code when the target program exists but cannot be executed.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;
/// Exit code when a step under [`FailurePolicy::Abort`] fails.
pub const EXIT_ABORTED: i32 = 1;

/// Per-step failure policy for the child pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(default)]
pub struct StepPolicy {
    pub terminal: FailurePolicy,
    pub detach: FailurePolicy,
    /// Defaults to [`FailurePolicy::Log`]. See the
    /// [`privilege`](crate::privilege) module docs before relying on it.
    pub privileges: FailurePolicy,
    pub working_dir: FailurePolicy,
}

/// The pipeline steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStep {
    Terminal,
    Detach,
    Privileges,
    Environment,
    WorkingDir,
    Exec,
}

impl fmt::Display for ChildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal => write!(f, "terminal"),
            Self::Detach => write!(f, "detach"),
            Self::Privileges => write!(f, "privileges"),
            Self::Environment => write!(f, "environment"),
            Self::WorkingDir => write!(f, "working-dir"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

/// Why and how a child ended without becoming the target program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub step: ChildStep,
    pub code: i32,
    pub reason: String,
}

impl ChildExit {
    fn aborted(step: ChildStep, reason: impl fmt::Display) -> Self {
        Self {
            step,
            code: EXIT_ABORTED,
            reason: reason.to_string(),
        }
    }
}

/// Process operations the child pipeline performs.
pub trait ChildSys: Credentials {
    fn acquire_terminal(
        &mut self,
        acquirer: &TerminalAcquirer,
    ) -> Result<(), TerminalError>;

    /// `setsid()`: new session, no controlling terminal inherited.
    fn new_session(&mut self) -> Result<(), Errno>;

    fn change_dir(&mut self, dir: &Path) -> Result<(), Errno>;

    /// Replaces the process image. Returns only on failure.
    fn exec(
        &mut self,
        program: &CString,
        argv: &[CString],
        envp: &[CString],
    ) -> Errno;
}

/// The real child-side syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemChild {
    creds: SystemCredentials,
}

impl Credentials for SystemChild {
    fn init_groups(&mut self, user: &CStr, gid: Gid) -> Result<(), Errno> {
        self.creds.init_groups(user, gid)
    }

    fn set_gid(&mut self, gid: Gid) -> Result<(), Errno> {
        self.creds.set_gid(gid)
    }

    fn set_uid(&mut self, uid: Uid) -> Result<(), Errno> {
        self.creds.set_uid(uid)
    }

    fn regain_root(&mut self, uid: Uid) -> RootRecovery {
        self.creds.regain_root(uid)
    }
}

impl ChildSys for SystemChild {
    fn acquire_terminal(
        &mut self,
        acquirer: &TerminalAcquirer,
    ) -> Result<(), TerminalError> {
        acquirer.acquire().map(|_| ())
    }

    fn new_session(&mut self) -> Result<(), Errno> {
        unistd::setsid().map(|_| ())
    }

    fn change_dir(&mut self, dir: &Path) -> Result<(), Errno> {
        unistd::chdir(dir)
    }

    fn exec(
        &mut self,
        program: &CString,
        argv: &[CString],
        envp: &[CString],
    ) -> Errno {
        match unistd::execve::<CString, CString>(program, argv, envp) {
            Ok(never) => match never {},
            Err(errno) => errno,
        }
    }
}

/// Everything the child needs, captured in the parent before `fork`.
#[derive(Debug, Clone)]
pub struct ChildPipeline {
    pub identity: Identity,
    pub search_path: String,
    pub target: ExecTarget,
    pub terminal: TerminalAcquirer,
    pub policy: StepPolicy,
}

impl ChildPipeline {
    /// Runs the pipeline. With the real [`SystemChild`] this only returns
    /// if the process did not become the target program.
    pub fn run<S: ChildSys>(&self, sys: &mut S) -> ChildExit {
        let user = self.identity.name.as_str();

        if let Err(e) = sys.acquire_terminal(&self.terminal) {
            tracing::warn!(%user, error = %e, "terminal acquisition failed");
            if self.policy.terminal.is_abort() {
                return ChildExit::aborted(ChildStep::Terminal, e);
            }
        }

        if let Err(e) = sys.new_session() {
            tracing::warn!(%user, error = %e, "setsid() failed");
            if self.policy.detach.is_abort() {
                return ChildExit::aborted(ChildStep::Detach, e);
            }
        }

        match privilege::transition(sys, &self.identity, self.policy.privileges) {
            Ok(report) if !report.is_complete() => {
                tracing::warn!(%user, failed = ?report.failed, "continuing with incomplete privilege drop");
            }
            Ok(_) => {}
            Err(e) => return ChildExit::aborted(ChildStep::Privileges, e),
        }

        let environment =
            SessionEnvironment::for_identity(&self.identity, &self.search_path);
        let prepared = environment.to_envp().and_then(|envp| {
            self.target.argv().map(|argv| (argv, envp))
        });
        let (argv, envp) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(%user, error = %e, "cannot build session environment");
                return ChildExit::aborted(ChildStep::Environment, e);
            }
        };

        if let Err(e) = sys.change_dir(&self.identity.home) {
            tracing::warn!(%user, home = %self.identity.home.display(), error = %e, "chdir() failed");
            if self.policy.working_dir.is_abort() {
                return ChildExit::aborted(ChildStep::WorkingDir, e);
            }
        }

        let program = match resolve_program(
            &self.target.program,
            environment.search_path(),
        ) {
            Some(path) => path,
            None => {
                tracing::error!(%user, program = %self.target.program, "program not found");
                return ChildExit {
                    step: ChildStep::Exec,
                    code: EXIT_NOT_FOUND,
                    reason: format!("{} not found", self.target.program),
                };
            }
        };
        let program_c = match path_to_cstring(&program) {
            Ok(c) => c,
            Err(e) => return ChildExit::aborted(ChildStep::Exec, e),
        };

        tracing::debug!(%user, program = %program.display(), home = %self.identity.home.display(), "starting session program");
        let errno = sys.exec(&program_c, &argv, &envp);
        tracing::error!(%user, program = %program.display(), error = %errno, "execve() failed");

        ChildExit {
            step: ChildStep::Exec,
            code: if errno == Errno::ENOENT {
                EXIT_NOT_FOUND
            } else {
                EXIT_CANNOT_EXECUTE
            },
            reason: errno.to_string(),
        }
    }
}

//! Fork, wait and child exit.
//!
//! [`ProcessControl`] is the seam between the session controller and the
//! kernel. [`SystemProcess`] is the real thing; tests substitute a double
//! that pretends to be either side of the fork.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};

use crate::child::{ChildExit, ChildSys, SystemChild};
use crate::PrivsepError;

/// The parent's handle on a forked child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl fmt::Display for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pid)
    }
}

/// Which side of the fork we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Parent: wait on this child.
    ParentWaiting(ChildHandle),
    /// Child: run the pipeline and never come back.
    ChildTransitioning,
}

/// Process creation and reaping.
pub trait ProcessControl {
    type Child: ChildSys;

    fn fork(&mut self) -> Result<ForkOutcome, PrivsepError>;

    /// Blocks until `child` (and only `child`) terminates.
    fn wait(&mut self, child: ChildHandle) -> Result<ExitStatus, PrivsepError>;

    /// Syscalls for the child side.
    fn child_sys(&mut self) -> Self::Child;

    /// Ends the child after a failed pipeline. The real implementation
    /// does not return.
    fn exit_child(&mut self, exit: &ChildExit);
}

/// The real process layer. The caller must be single-threaded when it
/// forks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    type Child = SystemChild;

    fn fork(&mut self) -> Result<ForkOutcome, PrivsepError> {
        // SAFETY: the session controller runs on a current-thread runtime,
        // so the child inherits no other thread's locks.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => {
                Ok(ForkOutcome::ParentWaiting(ChildHandle::new(child)))
            }
            Ok(ForkResult::Child) => Ok(ForkOutcome::ChildTransitioning),
            Err(errno) => Err(PrivsepError::Fork(errno)),
        }
    }

    fn wait(&mut self, child: ChildHandle) -> Result<ExitStatus, PrivsepError> {
        loop {
            match waitpid(child.pid(), None) {
                Ok(status) => {
                    if let Some(status) = exit_status_from_wait(status) {
                        return Ok(status);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(PrivsepError::Wait(errno)),
            }
        }
    }

    fn child_sys(&mut self) -> SystemChild {
        SystemChild::default()
    }

    fn exit_child(&mut self, exit: &ChildExit) {
        // SAFETY: _exit only terminates the calling process. It skips
        // atexit handlers and stdio flushing, which belong to the parent.
        unsafe { libc::_exit(exit.code) }
    }
}

/// Re-encodes a terminal [`WaitStatus`] as the raw wait status.
///
/// Returns `None` for non-terminal states (stopped, continued).
pub fn exit_status_from_wait(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => {
            Some(ExitStatus::from_raw((code & 0xff) << 8))
        }
        WaitStatus::Signaled(_, signal, core_dumped) => {
            let core = if core_dumped { 0x80 } else { 0 };
            Some(ExitStatus::from_raw(signal as i32 | core))
        }
        _ => None,
    }
}

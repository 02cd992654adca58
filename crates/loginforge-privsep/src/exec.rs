//! The program a session child becomes.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Identity, PrivsepError};

/// Program and arguments executed at the end of the child pipeline.
///
/// The default is the user service manager (`systemd --user`). There is
/// no per-session shell selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTarget {
    /// Bare name (resolved against the session PATH) or a path.
    pub program: String,
    /// Arguments after `argv[0]`.
    pub args: Vec<String>,
}

impl Default for ExecTarget {
    fn default() -> Self {
        Self {
            program: "systemd".to_string(),
            args: vec!["--user".to_string()],
        }
    }
}

impl ExecTarget {
    /// `<shell> -l` for `identity`.
    ///
    /// Not used by the session controller; sessions always run the
    /// configured target.
    pub fn login_shell(identity: &Identity) -> Self {
        Self {
            program: identity.shell.to_string_lossy().into_owned(),
            args: vec!["-l".to_string()],
        }
    }

    /// `[program, args...]` as C strings.
    pub fn argv(&self) -> Result<Vec<CString>, PrivsepError> {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|arg| {
                CString::new(arg.as_str())
                    .map_err(|_| PrivsepError::InteriorNul(arg.clone()))
            })
            .collect()
    }
}

/// Finds `program` the way `execlp` would, but against an explicit
/// search path instead of the process environment.
///
/// A name containing `/` is returned unchanged.
pub fn resolve_program(program: &str, search_path: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

/// Converts a path for `execve`.
pub fn path_to_cstring(path: &Path) -> Result<CString, PrivsepError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| PrivsepError::InteriorNul(path.display().to_string()))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

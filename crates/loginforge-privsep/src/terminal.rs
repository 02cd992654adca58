//! Controlling terminal acquisition.
//!
//! The child takes the terminal attached to its stdin, but only after
//! proving the device is genuine:
//!
//! ```text
//! ttyname(stdin) → access(rw) → lstat → check_device → open(O_NONBLOCK) → isatty
//!                                      │
//!                                      ├─ links == 1
//!                                      ├─ character device (lstat, not stat)
//!                                      └─ under the device directory
//! ```
//!
//! The three `check_device` rules are always enforced together.
//!
//! Only after every check passes are descriptors touched: everything
//! below the new descriptor is closed and the terminal is duplicated onto
//! 0, 1 and 2.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::IsTerminal;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use nix::unistd::{self, AccessFlags};

use crate::TerminalError;

/// Canonical device directory prefix.
pub const DEFAULT_DEVICE_DIR: &str = "/dev/";

/// The parts of a device's `lstat` result the checks look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub links: u64,
    pub is_char_device: bool,
}

impl DeviceInfo {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            links: meta.nlink(),
            is_char_device: meta.file_type().is_char_device(),
        }
    }
}

/// Validates and binds a controlling terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalAcquirer {
    device_dir: PathBuf,
}

impl Default for TerminalAcquirer {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_DIR)
    }
}

impl TerminalAcquirer {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// Takes the terminal attached to stdin and rebinds 0, 1 and 2 to it.
    ///
    /// Returns the device path on success. Validation errors leave every
    /// descriptor untouched. [`TerminalError::Rebind`] does not: by then
    /// the descriptors below the terminal have already been closed.
    pub fn acquire(&self) -> Result<PathBuf, TerminalError> {
        let path = unistd::ttyname(std::io::stdin())
            .map_err(|_| TerminalError::NoTerminal)?;
        tracing::debug!(tty = %path.display(), "trying to set up terminal");

        let tty = self.validate(&path)?;
        bind_standard_descriptors(tty)?;
        Ok(path)
    }

    /// Runs every check on `path` and opens it.
    ///
    /// Touches no existing descriptor; the returned file is a fresh one.
    pub fn validate(&self, path: &Path) -> Result<File, TerminalError> {
        unistd::access(path, AccessFlags::R_OK | AccessFlags::W_OK).map_err(
            |source| TerminalError::Inaccessible {
                path: path.to_path_buf(),
                source,
            },
        )?;

        let meta =
            fs::symlink_metadata(path).map_err(|source| TerminalError::Stat {
                path: path.to_path_buf(),
                source,
            })?;
        self.check_device(path, DeviceInfo::from_metadata(&meta))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| TerminalError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        if !file.is_terminal() {
            return Err(TerminalError::NotATerminal(path.to_path_buf()));
        }
        Ok(file)
    }

    /// The anti-spoofing rules, on an already `lstat`ed device.
    pub fn check_device(
        &self,
        path: &Path,
        info: DeviceInfo,
    ) -> Result<(), TerminalError> {
        if info.links > 1 {
            return Err(TerminalError::SharedDevice {
                path: path.to_path_buf(),
                links: info.links,
            });
        }
        if !info.is_char_device {
            return Err(TerminalError::NotCharDevice(path.to_path_buf()));
        }
        let escapes = path.components().any(|c| c == Component::ParentDir);
        if escapes || !path.starts_with(&self.device_dir) {
            return Err(TerminalError::OutsideDeviceDir {
                path: path.to_path_buf(),
                dir: self.device_dir.clone(),
            });
        }
        Ok(())
    }
}

fn bind_standard_descriptors(tty: File) -> Result<(), TerminalError> {
    let fd = tty.into_raw_fd();

    // Inherited descriptors must not cross the privilege boundary.
    for old in 0..fd {
        let _ = unistd::close(old);
    }
    for target in [
        libc::STDIN_FILENO,
        libc::STDOUT_FILENO,
        libc::STDERR_FILENO,
    ] {
        unistd::dup2(fd, target)
            .map_err(|source| TerminalError::Rebind { fd: target, source })?;
    }
    if fd > libc::STDERR_FILENO {
        let _ = unistd::close(fd);
    }
    Ok(())
}

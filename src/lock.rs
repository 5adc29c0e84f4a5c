//! Process-wide exclusive lock on the device.
//!
//! Only one process may drive the interface at a time. The lock is an
//! advisory `flock` on a file in the temp directory, released automatically
//! when the holder exits, even if it crashes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Uac2Error;

/// Holds the device lock until dropped.
#[derive(Debug)]
pub struct DeviceLock {
    name: String,
    path: PathBuf,
    _file: File,
}

impl DeviceLock {
    /// Takes the lock `name` in the system temp directory.
    ///
    /// # Errors
    ///
    /// [`Uac2Error::DeviceBusy`] if another holder has it, or
    /// [`Uac2Error::Lock`] if the lock file cannot be opened.
    pub fn acquire(name: &str) -> Result<Self, Uac2Error> {
        Self::acquire_in(&std::env::temp_dir(), name)
    }

    /// Takes the lock `name` in `dir`.
    pub fn acquire_in(dir: &Path, name: &str) -> Result<Self, Uac2Error> {
        let path = dir.join(format!("{name}.lock"));
        let file = open_locked(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::AlreadyExists {
                Uac2Error::DeviceBusy {
                    name: name.to_string(),
                }
            } else {
                Uac2Error::Lock(e)
            }
        })?;
        debug!(name, path = %path.display(), "device lock acquired");
        Ok(Self {
            name: name.to_string(),
            path,
            _file: file,
        })
    }

    /// The lock's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn open_locked(path: &Path) -> io::Result<File> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

#[cfg(not(unix))]
fn open_locked(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        // flock is released when the file closes
        #[cfg(not(unix))]
        let _ = std::fs::remove_file(&self.path);
        debug!(name = %self.name, "device lock released");
    }
}

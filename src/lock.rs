//! File-based locking mechanism to prevent multiple daemon instances.
//!
//! The lock is advisory: it only excludes processes that use [`InstanceLock`]
//! (or another `flock`-based lock) on the same path. The holder records its
//! process id in the file, so operators can see which process owns it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lifecycle state of an [`InstanceLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No descriptor is open
    Unopened,
    /// The file is open but not locked by this holder
    Open,
    /// The file is open and exclusively locked by this holder
    Locked,
}

/// File lock manager for ensuring single-instance daemon execution.
#[derive(Debug)]
pub struct InstanceLock {
    /// The lock file handle, opened lazily
    file: Option<File>,
    /// Absolute path to the lock file
    path: PathBuf,
    /// Whether this holder owns the exclusive lock
    locked: bool,
    /// Leave the file on disk when dropped
    keep_file: bool,
}

impl InstanceLock {
    /// Creates a new instance lock manager. Nothing is touched on disk yet.
    ///
    /// Relative paths are resolved against the current directory now, so a
    /// later working-directory change does not move the lock.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        Self {
            file: None,
            path,
            locked: false,
            keep_file: false,
        }
    }

    /// Path of the backing lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LockState {
        match (&self.file, self.locked) {
            (_, true) => LockState::Locked,
            (Some(_), false) => LockState::Open,
            (None, false) => LockState::Unopened,
        }
    }

    /// Checks whether another holder currently has the lock.
    ///
    /// The lock is probed without being kept. A holder asking about its own
    /// lock gets `false`. I/O failures are logged and reported as not locked.
    pub fn is_locked(&mut self) -> bool {
        if self.locked {
            return false;
        }

        let file = match self.open_file() {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Unable to probe lock file");
                return false;
            }
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                if let Err(e) = FileExt::unlock(file) {
                    warn!(error = %e, "Failed to release probe lock");
                }
                false
            }
            Err(e) if is_contended(&e) => true,
            Err(e) => {
                warn!(error = %e, "Unable to probe lock file");
                false
            }
        }
    }

    /// Acquires the lock, blocking until it becomes available, and records
    /// the current process id as the file's only content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, opened, locked or written.
    pub fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }

        let path = self.path.clone();
        self.open_file()?.lock_exclusive().map_err(|e| {
            Error::io_with_source(
                format!("Failed to acquire exclusive lock on {}", path.display()),
                e,
            )
        })?;
        self.locked = true;
        self.record_pid()
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Ok(false)` if another holder has it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, opened, locked or written.
    pub fn try_lock(&mut self) -> Result<bool> {
        if self.locked {
            return Ok(true);
        }

        let path = self.path.clone();
        match self.open_file()?.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(false),
            Err(e) => {
                return Err(Error::io_with_source(
                    format!("Failed to acquire exclusive lock on {}", path.display()),
                    e,
                ))
            }
        }
        self.locked = true;
        self.record_pid()?;
        Ok(true)
    }

    /// Releases the lock, clears the file's content and closes the descriptor.
    ///
    /// Calling this without holding the lock leaves the file untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, truncated or unlocked.
    pub fn unlock(&mut self) -> Result<()> {
        self.open_file()?;
        if !self.locked {
            debug!(path = %self.path.display(), "Unlock requested without holding the lock");
            return Ok(());
        }

        if let Some(file) = self.file.take() {
            self.locked = false;
            file.set_len(0).map_err(|e| {
                Error::io_with_source(
                    format!("Failed to clear lock file {}", self.path.display()),
                    e,
                )
            })?;
            FileExt::unlock(&file).map_err(|e| {
                Error::io_with_source(
                    format!("Failed to release lock on file {}", self.path.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Forgets the cached descriptor without touching the file.
    ///
    /// A forked child shares its parent's open file description, and `flock`
    /// locks belong to the description. The worker calls this right after
    /// forking so its lock cannot be probed away by the launcher.
    pub fn release_descriptor(&mut self) {
        self.file = None;
        self.locked = false;
    }

    /// Leaves the file in place when this holder is dropped.
    ///
    /// The launcher calls this once a worker exists: the worker may have
    /// opened the path without locking it yet, and unlinking it then would
    /// leave the worker locking an orphaned inode.
    pub fn keep_file(&mut self) {
        self.keep_file = true;
    }

    /// Reads the process id recorded in the lock file, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read_pid(&self) -> Result<Option<u32>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io_with_source(
                format!("Failed to read lock file {}", self.path.display()),
                e,
            )),
        }
    }

    fn open_file(&mut self) -> Result<&File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o644)
                .open(&self.path)
                .map_err(|e| {
                    Error::io_with_source(
                        format!("Failed to open or create lock file at {}", self.path.display()),
                        e,
                    )
                })?;
            self.file = Some(file);
        }
        self.file
            .as_ref()
            .ok_or_else(|| Error::io(format!("Lock file {} is not open", self.path.display())))
    }

    fn record_pid(&mut self) -> Result<()> {
        let written = self.file.as_ref().map_or_else(
            || Err(io::Error::from(io::ErrorKind::NotFound)),
            |mut file| {
                file.set_len(0)?;
                file.rewind()?;
                write!(file, "{}", std::process::id())?;
                file.sync_data()
            },
        );

        if let Err(e) = written {
            if let Some(file) = self.file.as_ref() {
                let _ = FileExt::unlock(file);
            }
            self.locked = false;
            return Err(Error::io_with_source(
                format!("Failed to record pid in lock file {}", self.path.display()),
                e,
            ));
        }

        debug!(path = %self.path.display(), pid = std::process::id(), "Instance lock acquired");
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if self.locked || self.keep_file {
            // Closing the descriptor is enough.
            return;
        }

        self.file = None;
        if held_elsewhere(&self.path) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed unused lock file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Probes an existing file without creating it. Unknown states count as held.
fn held_elsewhere(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

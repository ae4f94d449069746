//! # Lock — Cross-Process Work Item Ownership
//!
//! Grants exclusive, non-blocking ownership of a single work item so that at
//! most one worker factors a given number at a time. Backed by `flock(2)` on
//! one file per item inside a shared lock directory:
//!
//! - Acquisition is `LOCK_EX | LOCK_NB`: a held lock returns `Busy` at once.
//! - The kernel drops the lock when the descriptor closes, so a worker that
//!   exits or crashes never leaves an orphaned lock.
//! - Lock files are never deleted. Unlinking a file another process is about
//!   to lock would let two workers hold "the same" lock on different inodes.
//!
//! The key is the exact decimal string. Items up to 200 digits use it as the
//! file name directly; longer items use its SHA-256 so file-name limits never
//! apply.

use crate::{Error, Result, WorkItem};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Longest item whose decimal string is used verbatim as a lock file name.
const MAX_VERBATIM_KEY_LEN: usize = 200;

/// Result of a non-blocking acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    Acquired(LockToken),
    /// Another worker (possibly in another process) owns the item.
    Busy,
}

/// Live ownership of one work item. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    item: WorkItem,
    path: PathBuf,
    _file: File,
}

impl LockToken {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lock namespace rooted at one directory. Workers sharing the directory
/// (same host, or shared storage with working `flock`) exclude each other.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    /// Create the namespace directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| Error::Lock {
            path: dir.clone(),
            source,
        })?;
        Ok(LockManager { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file path for an item.
    pub fn lock_path(&self, item: &WorkItem) -> PathBuf {
        self.dir.join(lock_file_name(item.as_str()))
    }

    /// Try to take ownership of `item` without waiting.
    pub fn try_acquire(&self, item: &WorkItem) -> Result<Acquire> {
        let path = self.lock_path(item);
        let lock_err = |source| Error::Lock {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_err)?;

        if !try_flock_exclusive(&file).map_err(lock_err)? {
            info!(item = %item, "work item locked by another worker, skipping");
            return Ok(Acquire::Busy);
        }

        // Owner stamp for operators inspecting the lock directory.
        file.set_len(0).map_err(lock_err)?;
        writeln!(file, "{} {}", std::process::id(), item).map_err(lock_err)?;

        Ok(Acquire::Acquired(LockToken {
            item: item.clone(),
            path,
            _file: file,
        }))
    }
}

fn lock_file_name(key: &str) -> String {
    if key.len() <= MAX_VERBATIM_KEY_LEN {
        format!("{}.lock", key)
    } else {
        let digest = Sha256::digest(key.as_bytes());
        format!("sha256-{:x}.lock", digest)
    }
}

// ── flock helpers ───────────────────────────────────────────────

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if it is held
/// through another open file description, in this process or any other.
pub(crate) fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

/// Block until an exclusive flock is held on `file`.
pub(crate) fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        loop {
            // SAFETY: `file` owns a valid descriptor for the duration of the call.
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

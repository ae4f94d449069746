//! Counting admission gate for registry submissions.
//!
//! `N` slot files (`submit-slot-0.lock` .. `submit-slot-{N-1}.lock`) live in a
//! shared directory. A permit is an exclusive `flock` on any one of them, so at
//! most `N` submissions are in flight across every thread and every process
//! that points at the same directory. Permits are released when dropped, or by
//! the kernel if the holder dies. This throttles load on the registry; it is
//! not needed for correctness.

use crate::lock::try_flock_exclusive;
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    dir: PathBuf,
    slots: usize,
}

/// A held admission slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    slot: usize,
    _file: File,
}

impl AdmissionPermit {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl AdmissionGate {
    pub fn new(dir: impl Into<PathBuf>, slots: usize) -> Result<Self> {
        let dir = dir.into();
        if slots == 0 {
            return Err(Error::Config("admission gate needs at least one slot".into()));
        }
        std::fs::create_dir_all(&dir).map_err(|source| Error::Lock {
            path: dir.clone(),
            source,
        })?;
        Ok(AdmissionGate { dir, slots })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("submit-slot-{}.lock", slot))
    }

    /// Take any free slot without waiting.
    pub fn try_acquire(&self) -> Result<Option<AdmissionPermit>> {
        for slot in 0..self.slots {
            let path = self.slot_path(slot);
            let file = open_slot(&path)?;
            if try_flock_exclusive(&file).map_err(|source| Error::Lock {
                path: path.clone(),
                source,
            })? {
                return Ok(Some(AdmissionPermit { slot, _file: file }));
            }
        }
        Ok(None)
    }

    /// Wait until a slot is free.
    pub fn acquire(&self) -> Result<AdmissionPermit> {
        let started = Instant::now();
        loop {
            if let Some(permit) = self.try_acquire()? {
                let waited = started.elapsed();
                if waited >= POLL_INTERVAL {
                    debug!(slot = permit.slot, waited_ms = waited.as_millis() as u64, "admission granted");
                }
                return Ok(permit);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn open_slot(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| Error::Lock {
            path: path.to_path_buf(),
            source,
        })
}

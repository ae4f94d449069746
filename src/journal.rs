//! # Journal — Append-Only Submission Logs
//!
//! Two CSV-style journals record every factor that leaves the submission
//! pipeline:
//!
//! | Journal | Line format                              | Contents                 |
//! |---------|------------------------------------------|--------------------------|
//! | success | `"<ISO-8601 timestamp>",<number>,<factor>` | accepted / already known |
//! | failure | `<ISO-8601 timestamp>,<number>,<factor>`   | rejected (manual follow-up) |
//!
//! ## Concurrency
//!
//! Each append is one `write` of one complete line on an `O_APPEND`
//! descriptor while holding an exclusive `flock` on the journal, so
//! concurrent appenders (threads or processes) never interleave and a worker
//! killed mid-run leaves at most its final line unwritten.
//!
//! The failure journal can be claimed for replay by renaming it away. An
//! appender that was waiting on the lock of the renamed file notices the
//! inode change and reopens the path, so no record lands in a claimed file.

use crate::registry::SubmissionOutcome;
use crate::lock::{flock_exclusive, try_flock_exclusive};
use crate::{is_decimal, Error, Result, WorkItem};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    Success,
    Failure,
}

impl JournalKind {
    /// The journal a terminal outcome belongs in.
    pub fn for_outcome(outcome: &SubmissionOutcome) -> Self {
        match outcome {
            SubmissionOutcome::Accepted | SubmissionOutcome::AlreadyKnown => JournalKind::Success,
            SubmissionOutcome::Rejected(_) => JournalKind::Failure,
        }
    }
}

/// Terminal record for one submitted factor.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub timestamp: DateTime<Utc>,
    pub item: String,
    pub factor: String,
    pub outcome: SubmissionOutcome,
}

impl SubmissionRecord {
    pub fn new(item: &WorkItem, factor: &str, outcome: SubmissionOutcome) -> Self {
        SubmissionRecord {
            timestamp: Utc::now(),
            item: item.to_string(),
            factor: factor.to_string(),
            outcome,
        }
    }

    pub fn kind(&self) -> JournalKind {
        JournalKind::for_outcome(&self.outcome)
    }

    /// Journal line, including the trailing newline.
    pub fn to_line(&self) -> String {
        format_line(self.kind(), self.timestamp, &self.item, &self.factor)
    }
}

/// A line read back from a journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub item: WorkItem,
    pub factor: String,
}

pub fn format_line(kind: JournalKind, timestamp: DateTime<Utc>, item: &str, factor: &str) -> String {
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    match kind {
        JournalKind::Success => format!("\"{}\",{},{}\n", ts, item, factor),
        JournalKind::Failure => format!("{},{},{}\n", ts, item, factor),
    }
}

/// Parse one journal line; `None` if it is not a well-formed record.
pub fn parse_line(kind: JournalKind, line: &str) -> Option<JournalEntry> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, ',');
    let ts = parts.next()?;
    let item = parts.next()?;
    let factor = parts.next()?;
    let ts = match kind {
        JournalKind::Success => ts.strip_prefix('"')?.strip_suffix('"')?,
        JournalKind::Failure => ts,
    };
    let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let item = WorkItem::parse(item).ok()?;
    if !is_decimal(factor) {
        return None;
    }
    Some(JournalEntry {
        timestamp,
        item,
        factor: factor.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    kind: JournalKind,
}

impl Journal {
    /// Open (creating if needed) a journal and its parent directory.
    pub fn open(path: impl Into<PathBuf>, kind: JournalKind) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| Error::Journal {
                path: path.clone(),
                source,
            })?;
        }
        let journal = Journal { path, kind };
        journal.open_append().map_err(|source| journal.err(source))?;
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> JournalKind {
        self.kind
    }

    fn err(&self, source: std::io::Error) -> Error {
        Error::Journal {
            path: self.path.clone(),
            source,
        }
    }

    fn open_append(&self) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// Append one record as a single line.
    pub fn append(&self, record: &SubmissionRecord) -> Result<()> {
        let line = format_line(self.kind, record.timestamp, &record.item, &record.factor);
        self.append_raw(&line)
    }

    /// Append preformatted text (one or more complete lines) atomically.
    pub fn append_raw(&self, text: &str) -> Result<()> {
        loop {
            let mut file = self.open_append().map_err(|e| self.err(e))?;
            flock_exclusive(&file).map_err(|e| self.err(e))?;
            if !is_current(&file, &self.path).map_err(|e| self.err(e))? {
                continue;
            }
            file.write_all(text.as_bytes()).map_err(|e| self.err(e))?;
            file.sync_data().map_err(|e| self.err(e))?;
            return Ok(());
        }
    }

    /// Atomically move the current journal contents aside for replay.
    ///
    /// Returns the claimed file, or `None` if the journal is empty. New
    /// appends go to a fresh file at the original path.
    pub fn claim(&self) -> Result<Option<PathBuf>> {
        let file = self.open_append().map_err(|e| self.err(e))?;
        flock_exclusive(&file).map_err(|e| self.err(e))?;
        if file.metadata().map_err(|e| self.err(e))?.len() == 0 {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let claimed = replay_path(&self.path, &format!("{}-{}", std::process::id(), stamp));
        std::fs::rename(&self.path, &claimed).map_err(|e| self.err(e))?;
        Ok(Some(claimed))
    }

    /// Claimed files left behind by this or an earlier (possibly crashed) replay.
    pub fn pending_claims(&self) -> Result<Vec<PathBuf>> {
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(d) => d.to_path_buf(),
            None => PathBuf::from("."),
        };
        let prefix = replay_prefix(&self.path);
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| self.err(e))? {
            let entry = entry.map_err(|e| self.err(e))?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Take exclusive ownership of a claimed file for replay.
    ///
    /// `None` if another replay holds it or already finished and removed it.
    /// The returned handle keeps the claim until dropped.
    pub fn lock_claim(&self, claimed: &Path) -> Result<Option<File>> {
        let err = |source| Error::Journal {
            path: claimed.to_path_buf(),
            source,
        };
        let file = match OpenOptions::new().read(true).open(claimed) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(err(e)),
        };
        if !try_flock_exclusive(&file).map_err(err)? || !claimed.exists() {
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Remove a fully replayed claim file.
    pub fn finish_claim(&self, claimed: &Path) -> Result<()> {
        std::fs::remove_file(claimed).map_err(|source| Error::Journal {
            path: claimed.to_path_buf(),
            source,
        })
    }

    /// Read every line of a journal-format file.
    ///
    /// Returns `(parsed, unparseable)`; unparseable lines are returned verbatim.
    pub fn read_file(&self, path: &Path) -> Result<(Vec<JournalEntry>, Vec<String>)> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Journal {
            path: path.to_path_buf(),
            source,
        })?;
        let mut parsed = Vec::new();
        let mut bad = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match parse_line(self.kind, line) {
                Some(entry) => parsed.push(entry),
                None => bad.push(line.to_string()),
            }
        }
        Ok((parsed, bad))
    }
}

fn replay_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}.replay-", name)
}

fn replay_path(path: &Path, suffix: &str) -> PathBuf {
    path.with_file_name(format!("{}{}", replay_prefix(path), suffix))
}

/// True if `file` is still the inode at `path`.
fn is_current(file: &File, path: &Path) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let open = file.metadata()?;
        match std::fs::metadata(path) {
            Ok(on_disk) => Ok(open.dev() == on_disk.dev() && open.ino() == on_disk.ino()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (file, path);
        Ok(true)
    }
}

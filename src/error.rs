//! Error taxonomy for the worker.
//!
//! Only the environment class (`EngineMissing`, `EngineSpawn`) is fatal to a
//! batch; every other variant is contained at the item or factor that raised
//! it. Normal control-flow outcomes (a busy lock, an engine that exits
//! nonzero, a rejected submission) are values, not errors.

use std::io;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("engine '{engine}' binary not found: {program}")]
    EngineMissing { engine: String, program: String },

    #[error("failed to start engine '{engine}': {source}")]
    EngineSpawn {
        engine: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid work item {input:?}: {reason}")]
    InvalidWorkItem { input: String, reason: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock namespace {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("journal {path}: {source}")]
    Journal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Environment failures end the whole batch; everything else is per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EngineMissing { .. } | Error::EngineSpawn { .. })
    }
}

//! Harness-level errors and their CLI exit codes.

use std::path::PathBuf;

use thiserror::Error;
use warden_runtime::{SpawnError, WriteError};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("spawn: {0}")]
    Spawn(#[from] SpawnError),
    #[error("stdin: {0}")]
    Stdin(#[from] WriteError),
    #[error("{} is not an ELF shared object", .0.display())]
    NotSharedObject(PathBuf),
    #[error("{invalid} of {lines} log lines failed validation")]
    InvalidLog { lines: usize, invalid: usize },
    #[error("no command given")]
    EmptyCommand,
}

impl HarnessError {
    /// Process exit code the CLI reports for this error.
    ///
    /// 1 is reserved for "ran fine, tests failed"; usage errors are clap's 2.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::NotSharedObject(_) | Self::InvalidLog { .. } => 3,
            Self::Spawn(_) | Self::Stdin(_) | Self::EmptyCommand => 4,
            Self::Io(_) | Self::Json(_) => 5,
        }
    }
}

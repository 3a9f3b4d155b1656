//! Errors returned by [`ProcessHandle`](crate::ProcessHandle) operations.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command has no arguments")]
    CommandMissing,
    #[error("process is already running; close the handle before spawning again")]
    AlreadyRunning,
    #[error("spawn failed: {0}")]
    SpawnFailed(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("process is not running")]
    NotRunning,
    #[error("child stdin is not a pipe or was already closed")]
    StdinClosed,
    #[error("timed out after writing {written} bytes to stdin")]
    Timeout { written: usize },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("process is not running")]
    NotRunning,
    #[error("timed out waiting for process exit")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum KillError {
    #[error("process is not running")]
    NotRunning,
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
    #[error("permission denied: {0}")]
    PermissionDenied(#[source] io::Error),
}

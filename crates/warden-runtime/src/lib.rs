//! # warden-runtime
//!
//! The moving parts of the warden test-process runtime:
//!
//! - [`event_loop`]: the pluggable cooperative [`EventLoop`] trait and its
//!   `poll(2)` backend, [`PollLoop`]
//! - [`process`]: [`ProcessSupervisor`] and [`ProcessHandle`], which spawn a
//!   [`Command`](warden_core::Command), capture its output asynchronously and
//!   guarantee the child is reaped
//! - [`config`]: tunables, optionally read from the environment
//!
//! Everything here is single-threaded per loop: handles and loops are `!Send`.
//! Run independent loops on separate threads for parallelism.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod poll_loop;
pub mod process;
mod sys;

pub use config::SupervisorConfig;
pub use error::{KillError, SpawnError, WaitError, WriteError};
pub use event_loop::{
    ChildCallback, EventLoop, IdleCallback, IoCallback, IoCondition, PRIORITY_DEFAULT,
    PRIORITY_DEFAULT_IDLE, PRIORITY_HIGH, PRIORITY_HIGH_IDLE, PRIORITY_LOW, Priority,
    TimerCallback, WatchId,
};
pub use poll_loop::PollLoop;
pub use process::{
    OutputStream, ProcessEvent, ProcessHandle, ProcessState, ProcessSupervisor,
};

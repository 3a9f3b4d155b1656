//! # warden-core
//!
//! Safe building blocks shared by the warden test-process runtime:
//!
//! - [`elf`]: best-effort ELF shared-object probe and dynamic function-symbol scanner
//! - [`command`]: the immutable-at-spawn command description (argv, env overrides, flags)
//! - [`process`]: wait-status decoding and signal validation
//! - [`log`]: the `log(level, message)` interface consumed by the runtime
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod command;
pub mod elf;
pub mod log;
pub mod process;

pub use command::{Command, EnvOverrides, SpawnFlags};
pub use elf::{is_shared_object, scan_function_symbols};
pub use log::{LogLevel, Logger, MemoryLogger, NullLogger};
pub use process::ExitStatus;

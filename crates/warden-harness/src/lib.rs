//! Harness tooling for the warden runtime.
//!
//! This crate provides:
//! - Structured logging: canonical JSONL records, trace ids, validators and
//!   SHA-256 artifact indexes
//! - Isolated runs: spawn one test binary, feed stdin, collect its output and
//!   classify the result under a deadline
//! - The `warden-harness` CLI (`scan`, `probe`, `run`, `validate-log`)

#![forbid(unsafe_code)]

pub mod error;
pub mod runner;
pub mod structured_log;

pub use error::HarnessError;
pub use runner::{IsolatedRun, RunReport};
pub use structured_log::{EmitterLogger, LogEmitter, LogEntry, Outcome};

//! Isolated test execution.
//!
//! One [`IsolatedRun`] drives a single child through its own loop:
//! spawn, optional stdin payload, close stdin, wait under a deadline, then
//! dispose. Whatever the child printed is captured per stream.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_core::{Command, ExitStatus, LogLevel, Logger, NullLogger};
use warden_runtime::{
    PollLoop, ProcessEvent, ProcessSupervisor, SupervisorConfig, WaitError, WriteError,
};

use crate::error::HarnessError;
use crate::structured_log::{self, LogEntry, Outcome};

/// Deadline used when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What one isolated run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub command: String,
    pub outcome: Outcome,
    pub pid: Option<i32>,
    /// `None` when the child had to be disposed before it was reaped.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Stream read failures and stdin delivery problems, in order.
    pub io_errors: Vec<String>,
    pub duration: Duration,
}

impl RunReport {
    /// Summary record; the trace id is left for the emitter to assign.
    #[must_use]
    pub fn log_entry(&self) -> LogEntry {
        let level = match self.outcome {
            Outcome::Pass => structured_log::LogLevel::Info,
            Outcome::Fail | Outcome::Timeout => structured_log::LogLevel::Warn,
            Outcome::Error => structured_log::LogLevel::Error,
        };
        let mut entry = LogEntry::new(String::new(), level, "run_complete")
            .with_outcome(self.outcome)
            .with_bytes((self.stdout.len() + self.stderr.len()) as u64)
            .with_duration_ms(u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX))
            .with_details(serde_json::json!({
                "command": self.command,
                "stdout_bytes": self.stdout.len(),
                "stderr_bytes": self.stderr.len(),
                "io_errors": self.io_errors,
            }));
        if let Some(pid) = self.pid {
            entry = entry.with_pid(pid);
        }
        if let Some(status) = self.status {
            entry = entry.with_exit_status(status);
        }
        entry
    }
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    io_errors: Vec<String>,
}

/// Runs one command in isolation and classifies the result.
pub struct IsolatedRun {
    command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    config: SupervisorConfig,
    logger: Arc<dyn Logger>,
}

impl IsolatedRun {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
            config: SupervisorConfig::default(),
            logger: Arc::new(NullLogger),
        }
    }

    /// Bytes written to the child's stdin before it is closed.
    #[must_use]
    pub fn with_stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Run the command to completion or until the deadline.
    ///
    /// # Errors
    ///
    /// Fails only when the child cannot be started or stdin delivery fails
    /// for a reason other than the child going away. Everything that happens
    /// after a successful spawn is reported through [`RunReport::outcome`].
    /// The timeout covers stdin delivery as well as the wait for exit.
    pub fn run(&self) -> Result<RunReport, HarnessError> {
        let event_loop =
            PollLoop::with_child_poll_interval(self.config.child_poll_interval).shared();
        let supervisor = ProcessSupervisor::new(event_loop, Arc::clone(&self.logger), self.config);
        let handle = supervisor.handle();

        let captured = Rc::new(RefCell::new(Captured::default()));
        let sink = Rc::clone(&captured);
        handle.subscribe(move |event| {
            let mut sink = sink.borrow_mut();
            match event {
                ProcessEvent::OutputReceived(chunk) => sink.stdout.extend_from_slice(chunk),
                ProcessEvent::ErrorReceived(chunk) => sink.stderr.extend_from_slice(chunk),
                ProcessEvent::IoError { stream, error } => {
                    sink.io_errors.push(format!("{stream}: {error}"));
                }
                ProcessEvent::Reaped(_) => {}
            }
        });

        let started = Instant::now();
        handle.spawn(&self.command)?;
        let pid = handle.pid();

        // Stdin delivery and the wait share one deadline.
        let mut timed_out = false;
        if let Some(payload) = &self.stdin {
            match handle.write_timeout(payload, self.timeout) {
                Ok(_) => {}
                // The child may legitimately exit without reading its input.
                Err(WriteError::NotRunning) => {}
                Err(WriteError::Timeout { written }) => {
                    captured.borrow_mut().io_errors.push(format!(
                        "stdin: {written} of {} bytes delivered before the deadline",
                        payload.len()
                    ));
                    timed_out = true;
                }
                Err(WriteError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                    captured.borrow_mut().io_errors.push(format!("stdin: {e}"));
                }
                Err(e) => {
                    handle.dispose();
                    return Err(e.into());
                }
            }
        }
        handle.close_stdin();

        let waited = if timed_out {
            Err(WaitError::Timeout)
        } else {
            handle.wait(self.timeout.saturating_sub(started.elapsed()))
        };
        if matches!(waited, Err(WaitError::Timeout)) {
            self.logger.log(
                LogLevel::Warn,
                &format!(
                    "{} exceeded {}ms; disposing",
                    self.command.display(),
                    self.timeout.as_millis()
                ),
            );
        }
        handle.dispose();
        let duration = started.elapsed();

        let captured = captured.take();
        let outcome = classify(&waited, &captured.io_errors);
        Ok(RunReport {
            command: self.command.display(),
            outcome,
            pid,
            status: waited.ok(),
            stdout: captured.stdout,
            stderr: captured.stderr,
            io_errors: captured.io_errors,
            duration,
        })
    }
}

fn classify(waited: &Result<ExitStatus, WaitError>, io_errors: &[String]) -> Outcome {
    match waited {
        Err(WaitError::Timeout) => Outcome::Timeout,
        Err(WaitError::NotRunning) | Ok(ExitStatus::Unknown) => Outcome::Error,
        Ok(_) if io_errors.iter().any(|e| !e.starts_with("stdin:")) => Outcome::Error,
        Ok(status) if status.success() => Outcome::Pass,
        Ok(_) => Outcome::Fail,
    }
}

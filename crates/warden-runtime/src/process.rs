//! External-process supervision.
//!
//! A [`ProcessHandle`] owns at most one live child at a time. Spawning wires
//! the child's stdio to non-blocking pipes and registers watches on the shared
//! [`EventLoop`]: one I/O watch per captured output stream and one child-exit
//! watch. Output arrives as [`ProcessEvent`]s, delivered to subscribers or
//! queued for [`ProcessHandle::drain_events`].
//!
//! Lifecycle per spawn generation:
//!
//! ```text
//! NotStarted -> Running -> Reaped -> Closed
//!                  \__________________/
//!                        close()
//! ```
//!
//! Every path that stops tracking a child (reap, `close`, `dispose`, drop)
//! leaves the pid with the loop's reaper, so a child never lingers as a zombie
//! while the loop runs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use warden_core::process::{SIGKILL, SIGTERM, valid_signal};
use warden_core::{Command, ExitStatus, LogLevel, Logger, NullLogger, SpawnFlags};

use crate::config::SupervisorConfig;
use crate::error::{KillError, SpawnError, WaitError, WriteError};
use crate::event_loop::{EventLoop, IoCondition, PRIORITY_DEFAULT, WatchId};
use crate::sys;

/// How long `dispose()` pumps the loop for the reap after SIGKILL.
const KILL_REAP_WAIT: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    NotStarted,
    Running,
    Reaped,
    Closed,
}

impl ProcessState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Reaped => "reaped",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured output stream of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn chunk(self, bytes: Vec<u8>) -> ProcessEvent {
        match self {
            Self::Stdout => ProcessEvent::OutputReceived(bytes),
            Self::Stderr => ProcessEvent::ErrorReceived(bytes),
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a supervised child.
///
/// Chunks keep their order within a stream. `Reaped` is emitted exactly once
/// per spawn generation.
#[derive(Debug)]
pub enum ProcessEvent {
    OutputReceived(Vec<u8>),
    ErrorReceived(Vec<u8>),
    Reaped(ExitStatus),
    IoError {
        stream: OutputStream,
        error: io::Error,
    },
}

type Subscriber = Box<dyn FnMut(&ProcessEvent)>;

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Factory for [`ProcessHandle`]s bound to one loop, logger and config.
#[derive(Clone)]
pub struct ProcessSupervisor {
    event_loop: Rc<dyn EventLoop>,
    logger: Arc<dyn Logger>,
    config: SupervisorConfig,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(
        event_loop: Rc<dyn EventLoop>,
        logger: Arc<dyn Logger>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            event_loop,
            logger,
            config,
        }
    }

    /// Supervisor with a [`NullLogger`] and default configuration.
    pub fn with_defaults(event_loop: Rc<dyn EventLoop>) -> Self {
        Self::new(event_loop, Arc::new(NullLogger), SupervisorConfig::default())
    }

    /// A fresh handle in the `NotStarted` state.
    #[must_use]
    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            inner: Rc::new(RefCell::new(Inner::default())),
            event_loop: Rc::clone(&self.event_loop),
            logger: Arc::clone(&self.logger),
            config: self.config,
        }
    }

    #[must_use]
    pub fn event_loop(&self) -> &Rc<dyn EventLoop> {
        &self.event_loop
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Handle state
// ---------------------------------------------------------------------------

struct Pipe {
    fd: OwnedFd,
    watch: Option<WatchId>,
}

struct Inner {
    state: ProcessState,
    generation: u64,
    pid: Option<i32>,
    /// `pid`, or `-pid` when the child leads its own process group.
    signal_target: i32,
    exit_status: Option<ExitStatus>,
    command: Option<Command>,
    stdin: Option<OwnedFd>,
    stdout: Option<Pipe>,
    stderr: Option<Pipe>,
    child_watch: Option<WatchId>,
    queue: VecDeque<ProcessEvent>,
    outbox: VecDeque<ProcessEvent>,
    subscribers: Vec<Subscriber>,
    emitting: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: ProcessState::NotStarted,
            generation: 0,
            pid: None,
            signal_target: 0,
            exit_status: None,
            command: None,
            stdin: None,
            stdout: None,
            stderr: None,
            child_watch: None,
            queue: VecDeque::new(),
            outbox: VecDeque::new(),
            subscribers: Vec::new(),
            emitting: false,
        }
    }
}

impl Inner {
    fn pipe(&self, stream: OutputStream) -> Option<&Pipe> {
        match stream {
            OutputStream::Stdout => self.stdout.as_ref(),
            OutputStream::Stderr => self.stderr.as_ref(),
        }
    }

    fn pipe_slot(&mut self, stream: OutputStream) -> &mut Option<Pipe> {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

/// Deliver `event` to subscribers, or queue it when nobody subscribed.
///
/// Events raised while subscribers are running (a subscriber that pumps the
/// loop, say) are appended to the outbox and delivered in order by the
/// outermost call.
fn emit(inner: &RefCell<Inner>, event: ProcessEvent) {
    let mut state = inner.borrow_mut();
    state.outbox.push_back(event);
    if state.emitting {
        return;
    }
    state.emitting = true;
    while let Some(event) = state.outbox.pop_front() {
        if state.subscribers.is_empty() {
            state.queue.push_back(event);
            continue;
        }
        let mut subscribers = std::mem::take(&mut state.subscribers);
        drop(state);
        for subscriber in &mut subscribers {
            subscriber(&event);
        }
        state = inner.borrow_mut();
        subscribers.append(&mut state.subscribers);
        state.subscribers = subscribers;
    }
    state.emitting = false;
}

/// Close `stream`'s pipe and drop its watch.
fn release_stream(
    inner: &RefCell<Inner>,
    stream: OutputStream,
    event_loop: Option<&dyn EventLoop>,
) {
    let pipe = inner.borrow_mut().pipe_slot(stream).take();
    if let Some(pipe) = pipe {
        if let (Some(id), Some(lp)) = (pipe.watch, event_loop) {
            lp.remove(id);
        }
        drop(pipe.fd);
    }
}

/// Read `stream` until EOF, `EAGAIN` or an error, emitting each chunk.
///
/// `Break` means the stream is finished and its pipe released.
fn drain_stream(
    inner: &RefCell<Inner>,
    stream: OutputStream,
    generation: u64,
    chunk_size: usize,
    logger: &dyn Logger,
    event_loop: Option<&dyn EventLoop>,
) -> ControlFlow<()> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let result = {
            let state = inner.borrow();
            if state.generation != generation {
                return ControlFlow::Break(());
            }
            let Some(pipe) = state.pipe(stream) else {
                return ControlFlow::Break(());
            };
            sys::read(pipe.fd.as_raw_fd(), &mut buf)
        };
        match result {
            Ok(0) => {
                logger.log(LogLevel::Trace, &format!("{stream}: eof"));
                release_stream(inner, stream, event_loop);
                return ControlFlow::Break(());
            }
            Ok(n) => emit(inner, stream.chunk(buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ControlFlow::Continue(()),
            Err(error) => {
                logger.log(LogLevel::Warn, &format!("{stream}: read failed: {error}"));
                release_stream(inner, stream, event_loop);
                emit(inner, ProcessEvent::IoError { stream, error });
                return ControlFlow::Break(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// One supervised child at a time. Not `Send`; dropping it disposes the child.
pub struct ProcessHandle {
    inner: Rc<RefCell<Inner>>,
    event_loop: Rc<dyn EventLoop>,
    logger: Arc<dyn Logger>,
    config: SupervisorConfig,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ProcessHandle")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("pid", &inner.pid)
            .field("exit_status", &inner.exit_status)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.inner.borrow().state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Pid of the current (or most recent) child.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        self.inner.borrow().pid
    }

    /// Exit status once the current generation has been reaped.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.borrow().exit_status
    }

    /// Number of successful spawns so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.borrow().generation
    }

    /// The command snapshot taken by the last successful spawn.
    #[must_use]
    pub fn command(&self) -> Option<Command> {
        self.inner.borrow().command.clone()
    }

    /// Receive every future event. Once any subscriber exists, events are no
    /// longer queued for [`drain_events`](Self::drain_events).
    pub fn subscribe(&self, subscriber: impl FnMut(&ProcessEvent) + 'static) {
        self.inner.borrow_mut().subscribers.push(Box::new(subscriber));
    }

    /// Take every queued event, oldest first.
    pub fn drain_events(&self) -> Vec<ProcessEvent> {
        self.inner.borrow_mut().queue.drain(..).collect()
    }

    // -- spawn --------------------------------------------------------------

    /// Start `command`. The command is snapshotted; later edits by the caller
    /// do not affect the child.
    pub fn spawn(&self, command: &Command) -> Result<(), SpawnError> {
        let Some(program) = command.program() else {
            return Err(SpawnError::CommandMissing);
        };
        if matches!(self.state(), ProcessState::Running | ProcessState::Reaped) {
            return Err(SpawnError::AlreadyRunning);
        }

        let snapshot = command.clone();
        let flags = snapshot.get_flags();

        let mut os = std::process::Command::new(resolve_program(
            program,
            flags,
            snapshot.get_current_dir(),
        ));
        os.args(&snapshot.get_args()[1..])
            .env_clear()
            .envs(snapshot.effective_environment(inherited_environment()))
            .stdin(stdin_mode(flags))
            .stdout(output_mode(flags, SpawnFlags::STDOUT_TO_DEV_NULL))
            .stderr(output_mode(flags, SpawnFlags::STDERR_TO_DEV_NULL));
        if let Some(dir) = snapshot.get_current_dir() {
            os.current_dir(dir);
        }
        let new_group = flags.contains(SpawnFlags::NEW_PROCESS_GROUP);
        if new_group {
            os.process_group(0);
        }

        let mut child = os.spawn().map_err(|e| {
            self.logger.log(
                LogLevel::Warn,
                &format!("spawn `{}` failed: {e}", snapshot.display()),
            );
            SpawnError::SpawnFailed(e)
        })?;
        let pid = child.id() as i32;
        let stdin = child.stdin.take().map(OwnedFd::from);
        let stdout = child.stdout.take().map(OwnedFd::from);
        let stderr = child.stderr.take().map(OwnedFd::from);
        // `Child` neither kills nor reaps on drop; the loop does the reaping.
        drop(child);

        for fd in [&stdin, &stdout, &stderr].into_iter().flatten() {
            if let Err(e) = sys::set_nonblocking(fd.as_raw_fd()) {
                self.logger.log(
                    LogLevel::Warn,
                    &format!("pid {pid}: cannot make pipe non-blocking: {e}"),
                );
            }
        }

        let generation = {
            let mut inner = self.inner.borrow_mut();
            inner.generation += 1;
            inner.state = ProcessState::Running;
            inner.pid = Some(pid);
            inner.signal_target = if new_group { -pid } else { pid };
            inner.exit_status = None;
            inner.stdin = stdin;
            inner.generation
        };

        let stdout = stdout.map(|fd| Pipe {
            watch: Some(self.watch_stream(fd.as_raw_fd(), OutputStream::Stdout, generation)),
            fd,
        });
        let stderr = stderr.map(|fd| Pipe {
            watch: Some(self.watch_stream(fd.as_raw_fd(), OutputStream::Stderr, generation)),
            fd,
        });
        let child_watch = self.event_loop.watch_child_exit(
            pid,
            PRIORITY_DEFAULT,
            self.reap_callback(generation),
        );

        self.logger.log(
            LogLevel::Debug,
            &format!(
                "spawned pid {pid} (generation {generation}): {}",
                snapshot.display()
            ),
        );

        let mut inner = self.inner.borrow_mut();
        inner.stdout = stdout;
        inner.stderr = stderr;
        inner.child_watch = Some(child_watch);
        inner.command = Some(snapshot);
        Ok(())
    }

    fn watch_stream(&self, fd: RawFd, stream: OutputStream, generation: u64) -> WatchId {
        let inner = Rc::downgrade(&self.inner);
        let event_loop = Rc::downgrade(&self.event_loop);
        let logger = Arc::clone(&self.logger);
        let chunk_size = self.config.read_chunk_size;
        self.event_loop.watch_io(
            fd,
            IoCondition::READABLE,
            Box::new(move |_condition| {
                let Some(inner) = inner.upgrade() else {
                    return ControlFlow::Break(());
                };
                let event_loop = event_loop.upgrade();
                drain_stream(
                    &inner,
                    stream,
                    generation,
                    chunk_size,
                    logger.as_ref(),
                    event_loop.as_deref(),
                )
            }),
        )
    }

    fn reap_callback(&self, generation: u64) -> Box<dyn FnOnce(i32, ExitStatus)> {
        let inner: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        let event_loop = Rc::downgrade(&self.event_loop);
        let logger = Arc::clone(&self.logger);
        let chunk_size = self.config.read_chunk_size;
        Box::new(move |pid, status| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.borrow().generation != generation {
                logger.log(
                    LogLevel::Debug,
                    &format!("pid {pid}: stale exit notification ignored"),
                );
                return;
            }

            // Output written just before exit is delivered ahead of `Reaped`.
            let event_loop = event_loop.upgrade();
            for stream in [OutputStream::Stdout, OutputStream::Stderr] {
                let _ = drain_stream(
                    &inner,
                    stream,
                    generation,
                    chunk_size,
                    logger.as_ref(),
                    event_loop.as_deref(),
                );
            }

            {
                let mut state = inner.borrow_mut();
                if state.generation != generation || state.state != ProcessState::Running {
                    return;
                }
                state.state = ProcessState::Reaped;
                state.exit_status = Some(status);
                state.child_watch = None;
            }
            logger.log(LogLevel::Debug, &format!("pid {pid} reaped: {status}"));
            emit(&inner, ProcessEvent::Reaped(status));
        })
    }

    // -- stdin --------------------------------------------------------------

    fn stdin_fd(&self) -> Result<RawFd, WriteError> {
        let inner = self.inner.borrow();
        if inner.state != ProcessState::Running {
            return Err(WriteError::NotRunning);
        }
        inner
            .stdin
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(WriteError::StdinClosed)
    }

    /// Write all of `bytes` to the child's stdin.
    ///
    /// When the pipe is full the loop is pumped until it drains, so the
    /// child's own output keeps flowing meanwhile. A child that never reads
    /// its input blocks this call for as long as it lives; use
    /// [`write_timeout`](Self::write_timeout) to bound it.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, WriteError> {
        self.write_until(bytes, None)
    }

    /// Like [`write`](Self::write), but gives up with
    /// [`WriteError::Timeout`] once `timeout` elapses. The child keeps
    /// running and keeps whatever was already written.
    pub fn write_timeout(&self, bytes: &[u8], timeout: Duration) -> Result<usize, WriteError> {
        let expired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&expired);
        let timer = self.event_loop.add_timeout(
            timeout,
            PRIORITY_DEFAULT,
            Box::new(move || {
                flag.set(true);
                ControlFlow::Break(())
            }),
        );
        let result = self.write_until(bytes, Some(expired.as_ref()));
        self.event_loop.remove(timer);
        result
    }

    fn write_until(
        &self,
        bytes: &[u8],
        expired: Option<&Cell<bool>>,
    ) -> Result<usize, WriteError> {
        let mut fd = self.stdin_fd()?;
        let mut written = 0;
        while written < bytes.len() {
            match sys::write(fd, &bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_writable(fd, expired, written)?;
                    fd = self.stdin_fd()?;
                }
                Err(e) => {
                    self.logger
                        .log(LogLevel::Warn, &format!("stdin write failed: {e}"));
                    return Err(WriteError::Io(e));
                }
            }
        }
        Ok(written)
    }

    fn wait_writable(
        &self,
        fd: RawFd,
        expired: Option<&Cell<bool>>,
        written: usize,
    ) -> Result<(), WriteError> {
        let ready = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ready);
        let watch = self.event_loop.watch_io(
            fd,
            IoCondition::WRITABLE,
            Box::new(move |_| {
                flag.set(true);
                ControlFlow::Break(())
            }),
        );
        while !ready.get() {
            let stop = match self.stdin_fd() {
                Err(e) => Some(e),
                Ok(_) if expired.is_some_and(Cell::get) => {
                    self.logger.log(
                        LogLevel::Debug,
                        &format!("stdin write timed out after {written} bytes"),
                    );
                    Some(WriteError::Timeout { written })
                }
                Ok(_) => None,
            };
            if let Some(e) = stop {
                self.event_loop.remove(watch);
                return Err(e);
            }
            self.event_loop.iterate(true);
        }
        Ok(())
    }

    /// Close the child's stdin, signalling end of input. Idempotent.
    pub fn close_stdin(&self) {
        let stdin = self.inner.borrow_mut().stdin.take();
        drop(stdin);
    }

    // -- wait / kill --------------------------------------------------------

    /// Pump the loop until the child is reaped or `timeout` elapses.
    ///
    /// On timeout the child keeps running and the handle stays `Running`.
    pub fn wait(&self, timeout: Duration) -> Result<ExitStatus, WaitError> {
        match self.state() {
            ProcessState::Reaped => return self.exit_status().ok_or(WaitError::NotRunning),
            ProcessState::NotStarted | ProcessState::Closed => return Err(WaitError::NotRunning),
            ProcessState::Running => {}
        }

        let expired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&expired);
        let timer = self.event_loop.add_timeout(
            timeout,
            PRIORITY_DEFAULT,
            Box::new(move || {
                flag.set(true);
                ControlFlow::Break(())
            }),
        );

        let result = loop {
            match self.state() {
                ProcessState::Reaped => break self.exit_status().ok_or(WaitError::NotRunning),
                ProcessState::Running => {}
                ProcessState::NotStarted | ProcessState::Closed => {
                    break Err(WaitError::NotRunning);
                }
            }
            if expired.get() {
                break Err(WaitError::Timeout);
            }
            self.event_loop.iterate(true);
        };

        self.event_loop.remove(timer);
        result
    }

    /// Send `signal` to the child (to its process group when spawned with
    /// `NEW_PROCESS_GROUP`). A child that already exited but is not yet
    /// reaped counts as signalled.
    pub fn kill(&self, signal: i32) -> Result<(), KillError> {
        let target = {
            let inner = self.inner.borrow();
            if inner.state != ProcessState::Running {
                return Err(KillError::NotRunning);
            }
            inner.signal_target
        };
        if !valid_signal(signal) {
            return Err(KillError::InvalidSignal(signal));
        }
        match sys::send_signal(target, signal) {
            Ok(()) => Ok(()),
            Err(e) => match e.raw_os_error() {
                Some(libc::ESRCH) => Ok(()),
                Some(libc::EINVAL) => Err(KillError::InvalidSignal(signal)),
                _ => Err(KillError::PermissionDenied(e)),
            },
        }
    }

    // -- teardown -----------------------------------------------------------

    /// Release pipes and watches without killing the child. Idempotent.
    ///
    /// A child that is still running is handed to a detached reap-only watch.
    pub fn close(&self) {
        let (running, pid, watches, fds) = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, ProcessState::Closed | ProcessState::NotStarted) {
                return;
            }
            let running = inner.state == ProcessState::Running;
            inner.state = ProcessState::Closed;

            let mut watches = Vec::new();
            let mut fds = Vec::new();
            for pipe in [inner.stdout.take(), inner.stderr.take()]
                .into_iter()
                .flatten()
            {
                watches.extend(pipe.watch);
                fds.push(pipe.fd);
            }
            watches.extend(inner.child_watch.take());
            fds.extend(inner.stdin.take());
            (running, inner.pid, watches, fds)
        };

        for id in watches {
            self.event_loop.remove(id);
        }
        drop(fds);

        if running && let Some(pid) = pid {
            let logger = Arc::clone(&self.logger);
            self.event_loop.watch_child_exit(
                pid,
                PRIORITY_DEFAULT,
                Box::new(move |pid, status| {
                    logger.log(
                        LogLevel::Debug,
                        &format!("detached pid {pid} reaped: {status}"),
                    );
                }),
            );
        }
    }

    /// Terminate and release the child: SIGTERM, up to `dispose_grace` for it
    /// to exit, then SIGKILL, then [`close`](Self::close). Never fails and
    /// always returns in bounded time.
    pub fn dispose(&self) {
        if self.is_running() {
            let grace = self.config.dispose_grace;
            if let Err(e) = self.kill(SIGTERM) {
                self.logger
                    .log(LogLevel::Debug, &format!("dispose: SIGTERM not sent: {e}"));
            }
            if self.wait(grace).is_err() && self.is_running() {
                self.logger.log(
                    LogLevel::Warn,
                    &format!(
                        "pid {} still running {}ms after SIGTERM; sending SIGKILL",
                        self.pid().unwrap_or(0),
                        grace.as_millis()
                    ),
                );
                if let Err(e) = self.kill(SIGKILL) {
                    self.logger
                        .log(LogLevel::Warn, &format!("dispose: SIGKILL failed: {e}"));
                }
                let _ = self.wait(KILL_REAP_WAIT);
            }
        }
        self.close();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // A panic unwinding through a borrow leaves nothing safe to do.
        if self.inner.try_borrow_mut().is_err() {
            return;
        }
        self.dispose();
    }
}

// ---------------------------------------------------------------------------
// Spawn helpers
// ---------------------------------------------------------------------------

/// Without `SEARCH_PATH` a bare name means a file in the working directory,
/// never a `PATH` lookup.
fn resolve_program(program: &str, flags: SpawnFlags, cwd: Option<&Path>) -> PathBuf {
    let path = Path::new(program);
    if program.contains('/') {
        return match cwd {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
    }
    if flags.contains(SpawnFlags::SEARCH_PATH) {
        return path.to_path_buf();
    }
    cwd.unwrap_or_else(|| Path::new(".")).join(path)
}

fn stdin_mode(flags: SpawnFlags) -> Stdio {
    if flags.contains(SpawnFlags::CHILD_INHERITS_STDIN) {
        Stdio::inherit()
    } else if flags.contains(SpawnFlags::STDIN_FROM_DEV_NULL) {
        Stdio::null()
    } else {
        Stdio::piped()
    }
}

fn output_mode(flags: SpawnFlags, to_dev_null: u32) -> Stdio {
    if flags.contains(to_dev_null) {
        Stdio::null()
    } else {
        Stdio::piped()
    }
}

/// The parent's environment, minus entries that are not valid UTF-8.
fn inherited_environment() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll_loop::PollLoop;

    #[test]
    fn bare_names_stay_local_without_search_path() {
        let flags = SpawnFlags::empty();
        assert_eq!(resolve_program("prog", flags, None), PathBuf::from("./prog"));
        assert_eq!(
            resolve_program("prog", flags, Some(Path::new("/opt/t"))),
            PathBuf::from("/opt/t/prog")
        );
        assert_eq!(
            resolve_program(
                "prog",
                SpawnFlags(SpawnFlags::SEARCH_PATH),
                Some(Path::new("/opt/t"))
            ),
            PathBuf::from("prog")
        );
    }

    #[test]
    fn paths_with_separators_are_not_searched() {
        let flags = SpawnFlags(SpawnFlags::SEARCH_PATH);
        assert_eq!(resolve_program("/bin/true", flags, None), PathBuf::from("/bin/true"));
        assert_eq!(
            resolve_program("bin/t", flags, Some(Path::new("/w"))),
            PathBuf::from("/w/bin/t")
        );
        assert_eq!(resolve_program("bin/t", flags, None), PathBuf::from("bin/t"));
    }

    #[test]
    fn fresh_handle_rejects_operations() {
        let supervisor = ProcessSupervisor::with_defaults(PollLoop::new().shared());
        let handle = supervisor.handle();
        assert_eq!(handle.state(), ProcessState::NotStarted);
        assert_eq!(handle.generation(), 0);
        assert!(matches!(handle.write(b"x"), Err(WriteError::NotRunning)));
        assert!(matches!(
            handle.wait(Duration::from_millis(1)),
            Err(WaitError::NotRunning)
        ));
        assert!(matches!(handle.kill(SIGTERM), Err(KillError::NotRunning)));
        handle.close();
        handle.dispose();
        assert_eq!(handle.state(), ProcessState::NotStarted);
    }

    #[test]
    fn empty_command_is_missing() {
        let supervisor = ProcessSupervisor::with_defaults(PollLoop::new().shared());
        let handle = supervisor.handle();
        let err = handle.spawn(&Command::default()).unwrap_err();
        assert!(matches!(err, SpawnError::CommandMissing));
    }

    #[test]
    fn read_failure_emits_io_error_and_abandons_the_stream() {
        let supervisor = ProcessSupervisor::with_defaults(PollLoop::new().shared());
        let handle = supervisor.handle();
        handle
            .spawn(&Command::from_args([
                "sh",
                "-c",
                "sleep 0.2; printf err >&2; printf late",
            ]))
            .unwrap();

        // Swap a directory in under the live stdout watch: poll reports it
        // readable and read(2) fails with EISDIR.
        let dir = std::fs::File::open("/").unwrap();
        let fd = handle
            .inner
            .borrow()
            .stdout
            .as_ref()
            .map(|pipe| pipe.fd.as_raw_fd())
            .unwrap();
        sys::dup_onto(dir.as_raw_fd(), fd).unwrap();

        handle.wait(Duration::from_secs(10)).unwrap();
        assert!(handle.inner.borrow().stdout.is_none());

        let events = handle.drain_events();
        let failures: Vec<(OutputStream, Option<i32>)> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::IoError { stream, error } => Some((*stream, error.raw_os_error())),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![(OutputStream::Stdout, Some(libc::EISDIR))]);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ProcessEvent::OutputReceived(_)))
        );
        let stderr: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::ErrorReceived(chunk) => Some(chunk.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect();
        assert_eq!(stderr, b"err");
        let reaped = events
            .iter()
            .filter(|e| matches!(e, ProcessEvent::Reaped(_)))
            .count();
        assert_eq!(reaped, 1);
    }

    #[test]
    fn events_queue_until_subscribed() {
        let inner = RefCell::new(Inner::default());
        emit(&inner, ProcessEvent::OutputReceived(b"a".to_vec()));
        assert_eq!(inner.borrow().queue.len(), 1);

        let seen = Rc::new(Cell::new(0));
        let counter = Rc::clone(&seen);
        inner
            .borrow_mut()
            .subscribers
            .push(Box::new(move |_| counter.set(counter.get() + 1)));
        emit(&inner, ProcessEvent::Reaped(ExitStatus::Exited(0)));
        assert_eq!(seen.get(), 1);
        assert_eq!(inner.borrow().queue.len(), 1);
        assert!(!inner.borrow().emitting);
    }
}

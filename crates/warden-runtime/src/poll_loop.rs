//! `poll(2)`-backed [`EventLoop`].
//!
//! Each pass:
//! 1. reaps exited children (`waitpid(WNOHANG)`) and parks their status on
//!    the watch,
//! 2. polls every I/O watch plus one `pidfd` per child, with a timeout derived
//!    from the nearest timer, pending idle work and the child polling tick,
//! 3. dispatches every ready watch at the most urgent ready priority.
//!
//! A callback is moved out of its slot while it runs. Nested passes therefore
//! skip it, and a watch removed by its own callback is simply not restored.
//! Registry borrows are never held across a callback.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use warden_core::ExitStatus;

use crate::config::DEFAULT_CHILD_POLL_INTERVAL;
use crate::event_loop::{
    ChildCallback, EventLoop, IdleCallback, IoCallback, IoCondition, PRIORITY_DEFAULT, Priority,
    TimerCallback, WatchId,
};
use crate::sys::{self, Reap};

enum Source {
    Io {
        fd: RawFd,
        interest: IoCondition,
        fired: IoCondition,
        callback: Option<IoCallback>,
    },
    Child {
        pid: i32,
        pidfd: Option<OwnedFd>,
        status: Option<ExitStatus>,
        callback: ChildCallback,
    },
    Timer {
        interval: Duration,
        deadline: Instant,
        callback: Option<TimerCallback>,
    },
    Idle {
        callback: Option<IdleCallback>,
    },
}

impl Source {
    fn is_ready(&self, now: Instant) -> bool {
        match self {
            Self::Io {
                fired, callback, ..
            } => callback.is_some() && !fired.is_empty(),
            Self::Child { status, .. } => status.is_some(),
            Self::Timer {
                deadline, callback, ..
            } => callback.is_some() && *deadline <= now,
            Self::Idle { callback } => callback.is_some(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Child { .. } => "child",
            Self::Timer { .. } => "timer",
            Self::Idle { .. } => "idle",
        }
    }
}

struct Watch {
    priority: Priority,
    source: Source,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    watches: BTreeMap<WatchId, Watch>,
}

/// A callback taken out of the registry for the duration of its call.
enum Job {
    Io(IoCallback, IoCondition),
    Child(ChildCallback, i32, ExitStatus),
    Timer(TimerCallback),
    Idle(IdleCallback),
}

/// Outcome of a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Dispatched,
    Empty,
    /// Blocking was requested but nothing registered could ever become ready.
    Stalled,
}

pub struct PollLoop {
    registry: RefCell<Registry>,
    quit: Cell<bool>,
    child_poll_interval: Duration,
}

impl Default for PollLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.borrow();
        let mut kinds: BTreeMap<&'static str, usize> = BTreeMap::new();
        for watch in reg.watches.values() {
            *kinds.entry(watch.source.kind()).or_default() += 1;
        }
        f.debug_struct("PollLoop")
            .field("watches", &kinds)
            .field("next_id", &reg.next_id)
            .field("child_poll_interval", &self.child_poll_interval)
            .finish()
    }
}

impl PollLoop {
    #[must_use]
    pub fn new() -> Self {
        Self::with_child_poll_interval(DEFAULT_CHILD_POLL_INTERVAL)
    }

    /// Loop whose child-exit fallback polls every `tick` when no `pidfd` is
    /// available.
    #[must_use]
    pub fn with_child_poll_interval(tick: Duration) -> Self {
        Self {
            registry: RefCell::new(Registry::default()),
            quit: Cell::new(false),
            child_poll_interval: tick.max(Duration::from_millis(1)),
        }
    }

    /// Convenience for the common `Rc<dyn EventLoop>` sharing pattern.
    #[must_use]
    pub fn shared(self) -> Rc<dyn EventLoop> {
        Rc::new(self)
    }

    /// Number of registered watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.borrow().watches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, priority: Priority, source: Source) -> WatchId {
        let mut reg = self.registry.borrow_mut();
        reg.next_id += 1;
        let id = WatchId(reg.next_id);
        reg.watches.insert(id, Watch { priority, source });
        id
    }

    // -----------------------------------------------------------------------
    // Pass stages
    // -----------------------------------------------------------------------

    fn collect_children(&self) {
        let mut reg = self.registry.borrow_mut();
        for watch in reg.watches.values_mut() {
            if let Source::Child {
                pid, pidfd, status, ..
            } = &mut watch.source
                && status.is_none()
            {
                match sys::try_reap(*pid) {
                    Ok(Reap::Running) => {}
                    Ok(Reap::Exited(exit)) => {
                        *status = Some(exit);
                        *pidfd = None;
                    }
                    Ok(Reap::NoChild) | Err(_) => {
                        *status = Some(ExitStatus::Unknown);
                        *pidfd = None;
                    }
                }
            }
        }
    }

    /// Build the poll set and the timeout (`None` = infinite).
    fn prepare(
        &self,
        may_block: bool,
        now: Instant,
    ) -> (Vec<libc::pollfd>, Vec<WatchId>, Option<Duration>) {
        let mut reg = self.registry.borrow_mut();
        let mut fds = Vec::new();
        let mut targets = Vec::new();
        let mut timeout = if may_block {
            None
        } else {
            Some(Duration::ZERO)
        };

        for (id, watch) in &mut reg.watches {
            match &mut watch.source {
                Source::Io {
                    fd,
                    interest,
                    fired,
                    callback: Some(_),
                } => {
                    *fired = IoCondition::empty();
                    fds.push(libc::pollfd {
                        fd: *fd,
                        events: interest.to_poll_events(),
                        revents: 0,
                    });
                    targets.push(*id);
                }
                Source::Child { status: Some(_), .. } | Source::Idle { callback: Some(_) } => {
                    timeout = Some(Duration::ZERO);
                }
                Source::Child {
                    pidfd: Some(pidfd), ..
                } => {
                    fds.push(libc::pollfd {
                        fd: pidfd.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    targets.push(*id);
                }
                Source::Child { pidfd: None, .. } => {
                    shorten(&mut timeout, self.child_poll_interval);
                }
                Source::Timer {
                    deadline,
                    callback: Some(_),
                    ..
                } => {
                    shorten(&mut timeout, deadline.saturating_duration_since(now));
                }
                _ => {}
            }
        }

        (fds, targets, timeout)
    }

    fn record_readiness(&self, fds: &[libc::pollfd], targets: &[WatchId]) {
        let mut reg = self.registry.borrow_mut();
        for (pfd, id) in fds.iter().zip(targets) {
            if pfd.revents == 0 {
                continue;
            }
            if let Some(Watch {
                source: Source::Io { fired, .. },
                ..
            }) = reg.watches.get_mut(id)
            {
                *fired = IoCondition::from_poll_revents(pfd.revents);
            }
        }
    }

    fn pass(&self, may_block: bool) -> Pass {
        self.collect_children();

        let (mut fds, targets, timeout) = self.prepare(may_block, Instant::now());
        if fds.is_empty() && timeout.is_none() {
            return Pass::Stalled;
        }

        match sys::poll(&mut fds, timeout_millis(timeout)) {
            Ok(_) => self.record_readiness(&fds, &targets),
            // EINTR (and anything else poll reports) is an empty pass.
            Err(_) => return Pass::Empty,
        }

        self.collect_children();
        if self.dispatch(Instant::now()) {
            Pass::Dispatched
        } else {
            Pass::Empty
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&self, now: Instant) -> bool {
        let ready: Vec<WatchId> = {
            let reg = self.registry.borrow();
            let Some(best) = reg
                .watches
                .values()
                .filter(|w| w.source.is_ready(now))
                .map(|w| w.priority)
                .min()
            else {
                return false;
            };
            reg.watches
                .iter()
                .filter(|(_, w)| w.priority == best && w.source.is_ready(now))
                .map(|(id, _)| *id)
                .collect()
        };

        let mut dispatched = false;
        for id in ready {
            // An earlier callback in this pass may have removed or parked it.
            let Some(job) = self.take_job(id, now) else {
                continue;
            };
            dispatched = true;
            self.run_job(id, job);
        }
        dispatched
    }

    fn take_job(&self, id: WatchId, now: Instant) -> Option<Job> {
        let mut reg = self.registry.borrow_mut();
        let watch = reg.watches.get_mut(&id)?;
        if !watch.source.is_ready(now) {
            return None;
        }
        if let Source::Child { .. } = watch.source {
            let Some(Watch {
                source:
                    Source::Child {
                        pid,
                        status,
                        callback,
                        ..
                    },
                ..
            }) = reg.watches.remove(&id)
            else {
                return None;
            };
            return Some(Job::Child(
                callback,
                pid,
                status.unwrap_or(ExitStatus::Unknown),
            ));
        }
        match &mut watch.source {
            Source::Io {
                fired, callback, ..
            } => {
                let condition = std::mem::take(fired);
                callback.take().map(|cb| Job::Io(cb, condition))
            }
            Source::Timer { callback, .. } => callback.take().map(Job::Timer),
            Source::Idle { callback } => callback.take().map(Job::Idle),
            Source::Child { .. } => None,
        }
    }

    fn run_job(&self, id: WatchId, job: Job) {
        match job {
            Job::Io(mut cb, condition) => {
                let flow = cb(condition);
                self.settle(id, flow, cb, io_slot);
            }
            Job::Child(cb, pid, status) => cb(pid, status),
            Job::Timer(mut cb) => {
                let flow = cb();
                self.settle(id, flow, cb, timer_slot);
            }
            Job::Idle(mut cb) => {
                let flow = cb();
                self.settle(id, flow, cb, idle_slot);
            }
        }
    }

    /// Put a callback back after it ran, or drop the watch on `Break`.
    ///
    /// Anything that ends up unused is dropped after the registry borrow is
    /// released, since a callback's captures may call back into the loop.
    fn settle<C>(
        &self,
        id: WatchId,
        flow: ControlFlow<()>,
        callback: C,
        slot: fn(&mut Source) -> Option<&mut Option<C>>,
    ) {
        let mut leftover = Some(callback);
        let mut removed = None;
        {
            let mut reg = self.registry.borrow_mut();
            if flow.is_continue() {
                if let Some(watch) = reg.watches.get_mut(&id) {
                    if let Source::Timer {
                        interval, deadline, ..
                    } = &mut watch.source
                    {
                        *deadline = Instant::now() + *interval;
                    }
                    if let Some(target) = slot(&mut watch.source) {
                        *target = leftover.take();
                    }
                }
            } else {
                removed = reg.watches.remove(&id);
            }
        }
        drop(removed);
        drop(leftover);
    }
}

fn io_slot(source: &mut Source) -> Option<&mut Option<IoCallback>> {
    match source {
        Source::Io { callback, .. } => Some(callback),
        _ => None,
    }
}

fn timer_slot(source: &mut Source) -> Option<&mut Option<TimerCallback>> {
    match source {
        Source::Timer { callback, .. } => Some(callback),
        _ => None,
    }
}

fn idle_slot(source: &mut Source) -> Option<&mut Option<IdleCallback>> {
    match source {
        Source::Idle { callback } => Some(callback),
        _ => None,
    }
}

fn shorten(timeout: &mut Option<Duration>, candidate: Duration) {
    *timeout = Some(timeout.map_or(candidate, |current| current.min(candidate)));
}

/// Milliseconds for `poll(2)`, rounded up so timers never fire early.
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

impl EventLoop for PollLoop {
    fn run(&self) {
        self.quit.set(false);
        while !self.quit.get() {
            if self.pass(true) == Pass::Stalled {
                break;
            }
        }
        self.quit.set(false);
    }

    fn iterate(&self, may_block: bool) -> bool {
        self.pass(may_block) == Pass::Dispatched
    }

    fn quit(&self) {
        self.quit.set(true);
    }

    fn watch_io(&self, fd: RawFd, interest: IoCondition, callback: IoCallback) -> WatchId {
        self.insert(
            PRIORITY_DEFAULT,
            Source::Io {
                fd,
                interest,
                fired: IoCondition::empty(),
                callback: Some(callback),
            },
        )
    }

    fn watch_child_exit(&self, pid: i32, priority: Priority, callback: ChildCallback) -> WatchId {
        self.insert(
            priority,
            Source::Child {
                pid,
                pidfd: sys::pidfd_open(pid),
                status: None,
                callback,
            },
        )
    }

    fn add_timeout(
        &self,
        interval: Duration,
        priority: Priority,
        callback: TimerCallback,
    ) -> WatchId {
        self.insert(
            priority,
            Source::Timer {
                interval,
                deadline: Instant::now() + interval,
                callback: Some(callback),
            },
        )
    }

    fn add_idle(&self, priority: Priority, callback: IdleCallback) -> WatchId {
        self.insert(
            priority,
            Source::Idle {
                callback: Some(callback),
            },
        )
    }

    fn remove(&self, id: WatchId) -> bool {
        let removed = self.registry.borrow_mut().watches.remove(&id);
        let found = removed.is_some();
        drop(removed);
        found
    }

    fn contains(&self, id: WatchId) -> bool {
        self.registry.borrow().watches.contains_key(&id)
    }
}

//! Cooperative event-loop abstraction.
//!
//! An [`EventLoop`] multiplexes four kinds of watch on one thread: file
//! descriptor readiness, child-process exit, timers and idle work. Callbacks
//! run only from inside [`EventLoop::iterate`] or [`EventLoop::run`], never
//! concurrently, and may freely add or remove watches (their own included) or
//! iterate the loop recursively.
//!
//! Priorities follow the usual main-loop convention: a numerically lower value
//! is more urgent. One pass dispatches every ready watch that shares the most
//! urgent ready priority; the rest stay ready for the next pass.

use std::fmt;
use std::ops::{BitOr, BitOrAssign, ControlFlow};
use std::os::fd::RawFd;
use std::time::Duration;

use warden_core::ExitStatus;

// ---------------------------------------------------------------------------
// Priorities
// ---------------------------------------------------------------------------

/// Dispatch priority. Lower runs first.
pub type Priority = i32;

pub const PRIORITY_HIGH: Priority = -100;
pub const PRIORITY_DEFAULT: Priority = 0;
pub const PRIORITY_HIGH_IDLE: Priority = 100;
pub const PRIORITY_DEFAULT_IDLE: Priority = 200;
pub const PRIORITY_LOW: Priority = 300;

// ---------------------------------------------------------------------------
// Watch identity
// ---------------------------------------------------------------------------

/// Handle to a registered watch.
///
/// Allocated from a per-loop counter; an id is never handed out twice by the
/// same loop, so a stale id can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(pub(crate) u64);

impl WatchId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// I/O conditions
// ---------------------------------------------------------------------------

/// Readiness bits for an I/O watch: both the interest set and what fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IoCondition(u16);

impl IoCondition {
    pub const READABLE: Self = Self(0x01);
    pub const WRITABLE: Self = Self(0x02);
    pub const PRIORITY: Self = Self(0x04);
    pub const ERROR: Self = Self(0x08);
    pub const HANGUP: Self = Self(0x10);
    pub const INVALID: Self = Self(0x20);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// `poll(2)` request mask for this interest set.
    ///
    /// Error, hangup and invalid are always reported by the kernel and need
    /// not be requested.
    #[must_use]
    pub const fn to_poll_events(self) -> i16 {
        let mut events = 0;
        if self.contains(Self::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Self::WRITABLE) {
            events |= libc::POLLOUT;
        }
        if self.contains(Self::PRIORITY) {
            events |= libc::POLLPRI;
        }
        events
    }

    /// Decode `revents` from `poll(2)`.
    #[must_use]
    pub const fn from_poll_revents(revents: i16) -> Self {
        let mut bits = 0;
        if revents & libc::POLLIN != 0 {
            bits |= Self::READABLE.0;
        }
        if revents & libc::POLLOUT != 0 {
            bits |= Self::WRITABLE.0;
        }
        if revents & libc::POLLPRI != 0 {
            bits |= Self::PRIORITY.0;
        }
        if revents & libc::POLLERR != 0 {
            bits |= Self::ERROR.0;
        }
        if revents & libc::POLLHUP != 0 {
            bits |= Self::HANGUP.0;
        }
        if revents & libc::POLLNVAL != 0 {
            bits |= Self::INVALID.0;
        }
        Self(bits)
    }
}

impl BitOr for IoCondition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoCondition {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for IoCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(IoCondition, &str); 6] = [
            (IoCondition::READABLE, "in"),
            (IoCondition::WRITABLE, "out"),
            (IoCondition::PRIORITY, "pri"),
            (IoCondition::ERROR, "err"),
            (IoCondition::HANGUP, "hup"),
            (IoCondition::INVALID, "nval"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// I/O readiness callback. `Break` removes the watch.
pub type IoCallback = Box<dyn FnMut(IoCondition) -> ControlFlow<()>>;
/// Child-exit callback, invoked once with `(pid, status)`.
pub type ChildCallback = Box<dyn FnOnce(i32, ExitStatus)>;
/// Timer callback. `Continue` re-arms for another interval.
pub type TimerCallback = Box<dyn FnMut() -> ControlFlow<()>>;
/// Idle callback. `Continue` keeps it scheduled.
pub type IdleCallback = Box<dyn FnMut() -> ControlFlow<()>>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A cooperative, single-threaded event multiplexer.
///
/// Object safe; components share a loop as `Rc<dyn EventLoop>`.
pub trait EventLoop {
    /// Dispatch until [`quit`](Self::quit) is called.
    ///
    /// Also returns once the loop holds no watches at all, since nothing could
    /// ever wake it again.
    fn run(&self);

    /// Run one pass. With `may_block`, waits for the first ready watch or the
    /// nearest timer deadline. Returns whether any callback was dispatched.
    fn iterate(&self, may_block: bool) -> bool;

    /// Make [`run`](Self::run) return after the current pass.
    fn quit(&self);

    /// Watch `fd` for the conditions in `interest`. The callback receives what
    /// actually fired, which may include error or hangup bits.
    fn watch_io(&self, fd: RawFd, interest: IoCondition, callback: IoCallback) -> WatchId;

    /// Fire once when `pid` exits, then remove the watch. The loop reaps the
    /// child; a pid that is no longer a child reports [`ExitStatus::Unknown`].
    fn watch_child_exit(&self, pid: i32, priority: Priority, callback: ChildCallback) -> WatchId;

    /// Fire every `interval` while the callback returns `Continue`. May fire
    /// late, never early.
    fn add_timeout(&self, interval: Duration, priority: Priority, callback: TimerCallback)
    -> WatchId;

    /// Run whenever a pass finds nothing more urgent to dispatch.
    fn add_idle(&self, priority: Priority, callback: IdleCallback) -> WatchId;

    /// Remove a watch. Returns `false` when the id is unknown, already removed
    /// or (for child watches) already fired. Safe to call from any callback,
    /// including the watch's own.
    fn remove(&self, id: WatchId) -> bool;

    /// True while `id` is registered.
    fn contains(&self, id: WatchId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_bits_combine() {
        let mut c = IoCondition::READABLE | IoCondition::HANGUP;
        assert!(c.contains(IoCondition::READABLE));
        assert!(!c.contains(IoCondition::READABLE | IoCondition::WRITABLE));
        assert!(c.intersects(IoCondition::READABLE | IoCondition::WRITABLE));
        c |= IoCondition::ERROR;
        assert_eq!(c.to_string(), "in|err|hup");
        assert_eq!(IoCondition::empty().to_string(), "none");
    }

    #[test]
    fn poll_mask_round_trip() {
        let interest = IoCondition::READABLE | IoCondition::PRIORITY;
        assert_eq!(interest.to_poll_events(), libc::POLLIN | libc::POLLPRI);

        let fired = IoCondition::from_poll_revents(libc::POLLIN | libc::POLLHUP | libc::POLLNVAL);
        assert!(fired.contains(IoCondition::READABLE));
        assert!(fired.contains(IoCondition::HANGUP));
        assert!(fired.contains(IoCondition::INVALID));
        assert!(!fired.intersects(IoCondition::WRITABLE | IoCondition::ERROR));
    }

    #[test]
    fn error_bits_are_never_requested() {
        let interest = IoCondition::ERROR | IoCondition::HANGUP;
        assert_eq!(interest.to_poll_events(), 0);
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(PRIORITY_HIGH < PRIORITY_DEFAULT);
        assert!(PRIORITY_DEFAULT < PRIORITY_HIGH_IDLE);
        assert!(PRIORITY_HIGH_IDLE < PRIORITY_DEFAULT_IDLE);
        assert!(PRIORITY_DEFAULT_IDLE < PRIORITY_LOW);
    }
}

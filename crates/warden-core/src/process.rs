//! Process status decoding and signal validation.
//!
//! Wait-status decoding follows the glibc bit layout of `<sys/wait.h>`.

use std::fmt;

/// Signals sent by `dispose()`.
pub const SIGKILL: i32 = 9;
pub const SIGTERM: i32 = 15;

// ---------------------------------------------------------------------------
// Wait-status decoding macros (match glibc bit layout)
// ---------------------------------------------------------------------------

/// True if the child terminated normally (via `_exit` or `exit`).
#[must_use]
pub const fn wifexited(status: i32) -> bool {
    (status & 0x7f) == 0
}

/// Exit code of a normally-terminated child (valid only when `wifexited`).
#[must_use]
pub const fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// True if the child was killed by a signal.
#[must_use]
pub const fn wifsignaled(status: i32) -> bool {
    let low7 = status & 0x7f;
    low7 != 0 && low7 != 0x7f
}

/// Signal number that killed the child (valid only when `wifsignaled`).
#[must_use]
pub const fn wtermsig(status: i32) -> i32 {
    status & 0x7f
}

/// Returns true if `sig` is in the valid POSIX signal range [1, 64].
#[must_use]
pub const fn valid_signal(sig: i32) -> bool {
    sig >= 1 && sig <= 64
}

/// How a supervised child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Normal termination with the given exit code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
    /// The status could not be collected (already reaped elsewhere).
    Unknown,
}

impl ExitStatus {
    /// Decode a raw `waitpid` status word.
    #[must_use]
    pub const fn from_wait_status(status: i32) -> Self {
        if wifexited(status) {
            Self::Exited(wexitstatus(status))
        } else if wifsignaled(status) {
            Self::Signaled(wtermsig(status))
        } else {
            Self::Unknown
        }
    }

    /// Exit code, when the child exited normally.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Terminating signal, when the child was killed.
    #[must_use]
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Signaled(sig) => Some(sig),
            _ => None,
        }
    }

    /// True for a normal exit with code 0.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_exit_status_42() {
        // glibc encodes normal exit(42) as (42 << 8) | 0 = 0x2A00.
        let status = 42 << 8;
        assert!(wifexited(status));
        assert_eq!(wexitstatus(status), 42);
        assert!(!wifsignaled(status));
        assert_eq!(ExitStatus::from_wait_status(status), ExitStatus::Exited(42));
    }

    #[test]
    fn killed_by_sigkill() {
        // Killed by signal 9 (SIGKILL): low 7 bits = 9.
        let status = 9;
        assert!(!wifexited(status));
        assert!(wifsignaled(status));
        assert_eq!(wtermsig(status), 9);
        let decoded = ExitStatus::from_wait_status(status);
        assert_eq!(decoded.signal(), Some(SIGKILL));
        assert_eq!(decoded.code(), None);
    }

    #[test]
    fn core_dump_bit() {
        let status = 0x80 | 11;
        assert!(wifsignaled(status));
        assert_eq!(ExitStatus::from_wait_status(status), ExitStatus::Signaled(11));
    }

    #[test]
    fn stopped_status_is_unknown() {
        let status = (19 << 8) | 0x7f;
        assert_eq!(ExitStatus::from_wait_status(status), ExitStatus::Unknown);
    }

    #[test]
    fn valid_signal_range() {
        assert!(!valid_signal(0));
        assert!(valid_signal(1));
        assert!(valid_signal(9));
        assert!(valid_signal(64));
        assert!(!valid_signal(65));
        assert!(!valid_signal(-1));
    }

    #[test]
    fn success_and_display() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert!(!ExitStatus::Signaled(15).success());
        assert_eq!(ExitStatus::Exited(3).to_string(), "exit status 3");
        assert_eq!(ExitStatus::Signaled(15).to_string(), "killed by signal 15");
    }
}

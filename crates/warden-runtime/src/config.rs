//! Supervisor tunables.
//!
//! Defaults suit interactive test runs. Each knob can be overridden from the
//! environment:
//! - `WARDEN_DISPOSE_GRACE_MS`: how long `dispose()` waits after SIGTERM
//!   before escalating to SIGKILL (default 2000).
//! - `WARDEN_READ_CHUNK`: bytes per `read(2)` on captured pipes (default 4096).
//! - `WARDEN_CHILD_POLL_MS`: child-exit polling tick when `pidfd_open(2)` is
//!   unavailable (default 10).
//!
//! Malformed or zero values fall back to the default.

use std::time::Duration;

pub const ENV_DISPOSE_GRACE_MS: &str = "WARDEN_DISPOSE_GRACE_MS";
pub const ENV_READ_CHUNK: &str = "WARDEN_READ_CHUNK";
pub const ENV_CHILD_POLL_MS: &str = "WARDEN_CHILD_POLL_MS";

pub const DEFAULT_DISPOSE_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for `read_chunk_size`; larger requests are clamped.
pub const MAX_READ_CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Wait between SIGTERM and SIGKILL in `dispose()`.
    pub dispose_grace: Duration,
    /// Buffer size for each pipe read.
    pub read_chunk_size: usize,
    /// Fallback child-exit polling tick.
    pub child_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            dispose_grace: DEFAULT_DISPOSE_GRACE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            child_poll_interval: DEFAULT_CHILD_POLL_INTERVAL,
        }
    }
}

impl SupervisorConfig {
    /// Defaults overridden by whatever `WARDEN_*` variables are set.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Pure; used by `from_env`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(grace) = lookup(ENV_DISPOSE_GRACE_MS).as_deref().and_then(parse_millis) {
            config.dispose_grace = grace;
        }
        if let Some(chunk) = lookup(ENV_READ_CHUNK).as_deref().and_then(parse_chunk_size) {
            config.read_chunk_size = chunk;
        }
        if let Some(tick) = lookup(ENV_CHILD_POLL_MS).as_deref().and_then(parse_millis) {
            config.child_poll_interval = tick;
        }
        config
    }

    #[must_use]
    pub fn with_dispose_grace(mut self, grace: Duration) -> Self {
        self.dispose_grace = grace;
        self
    }

    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.clamp(1, MAX_READ_CHUNK_SIZE);
        self
    }

    #[must_use]
    pub fn with_child_poll_interval(mut self, tick: Duration) -> Self {
        self.child_poll_interval = tick;
        self
    }
}

/// Positive millisecond count.
#[must_use]
pub fn parse_millis(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

/// Positive byte count, clamped to [`MAX_READ_CHUNK_SIZE`].
#[must_use]
pub fn parse_chunk_size(raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n.min(MAX_READ_CHUNK_SIZE)),
    }
}

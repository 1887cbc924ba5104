//! Window records and the values derived from them.

/// Counter state for one accounting key inside a fixed window.
///
/// A record is current while `now < window_reset_at`. Once the reset time is
/// reached the record is stale and must be treated as absent: the next request
/// opens a new window instead of updating this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Requests admitted in this window
    pub count: u64,
    /// Epoch milliseconds at which the window ends
    pub window_reset_at: u64,
}

impl WindowRecord {
    /// Open an empty window starting at `now`.
    pub fn open(now: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            window_reset_at: now.saturating_add(window_ms),
        }
    }

    /// Whether the record still describes the window that contains `now`.
    pub fn is_current(&self, now: u64) -> bool {
        now < self.window_reset_at
    }

    /// The same window with one more admitted request.
    pub fn incremented(self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            ..self
        }
    }
}

/// Usage of a key against its limit, without an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageInfo {
    /// Configured ceiling
    pub limit: u64,
    /// Requests counted against the ceiling
    pub used: u64,
    /// `max(0, limit - used)`
    pub remaining: u64,
    /// Epoch milliseconds at which capacity is next restored
    pub reset_at: u64,
}

impl UsageInfo {
    pub fn new(limit: u64, used: u64, reset_at: u64) -> Self {
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_at,
        }
    }

    /// Usage of a key with no accounting state.
    pub fn untouched(limit: u64, now: u64, window_ms: u64) -> Self {
        Self::new(limit, 0, now.saturating_add(window_ms))
    }
}

/// Outcome of a single admission check.
///
/// A denial is an ordinary verdict, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: u64,
}

impl RateLimitVerdict {
    pub fn new(allowed: bool, usage: UsageInfo) -> Self {
        Self {
            allowed,
            limit: usage.limit,
            used: usage.used,
            remaining: usage.remaining,
            reset_at: usage.reset_at,
        }
    }

    /// The usage half of the verdict.
    pub fn usage(&self) -> UsageInfo {
        UsageInfo {
            limit: self.limit,
            used: self.used,
            remaining: self.remaining,
            reset_at: self.reset_at,
        }
    }
}

/// A key that currently holds accounting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEntry {
    pub key: String,
    pub count: u64,
    pub reset_at: u64,
}

/// Result of an explicit cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub remaining: usize,
}

/// Admission curve implemented by a limiter.
///
/// The two algorithms are not interchangeable near window boundaries: a fixed
/// window admits up to twice `max_requests` across a boundary, the sliding log
/// never admits more than `max_requests` in any `window_ms` span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Per-key counter that resets at the end of each window
    FixedWindow,
    /// Per-key log of request timestamps trimmed to the trailing window
    SlidingLog,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::FixedWindow => write!(f, "fixed-window"),
            Algorithm::SlidingLog => write!(f, "sliding-log"),
        }
    }
}

//! Monotonic time sources
//!
//! Every timestamp in the crate is a `Duration` since the clock's origin.
//! `ManualClock` lets tests and simulations drive time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic clock
pub trait TimeSource: Send + Sync {
    /// Elapsed time since the clock's origin
    fn now(&self) -> Duration;
}

/// Wall-clock monotonic time backed by `Instant`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn TimeSource> {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock already advanced to `start`
    pub fn starting_at(start: Duration) -> Self {
        let clock = Self::new();
        clock.set(start);
        clock
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Jump to an absolute time; never moves backwards
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(at.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Build a `Duration` from a nanosecond count, saturating at `Duration::MAX`
pub fn saturating_from_nanos(nanos: u128) -> Duration {
    match u64::try_from(nanos / NANOS_PER_SEC) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}

/// Round `t` down to a multiple of `granularity`
pub fn floor_to(t: Duration, granularity: Duration) -> Duration {
    let unit = granularity.as_nanos();
    if unit == 0 {
        return t;
    }
    saturating_from_nanos(t.as_nanos() / unit * unit)
}

/// Round `t` up to a multiple of `granularity`, saturating at `Duration::MAX`
pub fn ceil_to(t: Duration, granularity: Duration) -> Duration {
    let unit = granularity.as_nanos();
    if unit == 0 {
        return t;
    }
    saturating_from_nanos(t.as_nanos().div_ceil(unit).saturating_mul(unit))
}

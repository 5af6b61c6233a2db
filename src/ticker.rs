//! Monotonic time sources.
//!
//! Every time-dependent component (expiry tracking, decaying counters,
//! failure sustain, completion latency) reads time through a shared
//! [`Ticker`] so tests can drive the clock by hand.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic clock reporting nanoseconds since an arbitrary origin.
pub trait Ticker: Send + Sync + Debug {
    /// Current reading in nanoseconds. Never decreases.
    fn now_nanos(&self) -> u64;
}

/// Shared handle to a time source.
pub type SharedTicker = Arc<dyn Ticker>;

/// Wall-clock ticker backed by [`Instant`], measured from its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor for the shared handle form.
    pub fn shared() -> SharedTicker {
        Arc::new(Self::new())
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn now_nanos(&self) -> u64 {
        // u64 nanoseconds cover ~584 years of uptime.
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A ticker that only moves when told to.
///
/// Used for deterministic tests of decay windows and failure sustain.
#[derive(Debug, Default)]
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ticker already positioned at `start`.
    pub fn starting_at(start: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(duration_nanos(start)),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(duration_nanos(by), Ordering::AcqRel);
    }

    /// Jump to an absolute reading. Readings behind the current value are ignored.
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(duration_nanos(at), Ordering::AcqRel);
    }

    /// Current reading as a [`Duration`].
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }
}

impl Ticker for ManualTicker {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Saturating conversion of a [`Duration`] to u64 nanoseconds.
pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

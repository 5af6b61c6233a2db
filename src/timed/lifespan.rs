//! Bucketed expiry tracking.
//!
//! A [`LifespanTracker`] answers "how much of what was added has outlived its
//! lifespan since I last asked". Time is cut into fixed-width windows; every
//! count is accumulated into the window that contains its (rounded up) expiry
//! instant and drained in bulk once the clock passes that window.
//!
//! Expiry is rounded to the first window boundary strictly after
//! `now + lifespan`, so a count is never purged earlier than requested. The
//! slack is at most one window width.
//!
//! ```text
//! max_age = 300s, windows = 100  ->  width = 3s
//!
//! add(1, 60s) at t=10s  ->  70s rounds up to 72s
//! purge() at t=71s      ->  0
//! purge() at t=72s      ->  1
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{HeddleError, Result};
use crate::ticker::{duration_nanos, SharedTicker};

/// Slots beyond `num_windows`: one for the window straddling `now + max_age`
/// and one for the window currently being purged.
///
/// Window width is rounded up, so `max_age` never spans more than
/// `num_windows` widths and every pending window fits in the ring.
const EXTRA_SLOTS: usize = 2;

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    /// Absolute window index this bucket currently holds.
    window: u64,
    count: i64,
}

/// Ring of time windows accumulating counts until they expire.
///
/// `add` and `purge` are safe to call from any number of threads. Each slot
/// has its own lock, so concurrent writers only contend when they target the
/// same window.
#[derive(Debug)]
pub struct LifespanTracker {
    ticker: SharedTicker,
    max_age: u64,
    num_windows: usize,
    /// Window width in nanoseconds; zero when `max_age` is zero.
    width: u64,
    slots: Box<[Mutex<Bucket>]>,
    /// Highest window index already drained.
    cursor: AtomicU64,
    /// Counts that were due at insertion time or evicted by a newer window.
    expired: AtomicI64,
}

impl LifespanTracker {
    /// Create a tracker covering lifespans up to `max_age`, split into
    /// `num_windows` equal windows. When `max_age` does not divide evenly the
    /// width is rounded up.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::InvalidWindowCount`] when `num_windows` is zero.
    pub fn new(max_age: Duration, num_windows: usize, ticker: SharedTicker) -> Result<Self> {
        if num_windows == 0 {
            return Err(HeddleError::InvalidWindowCount(num_windows));
        }
        let max_age = duration_nanos(max_age);
        let width = if max_age == 0 {
            0
        } else {
            max_age.div_ceil(num_windows as u64)
        };
        let slots = (0..num_windows + EXTRA_SLOTS)
            .map(|_| Mutex::new(Bucket::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let cursor = if width == 0 {
            0
        } else {
            ticker.now_nanos() / width
        };

        Ok(Self {
            ticker,
            max_age,
            num_windows,
            width,
            slots,
            cursor: AtomicU64::new(cursor),
            expired: AtomicI64::new(0),
        })
    }

    /// Longest lifespan accepted; longer ones are clamped to this.
    pub fn max_age(&self) -> Duration {
        Duration::from_nanos(self.max_age)
    }

    /// Number of windows the max age is divided into.
    pub fn total_windows(&self) -> usize {
        self.num_windows
    }

    /// Width of one window, i.e. the expiry precision.
    pub fn window_width(&self) -> Duration {
        Duration::from_nanos(self.width)
    }

    /// Record `n` to expire after `lifespan`.
    ///
    /// Returns the absolute expiry instant in ticker nanoseconds, rounded up
    /// to the next window boundary.
    pub fn add(&self, n: i64, lifespan: Duration) -> u64 {
        let now = self.ticker.now_nanos();
        if self.width == 0 {
            self.expired.fetch_add(n, Ordering::AcqRel);
            return now;
        }

        let lifespan = duration_nanos(lifespan).min(self.max_age);
        let window = now.saturating_add(lifespan) / self.width + 1;
        let expiry = window.saturating_mul(self.width);
        if n == 0 {
            return expiry;
        }

        let mut bucket = self.slots[self.slot_of(window)].lock();
        // Read under the slot lock: a purge that has already moved past this
        // window will not visit the slot again.
        if window <= self.cursor.load(Ordering::Acquire) || bucket.window > window {
            self.expired.fetch_add(n, Ordering::AcqRel);
        } else if bucket.window < window {
            if bucket.count != 0 {
                // Any older tenant is at least one full ring behind and already due.
                self.expired.fetch_add(bucket.count, Ordering::AcqRel);
            }
            *bucket = Bucket { window, count: n };
        } else {
            bucket.count += n;
        }
        expiry
    }

    /// Drain every window the clock has passed since the last purge.
    ///
    /// Returns the sum of counts whose expiry has been reached. Each count is
    /// reported by exactly one purge.
    pub fn purge(&self) -> i64 {
        if self.width == 0 {
            return self.expired.swap(0, Ordering::AcqRel);
        }

        let current = self.ticker.now_nanos() / self.width;
        let mut last = self.cursor.load(Ordering::Acquire);
        while last < current {
            match self
                .cursor
                .compare_exchange_weak(last, current, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.drain(last, current);
                    break;
                }
                Err(observed) => last = observed,
            }
        }
        self.expired.swap(0, Ordering::AcqRel)
    }

    /// Move every bucket holding a window in `(from, to]` into the backlog.
    fn drain(&self, from: u64, to: u64) {
        let span = to - from;
        let slots = self.slots.len() as u64;
        let mut drained = 0i64;
        if span >= slots {
            for slot in self.slots.iter() {
                drained += take_due(&mut slot.lock(), to);
            }
        } else {
            for window in from + 1..=to {
                drained += take_due(&mut self.slots[self.slot_of(window)].lock(), to);
            }
        }
        if drained != 0 {
            self.expired.fetch_add(drained, Ordering::AcqRel);
        }
    }

    fn slot_of(&self, window: u64) -> usize {
        (window % self.slots.len() as u64) as usize
    }
}

fn take_due(bucket: &mut Bucket, up_to: u64) -> i64 {
    if bucket.window <= up_to {
        std::mem::take(&mut bucket.count)
    } else {
        0
    }
}

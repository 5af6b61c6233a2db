//! Delayed delivery of counts.
//!
//! A [`ScheduledCounter`] hands each scheduled count to a consumer once its
//! lifespan has elapsed. There is no timer thread: delivery happens inside
//! [`ScheduledCounter::check`], which callers piggy-back on their own hot path.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::ticker::{SharedTicker, SystemTicker};
use crate::timed::LifespanTracker;

/// Error type a consumer may return to refuse a delivery.
pub type ConsumeError = Box<dyn std::error::Error + Send + Sync>;

/// Receives the aggregated sum of every count that became due.
pub type Consumer = Box<dyn Fn(i64) -> std::result::Result<(), ConsumeError> + Send + Sync>;

/// Counter that delivers scheduled counts to a consumer after a delay.
///
/// Refused deliveries are kept and merged into the next attempt, so every
/// scheduled count reaches the consumer once the consumer recovers, and
/// never twice.
pub struct ScheduledCounter {
    tracker: LifespanTracker,
    consumer: Consumer,
    /// Due counts the consumer has not accepted yet.
    pending: AtomicI64,
}

impl ScheduledCounter {
    /// Create a counter on top of an existing tracker.
    pub fn new(tracker: LifespanTracker, consumer: Consumer) -> Self {
        Self {
            tracker,
            consumer,
            pending: AtomicI64::new(0),
        }
    }

    pub fn builder() -> ScheduledCounterBuilder {
        ScheduledCounterBuilder::default()
    }

    /// Schedule `n` for delivery after the tracker's max age.
    pub fn schedule(&self, n: i64) -> u64 {
        self.tracker.add(n, self.tracker.max_age())
    }

    /// Schedule `n` for delivery after `delay`, clamped to the max age.
    ///
    /// Returns the absolute delivery instant in ticker nanoseconds.
    pub fn schedule_after(&self, n: i64, delay: Duration) -> u64 {
        self.tracker.add(n, delay)
    }

    /// Deliver everything that has become due.
    ///
    /// The consumer is invoked at most once per call, and only with a
    /// non-zero sum. Safe to call concurrently.
    pub fn check(&self) {
        let due = self.tracker.purge() + self.pending.swap(0, Ordering::AcqRel);
        if due == 0 {
            return;
        }
        if let Err(e) = (self.consumer)(due) {
            self.pending.fetch_add(due, Ordering::AcqRel);
            debug!(%e, retained = due, "scheduled counter consumer refused delivery");
        }
    }

    /// Sum that is due but was refused by the consumer.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn tracker(&self) -> &LifespanTracker {
        &self.tracker
    }
}

impl fmt::Debug for ScheduledCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledCounter")
            .field("tracker", &self.tracker)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ScheduledCounter`] when no tracker exists yet.
#[derive(Debug)]
pub struct ScheduledCounterBuilder {
    max_delay: Duration,
    num_windows: usize,
    ticker: Option<SharedTicker>,
}

impl Default for ScheduledCounterBuilder {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(1),
            num_windows: 100,
            ticker: None,
        }
    }
}

impl ScheduledCounterBuilder {
    /// Longest delay the counter accepts.
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Number of windows the max delay is divided into.
    pub fn num_windows(mut self, num_windows: usize) -> Self {
        self.num_windows = num_windows;
        self
    }

    pub fn ticker(mut self, ticker: SharedTicker) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Build the counter delivering into `consumer`.
    ///
    /// # Errors
    ///
    /// Fails when the window count is zero.
    pub fn build<F>(self, consumer: F) -> Result<ScheduledCounter>
    where
        F: Fn(i64) -> std::result::Result<(), ConsumeError> + Send + Sync + 'static,
    {
        let ticker = self.ticker.unwrap_or_else(SystemTicker::shared);
        let tracker = LifespanTracker::new(self.max_delay, self.num_windows, ticker)?;
        Ok(ScheduledCounter::new(tracker, Box::new(consumer)))
    }
}

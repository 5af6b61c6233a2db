//! Windowed event rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::ticker::{duration_nanos, SharedTicker};
use crate::timed::{DecayingCounter, ScheduledCounter};

/// Events per second over a trailing window.
///
/// Built on a [`DecayingCounter`]: marks older than the window drop out, so
/// the rate returns to zero once a burst has aged past it.
#[derive(Debug)]
pub struct Meter {
    events: DecayingCounter,
    window_secs: f64,
}

impl Meter {
    pub fn new(window: Duration, num_windows: usize, ticker: SharedTicker) -> Result<Self> {
        let events = DecayingCounter::new(
            ScheduledCounter::builder()
                .max_delay(window)
                .num_windows(num_windows)
                .ticker(ticker),
        )?;
        Ok(Self {
            events,
            window_secs: window.as_secs_f64(),
        })
    }

    pub fn mark(&self, n: i64) {
        self.events.add(n);
    }

    /// Events in the trailing window, divided by its length in seconds.
    pub fn rate(&self) -> f64 {
        self.events.check();
        if self.window_secs <= 0.0 {
            return 0.0;
        }
        self.events.get().max(0) as f64 / self.window_secs
    }

    /// Events currently inside the window.
    pub fn count(&self) -> i64 {
        self.events.check();
        self.events.get()
    }
}

/// Lets one caller through per interval.
///
/// [`try_acquire`](IntervalLimiter::try_acquire) returns the time since the
/// previous successful acquisition once at least `interval` has passed, and
/// `None` otherwise. The first interval starts at construction.
#[derive(Debug)]
pub struct IntervalLimiter {
    interval: u64,
    last: AtomicU64,
    ticker: SharedTicker,
}

impl IntervalLimiter {
    pub fn new(interval: Duration, ticker: SharedTicker) -> Self {
        let last = AtomicU64::new(ticker.now_nanos());
        Self {
            interval: duration_nanos(interval),
            last,
            ticker,
        }
    }

    pub fn try_acquire(&self) -> Option<Duration> {
        let now = self.ticker.now_nanos();
        let last = self.last.load(Ordering::Acquire);
        let age = now.saturating_sub(last);
        if age < self.interval {
            return None;
        }
        self.last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Duration::from_nanos(age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::ManualTicker;
    use std::sync::Arc;

    #[test]
    fn test_rate_over_window() {
        let clock = Arc::new(ManualTicker::new());
        let meter = Meter::new(Duration::from_secs(5), 10, clock.clone()).unwrap();
        assert_eq!(meter.rate(), 0.0);

        meter.mark(3);
        meter.mark(7);
        assert!((meter.rate() - 2.0).abs() < 1e-9);
        assert_eq!(meter.count(), 10);

        // Aged out after the window plus one window of slack
        clock.advance(Duration::from_millis(5_500));
        assert_eq!(meter.rate(), 0.0);

        meter.mark(1);
        assert!(meter.rate() > 0.0);
    }

    #[test]
    fn test_interval_limiter() {
        let clock = Arc::new(ManualTicker::new());
        let limiter = IntervalLimiter::new(Duration::from_secs(5), clock.clone());
        assert_eq!(limiter.try_acquire(), None);

        clock.advance(Duration::from_secs(4));
        assert_eq!(limiter.try_acquire(), None);

        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.try_acquire(), Some(Duration::from_secs(6)));
        assert_eq!(limiter.try_acquire(), None);
    }
}

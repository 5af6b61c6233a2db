//! A counter whose additions fade out after a look-back window.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::timed::{ScheduledCounter, ScheduledCounterBuilder};

/// Sum of the additions made within the look-back window.
///
/// `add(n)` raises the value right away and schedules `-n` to be applied once
/// the window has passed. Expired additions are only subtracted when
/// [`DecayingCounter::check`] runs, so call it before trusting [`get`].
///
/// [`get`]: DecayingCounter::get
pub struct DecayingCounter {
    value: Arc<AtomicI64>,
    reversals: ScheduledCounter,
}

impl DecayingCounter {
    /// Build a counter whose reversals are delivered by `builder`'s counter.
    pub fn new(builder: ScheduledCounterBuilder) -> Result<Self> {
        let value = Arc::new(AtomicI64::new(0));
        let sink = value.clone();
        let reversals = builder.build(move |n| {
            sink.fetch_add(n, Ordering::AcqRel);
            Ok(())
        })?;
        Ok(Self { value, reversals })
    }

    /// Add `n` for the full look-back window.
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::AcqRel);
        self.reversals.schedule(-n);
    }

    /// Add `n` for a shorter lifespan than the look-back window.
    pub fn add_with_lifespan(&self, n: i64, lifespan: Duration) {
        self.value.fetch_add(n, Ordering::AcqRel);
        self.reversals.schedule_after(-n, lifespan);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Apply every reversal that has come due.
    pub fn check(&self) {
        self.reversals.check();
    }

    pub fn look_back(&self) -> Duration {
        self.reversals.tracker().max_age()
    }
}

impl fmt::Debug for DecayingCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecayingCounter")
            .field("value", &self.get())
            .field("look_back", &self.look_back())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::ManualTicker;

    fn counter(clock: &Arc<ManualTicker>) -> DecayingCounter {
        DecayingCounter::new(
            ScheduledCounter::builder()
                .max_delay(Duration::from_secs(30))
                .num_windows(10)
                .ticker(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_add_is_visible_immediately() {
        let clock = Arc::new(ManualTicker::new());
        let counter = counter(&clock);
        counter.add(9);
        assert_eq!(counter.get(), 9);
        assert_eq!(counter.look_back(), Duration::from_secs(30));
    }

    #[test]
    fn test_value_decays_after_look_back() {
        let clock = Arc::new(ManualTicker::new());
        let counter = counter(&clock);
        counter.add(2);

        clock.advance(Duration::from_secs(10));
        counter.add(3);
        counter.check();
        assert_eq!(counter.get(), 5);

        clock.set(Duration::from_secs(33));
        counter.check();
        assert_eq!(counter.get(), 3);

        clock.set(Duration::from_secs(42));
        counter.check();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_check_required_for_decay() {
        let clock = Arc::new(ManualTicker::new());
        let counter = counter(&clock);
        counter.add(1);
        clock.advance(Duration::from_secs(60));
        assert_eq!(counter.get(), 1);
        counter.check();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_custom_lifespan() {
        let clock = Arc::new(ManualTicker::new());
        let counter = counter(&clock);
        counter.add_with_lifespan(4, Duration::from_secs(5));
        clock.set(Duration::from_secs(6));
        counter.check();
        assert_eq!(counter.get(), 0);
    }
}

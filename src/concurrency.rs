//! Per-endpoint load accounting.
//!
//! A [`TaskConcurrency`] wraps one endpoint with its in-flight counter and,
//! depending on the [`SubStrategy`], a decaying secondary metric used to break
//! ties between equally loaded endpoints. Instances are shared by identity
//! through a [`ConcurrencyMap`], so every balancer built from the same builder
//! sees the same load.
//!
//! Balancers that keep endpoints in sorted order register a [`LoadWatcher`]
//! on each state they hold and are told whenever its load may have dropped,
//! wherever that drop came from.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::ticker::SharedTicker;
use crate::timed::{DecayingCounter, ScheduledCounter};

/// Tie-break policy among endpoints with equal concurrency.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SubStrategy {
    /// No secondary metric; ties go to whichever endpoint is seen first.
    #[default]
    Absent,
    /// Prefer the endpoint acquired least often within the look-back window.
    LeastFrequency,
    /// Prefer the endpoint with the lowest cumulative latency within the look-back window.
    LeastTime,
}

/// Penalty applied to an endpoint when a request against it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureSustain {
    /// How long the penalty lasts, measured from dispatch.
    pub duration: Duration,
    /// Synthetic in-flight units added for the duration.
    pub weight: u32,
}

/// Everything needed to create a [`TaskConcurrency`].
#[derive(Debug, Clone)]
pub struct ConcurrencySettings {
    pub sub_strategy: SubStrategy,
    pub look_back: Duration,
    pub num_windows: usize,
    pub failure_sustain: Option<FailureSustain>,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            sub_strategy: SubStrategy::Absent,
            look_back: Duration::from_secs(300),
            num_windows: 100,
            failure_sustain: None,
        }
    }
}

/// Identity of an endpoint handle: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(usize);

impl EndpointId {
    pub fn of<T>(endpoint: &Arc<T>) -> Self {
        Self(Arc::as_ptr(endpoint) as *const () as usize)
    }
}

/// Told when an endpoint's load may have dropped.
///
/// `at` is the ticker instant from which the lower load is visible: zero for
/// a drop that has already happened, or the due time of a scheduled penalty
/// removal. Called without any balancer lock held.
pub(crate) trait LoadWatcher: Send + Sync {
    fn load_dropped(&self, id: EndpointId, at: u64);
}

#[derive(Debug)]
enum TieBreak {
    Frequency(DecayingCounter),
    /// Cumulative latency in milliseconds.
    Latency(DecayingCounter),
}

impl TieBreak {
    fn counter(&self) -> &DecayingCounter {
        match self {
            TieBreak::Frequency(c) | TieBreak::Latency(c) => c,
        }
    }
}

struct Penalty {
    sustain: Duration,
    weight: i32,
    /// Delivers the negative weight back into the concurrency counter.
    removals: ScheduledCounter,
}

/// An endpoint together with its load state.
pub struct TaskConcurrency<T> {
    endpoint: Arc<T>,
    concurrency: Arc<AtomicI32>,
    disabled: AtomicBool,
    tie_break: Option<TieBreak>,
    penalty: Option<Penalty>,
    watchers: RwLock<Vec<Weak<dyn LoadWatcher>>>,
}

impl<T> TaskConcurrency<T> {
    /// Create load state for `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails when the configured window count is zero.
    pub fn new(
        endpoint: Arc<T>,
        settings: &ConcurrencySettings,
        ticker: SharedTicker,
    ) -> Result<Self> {
        let decaying = || {
            DecayingCounter::new(
                ScheduledCounter::builder()
                    .max_delay(settings.look_back)
                    .num_windows(settings.num_windows)
                    .ticker(ticker.clone()),
            )
        };
        let tie_break = match settings.sub_strategy {
            SubStrategy::Absent => None,
            SubStrategy::LeastFrequency => Some(TieBreak::Frequency(decaying()?)),
            SubStrategy::LeastTime => Some(TieBreak::Latency(decaying()?)),
        };

        let concurrency = Arc::new(AtomicI32::new(0));
        let penalty = match settings.failure_sustain {
            Some(sustain) => {
                let sink = concurrency.clone();
                let removals = ScheduledCounter::builder()
                    .max_delay(sustain.duration)
                    .num_windows(settings.num_windows)
                    .ticker(ticker.clone())
                    .build(move |n| {
                        sink.fetch_add(n as i32, AtomicOrdering::AcqRel);
                        Ok(())
                    })?;
                Some(Penalty {
                    sustain: sustain.duration,
                    weight: sustain.weight.min(i32::MAX as u32) as i32,
                    removals,
                })
            }
            None => None,
        };

        Ok(Self {
            endpoint,
            concurrency,
            disabled: AtomicBool::new(false),
            tie_break,
            penalty,
            watchers: RwLock::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> &Arc<T> {
        &self.endpoint
    }

    pub fn id(&self) -> EndpointId {
        EndpointId::of(&self.endpoint)
    }

    /// Net acquired-minus-completed units, including active failure penalties.
    pub fn concurrency(&self) -> i32 {
        self.concurrency.load(AtomicOrdering::Acquire)
    }

    /// Record `n` units dispatched to this endpoint.
    pub fn acquire(&self, n: i32) {
        self.concurrency.fetch_add(n, AtomicOrdering::AcqRel);
        if let Some(TieBreak::Frequency(frequency)) = &self.tie_break {
            frequency.add(i64::from(n));
        }
    }

    /// Record `n` units finished after `latency`.
    pub fn complete(&self, n: i32, latency: Duration) {
        if let Some(TieBreak::Latency(millis)) = &self.tie_break {
            millis.add(i64::try_from(latency.as_millis()).unwrap_or(i64::MAX));
        }
        self.concurrency.fetch_sub(n, AtomicOrdering::AcqRel);
        self.announce(0);
    }

    /// Penalize the endpoint for a request that failed after `latency`.
    ///
    /// The penalty is removed `sustain - latency` from now, so it ends as if
    /// the request had been held for the full sustain duration. Returns the
    /// instant (ticker nanoseconds) at which the removal becomes due, or
    /// `None` when no sustain is configured.
    pub fn penalize(&self, latency: Duration) -> Option<u64> {
        let penalty = self.penalty.as_ref()?;
        self.concurrency
            .fetch_add(penalty.weight, AtomicOrdering::AcqRel);
        let remaining = penalty.sustain.saturating_sub(latency);
        let due = penalty
            .removals
            .schedule_after(-i64::from(penalty.weight), remaining);
        debug!(weight = penalty.weight, ?remaining, "failure penalty applied");
        self.announce(due);
        Some(due)
    }

    /// Flush due scheduled adjustments so comparisons see current values.
    pub fn sync_state(&self) {
        if let Some(tie_break) = &self.tie_break {
            tie_break.counter().check();
        }
        if let Some(penalty) = &self.penalty {
            penalty.removals.check();
        }
    }

    /// Current decayed tie-break value; zero without a sub-strategy.
    pub fn tie_break_value(&self) -> u64 {
        self.tie_break
            .as_ref()
            .map_or(0, |t| t.counter().get() as u64)
    }

    pub fn set_disabled(&self, disabled: bool) {
        let was = self.disabled.swap(disabled, AtomicOrdering::AcqRel);
        if was && !disabled {
            self.announce(0);
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(AtomicOrdering::Acquire)
    }

    /// Whether a balancer may hand out this endpoint.
    ///
    /// False when disabled, or when the counter has been driven past
    /// `i32::MAX` and wrapped.
    pub fn is_available(&self) -> bool {
        !self.is_disabled() && self.concurrency() >= 0
    }

    /// Register `watcher` for load-drop notices. Registering twice is a no-op.
    pub(crate) fn watch(&self, watcher: Weak<dyn LoadWatcher>) {
        let mut watchers = self.watchers.write();
        watchers.retain(|w| w.strong_count() > 0);
        if !watchers.iter().any(|w| Weak::ptr_eq(w, &watcher)) {
            watchers.push(watcher);
        }
    }

    pub(crate) fn unwatch(&self, watcher: &Weak<dyn LoadWatcher>) {
        self.watchers
            .write()
            .retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, watcher));
    }

    fn announce(&self, at: u64) {
        // Collect first: watchers take their own locks, which may in turn
        // register watchers on this state.
        let live: Vec<Arc<dyn LoadWatcher>> = {
            let watchers = self.watchers.read();
            if watchers.is_empty() {
                return;
            }
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        let id = self.id();
        for watcher in live {
            watcher.load_dropped(id, at);
        }
    }

    /// Order by availability, then unsigned concurrency, then tie-break value.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.is_disabled()
            .cmp(&other.is_disabled())
            .then_with(|| (self.concurrency() as u32).cmp(&(other.concurrency() as u32)))
            .then_with(|| match (&self.tie_break, &other.tie_break) {
                (Some(TieBreak::Frequency(a)), Some(TieBreak::Frequency(b)))
                | (Some(TieBreak::Latency(a)), Some(TieBreak::Latency(b))) => {
                    (a.get() as u64).cmp(&(b.get() as u64))
                }
                _ => Ordering::Equal,
            })
    }
}

impl<T> fmt::Debug for TaskConcurrency<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConcurrency")
            .field("id", &self.id())
            .field("concurrency", &self.concurrency())
            .field("disabled", &self.is_disabled())
            .field("tie_break", &self.tie_break_value())
            .finish()
    }
}

/// Shared registry of load state, keyed by endpoint identity.
pub struct ConcurrencyMap<T> {
    settings: ConcurrencySettings,
    ticker: SharedTicker,
    entries: RwLock<HashMap<EndpointId, Arc<TaskConcurrency<T>>>>,
}

impl<T> ConcurrencyMap<T> {
    pub fn new(settings: ConcurrencySettings, ticker: SharedTicker) -> Self {
        Self {
            settings,
            ticker,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConcurrencySettings {
        &self.settings
    }

    pub fn ticker(&self) -> &SharedTicker {
        &self.ticker
    }

    /// Existing state for `endpoint`, if any balancer has registered it.
    pub fn get(&self, endpoint: &Arc<T>) -> Option<Arc<TaskConcurrency<T>>> {
        self.entries.read().get(&EndpointId::of(endpoint)).cloned()
    }

    /// State for `endpoint`, created on first use.
    pub fn get_or_create(&self, endpoint: &Arc<T>) -> Result<Arc<TaskConcurrency<T>>> {
        let id = EndpointId::of(endpoint);
        if let Some(existing) = self.entries.read().get(&id) {
            return Ok(existing.clone());
        }
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&id) {
            return Ok(existing.clone());
        }
        let created = Arc::new(TaskConcurrency::new(
            endpoint.clone(),
            &self.settings,
            self.ticker.clone(),
        )?);
        entries.insert(id, created.clone());
        Ok(created)
    }

    /// Drop state that no balancer or in-flight task holds any more.
    ///
    /// Returns the number of entries removed. An endpoint that comes back
    /// later starts from fresh state.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, state| Arc::strong_count(state) > 1);
        before - entries.len()
    }

    /// Resolve every endpoint, preserving order.
    pub fn resolve(&self, endpoints: &[Arc<T>]) -> Result<Vec<Arc<TaskConcurrency<T>>>> {
        endpoints.iter().map(|e| self.get_or_create(e)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T> fmt::Debug for ConcurrencyMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyMap")
            .field("settings", &self.settings)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::ManualTicker;

    fn make(
        settings: ConcurrencySettings,
    ) -> (Arc<ManualTicker>, TaskConcurrency<&'static str>) {
        let clock = Arc::new(ManualTicker::new());
        let tc = TaskConcurrency::new(Arc::new("a"), &settings, clock.clone()).unwrap();
        (clock, tc)
    }

    fn with_strategy(sub_strategy: SubStrategy) -> ConcurrencySettings {
        ConcurrencySettings {
            sub_strategy,
            ..Default::default()
        }
    }

    #[test]
    fn test_acquire_complete_balance() {
        let (_, tc) = make(ConcurrencySettings::default());
        tc.acquire(3);
        assert_eq!(tc.concurrency(), 3);
        tc.complete(2, Duration::from_millis(5));
        assert_eq!(tc.concurrency(), 1);
        assert_eq!(tc.tie_break_value(), 0);
    }

    #[test]
    fn test_unsigned_ordering_after_wrap() {
        let (_, a) = make(ConcurrencySettings::default());
        let (_, b) = make(ConcurrencySettings::default());
        a.acquire(i32::MAX);
        assert!(a.is_available());
        a.acquire(1); // wraps to i32::MIN
        assert!(!a.is_available());
        b.acquire(5);
        assert_eq!(a.compare(&b), Ordering::Greater);
    }

    #[test]
    fn test_disabled_sorts_last() {
        let (_, a) = make(ConcurrencySettings::default());
        let (_, b) = make(ConcurrencySettings::default());
        b.acquire(100);
        a.set_disabled(true);
        assert!(!a.is_available());
        assert_eq!(a.compare(&b), Ordering::Greater);
        a.set_disabled(false);
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn test_frequency_tie_break() {
        let (clock, a) = make(with_strategy(SubStrategy::LeastFrequency));
        let b = TaskConcurrency::new(
            Arc::new("b"),
            &with_strategy(SubStrategy::LeastFrequency),
            clock.clone(),
        )
        .unwrap();

        a.acquire(1);
        a.complete(1, Duration::ZERO);
        assert_eq!(a.tie_break_value(), 1);
        assert_eq!(a.compare(&b), Ordering::Greater);

        // Frequency decays after the look-back window
        clock.advance(Duration::from_secs(310));
        a.sync_state();
        assert_eq!(a.tie_break_value(), 0);
        assert_eq!(a.compare(&b), Ordering::Equal);
    }

    #[test]
    fn test_latency_tie_break_in_millis() {
        let (_, a) = make(with_strategy(SubStrategy::LeastTime));
        let (_, b) = make(with_strategy(SubStrategy::LeastTime));
        a.acquire(1);
        b.acquire(1);
        a.complete(1, Duration::from_millis(1500));
        b.complete(1, Duration::from_millis(20));
        assert_eq!(a.tie_break_value(), 1500);
        assert_eq!(b.compare(&a), Ordering::Less);
    }

    #[test]
    fn test_mixed_strategies_ignore_tie_break() {
        let (_, a) = make(with_strategy(SubStrategy::LeastTime));
        let (_, b) = make(with_strategy(SubStrategy::Absent));
        a.acquire(1);
        a.complete(1, Duration::from_secs(1));
        assert_eq!(a.compare(&b), Ordering::Equal);
    }

    #[test]
    fn test_failure_penalty_anchored_at_dispatch() {
        let settings = ConcurrencySettings {
            failure_sustain: Some(FailureSustain {
                duration: Duration::from_secs(30),
                weight: 4,
            }),
            ..Default::default()
        };
        let (clock, tc) = make(settings);
        tc.acquire(1);
        clock.advance(Duration::from_secs(15));
        tc.complete(1, Duration::from_secs(15));
        let due = tc.penalize(Duration::from_secs(15)).unwrap();
        assert_eq!(tc.concurrency(), 4);
        // 30s sustain in 100 windows of 300ms; 30s rounds up to 30.3s
        assert_eq!(due, Duration::from_millis(30_300).as_nanos() as u64);

        clock.set(Duration::from_secs(30));
        tc.sync_state();
        assert_eq!(tc.concurrency(), 4);

        clock.set(Duration::from_millis(30_300));
        tc.sync_state();
        assert_eq!(tc.concurrency(), 0);
    }

    #[test]
    fn test_penalize_without_sustain_is_noop() {
        let (_, tc) = make(ConcurrencySettings::default());
        assert_eq!(tc.penalize(Duration::ZERO), None);
        assert_eq!(tc.concurrency(), 0);
    }

    #[test]
    fn test_map_shares_by_identity() {
        let clock = Arc::new(ManualTicker::new());
        let map = ConcurrencyMap::new(ConcurrencySettings::default(), clock);
        let a = Arc::new(String::from("same"));
        let b = Arc::new(String::from("same"));

        let first = map.get_or_create(&a).unwrap();
        let again = map.get_or_create(&a.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // Equal values, different handles: tracked separately
        let other = map.get_or_create(&b).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(map.len(), 2);
        assert!(map.get(&Arc::new(String::from("same"))).is_none());
    }

    #[test]
    fn test_prune_keeps_held_state() {
        let clock = Arc::new(ManualTicker::new());
        let map = ConcurrencyMap::new(ConcurrencySettings::default(), clock);
        let kept = Arc::new(1);
        let dropped = Arc::new(2);
        let held = map.resolve(&[kept.clone(), dropped.clone()]).unwrap();
        assert_eq!(map.prune(), 0);

        let (keep, release): (Vec<_>, Vec<_>) =
            held.into_iter().partition(|s| Arc::ptr_eq(s.endpoint(), &kept));
        drop(release);
        assert_eq!(map.prune(), 1);
        assert_eq!(map.len(), 1);
        assert!(map.get(&kept).is_some());
        assert!(map.get(&dropped).is_none());
        drop(keep);
    }

    #[derive(Default)]
    struct Drops(parking_lot::Mutex<Vec<(EndpointId, u64)>>);

    impl LoadWatcher for Drops {
        fn load_dropped(&self, id: EndpointId, at: u64) {
            self.0.lock().push((id, at));
        }
    }

    #[test]
    fn test_watchers_hear_load_drops() {
        let settings = ConcurrencySettings {
            failure_sustain: Some(FailureSustain {
                duration: Duration::from_secs(30),
                weight: 1,
            }),
            ..Default::default()
        };
        let (_, tc) = make(settings);
        let drops = Arc::new(Drops::default());
        let weak: Weak<dyn LoadWatcher> = Arc::downgrade(&drops) as Weak<dyn LoadWatcher>;
        tc.watch(weak.clone());
        tc.watch(weak.clone());

        // Increases are not announced
        tc.acquire(2);
        tc.set_disabled(true);
        assert!(drops.0.lock().is_empty());

        tc.complete(1, Duration::ZERO);
        tc.set_disabled(false);
        let due = tc.penalize(Duration::ZERO).unwrap();
        assert_eq!(
            drops.0.lock().as_slice(),
            &[(tc.id(), 0), (tc.id(), 0), (tc.id(), due)]
        );

        tc.unwatch(&weak);
        tc.complete(1, Duration::ZERO);
        assert_eq!(drops.0.lock().len(), 3);
    }

    #[test]
    fn test_sub_strategy_serde_names() {
        let parsed: SubStrategy = serde_json::from_str("\"least_frequency\"").unwrap();
        assert_eq!(parsed, SubStrategy::LeastFrequency);
        assert_eq!(
            serde_json::to_string(&SubStrategy::LeastTime).unwrap(),
            "\"least_time\""
        );
    }
}

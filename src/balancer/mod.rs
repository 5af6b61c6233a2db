//! Least-concurrency selection.
//!
//! Two strategies implement [`LeastConcurrencyBalancer`]:
//!
//! - [`ArrayBalancer`]: partitions endpoints into bounded groups, picks a group
//!   at random weighted by size, then scans it for the least loaded endpoint.
//!   Selection cost is bounded by the group size.
//! - [`HeapBalancer`]: keeps every endpoint in one indexed priority queue and
//!   hands out the top. Selection is exact but serialized by one lock.
//!
//! Both return `None` when no endpoint is eligible; that is not an error.

mod array;
mod group;
mod heap;

pub use array::ArrayBalancer;
pub use group::{partition, WeightedSelector, WeightedSelectorBuilder};
pub use heap::HeapBalancer;

use std::marker::PhantomData;
use std::sync::Arc;

use crate::concurrency::TaskConcurrency;
use crate::config::HeddleConfig;
use crate::error::Result;
use crate::metrics::{LoadMetrics, LoadTracker};
use crate::task::{notify, CompletableTask, TaskListener};
use crate::ticker::SharedTicker;

/// Hands out the least loaded endpoint.
pub trait LeastConcurrencyBalancer<T>: Send + Sync {
    /// Dispatch one unit of work, or `None` when no endpoint is eligible.
    fn next(&self) -> Option<CompletableTask<T>>;

    /// Current load report.
    fn metrics(&self) -> LoadMetrics;
}

/// A balancer with no endpoints. Always returns `None` and reports zeros.
pub struct NoopBalancer<T> {
    _endpoint: PhantomData<fn() -> T>,
}

impl<T> NoopBalancer<T> {
    pub fn new() -> Self {
        Self {
            _endpoint: PhantomData,
        }
    }
}

impl<T> Default for NoopBalancer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for NoopBalancer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NoopBalancer")
    }
}

impl<T> LeastConcurrencyBalancer<T> for NoopBalancer<T> {
    fn next(&self) -> Option<CompletableTask<T>> {
        None
    }

    fn metrics(&self) -> LoadMetrics {
        LoadMetrics::default()
    }
}

/// Plumbing shared by both balancers: listeners, clock and load reporting.
pub(crate) struct BalancerCore<T> {
    listeners: Vec<Arc<dyn TaskListener<T>>>,
    ticker: SharedTicker,
    load: LoadTracker,
}

impl<T> BalancerCore<T> {
    pub(crate) fn new(
        config: &HeddleConfig,
        listeners: Vec<Arc<dyn TaskListener<T>>>,
        ticker: SharedTicker,
    ) -> Result<Self> {
        let load = LoadTracker::new(config, ticker.clone())?;
        Ok(Self {
            listeners,
            ticker,
            load,
        })
    }

    pub(crate) fn now_nanos(&self) -> u64 {
        self.ticker.now_nanos()
    }

    pub(crate) fn load(&self) -> &LoadTracker {
        &self.load
    }

    /// Record a dispatch that has already been acquired. Returns its timestamp.
    pub(crate) fn dispatched(&self, state: &Arc<TaskConcurrency<T>>) -> u64 {
        let now = self.now_nanos();
        self.load.on_request();
        notify(&self.listeners, "create", |l| l.on_create(state.endpoint()));
        now
    }

    pub(crate) fn exhausted(&self) {
        self.load.on_exhausted();
    }

    pub(crate) fn completed(&self, state: &Arc<TaskConcurrency<T>>, succeeded: bool) {
        self.load.on_complete(succeeded);
        notify(&self.listeners, "complete", |l| {
            l.on_complete(state.endpoint(), succeeded)
        });
    }

    pub(crate) fn report<'a, I>(&self, states: I) -> LoadMetrics
    where
        I: IntoIterator<Item = &'a Arc<TaskConcurrency<T>>>,
        T: 'a,
    {
        self.load
            .snapshot(states.into_iter().map(|s| i64::from(s.concurrency())))
    }
}

/// Pick the least loaded available entry, scanning from `start` and wrapping.
///
/// Earlier entries in scan order win ties.
pub(crate) fn least_loaded<T>(
    candidates: &[Arc<TaskConcurrency<T>>],
    start: usize,
) -> Option<&Arc<TaskConcurrency<T>>> {
    let len = candidates.len();
    let mut best: Option<&Arc<TaskConcurrency<T>>> = None;
    for i in 0..len {
        let candidate = &candidates[(start + i) % len];
        candidate.sync_state();
        if !candidate.is_available() {
            continue;
        }
        best = match best {
            Some(current) if candidate.compare(current).is_lt() => Some(candidate),
            None => Some(candidate),
            keep => keep,
        };
    }
    best
}

//! Grouped linear-scan balancer.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::Registry;
use rand::Rng;
use tracing::{debug, info};

use super::group::{partition, WeightedSelector};
use super::{least_loaded, BalancerCore, LeastConcurrencyBalancer};
use crate::concurrency::{ConcurrencyMap, TaskConcurrency};
use crate::config::HeddleConfig;
use crate::error::Result;
use crate::metrics::LoadMetrics;
use crate::task::{CompletableTask, CompletionSink, TaskListener};

type Group<T> = Vec<Arc<TaskConcurrency<T>>>;

/// Picks a group weighted by its size, then the least loaded endpoint in it.
///
/// Each call scans at most `group_size` endpoints, starting at a random
/// offset so ties do not always resolve to the same index. An endpoint that
/// is unavailable only shadows its own group: when every endpoint in the
/// chosen group is unavailable `next()` returns `None` even if other groups
/// have capacity.
pub struct ArrayBalancer<T> {
    shared: Arc<ArrayShared<T>>,
}

struct ArrayShared<T> {
    core: BalancerCore<T>,
    map: Arc<ConcurrencyMap<T>>,
    group_size: usize,
    groups: RwLock<WeightedSelector<Group<T>>>,
}

impl<T> ArrayShared<T> {
    fn layout(&self, endpoints: &[Arc<T>]) -> Result<WeightedSelector<Group<T>>> {
        let states = self.map.resolve(endpoints)?;
        let selector = partition(states.len(), self.group_size)
            .into_iter()
            .fold(WeightedSelector::builder(), |builder, range| {
                let weight = range.len() as u64;
                builder.add(states[range].to_vec(), weight)
            })
            .build();
        Ok(selector)
    }
}

impl<T: Send + Sync + 'static> ArrayBalancer<T> {
    pub(crate) fn new(
        config: &HeddleConfig,
        endpoints: &[Arc<T>],
        map: Arc<ConcurrencyMap<T>>,
        listeners: Vec<Arc<dyn TaskListener<T>>>,
    ) -> Result<Self> {
        let core = BalancerCore::new(config, listeners, map.ticker().clone())?;
        let shared = ArrayShared {
            core,
            map,
            group_size: config.group_size,
            groups: RwLock::new(WeightedSelector::builder().build()),
        };
        let groups = shared.layout(endpoints)?;
        info!(
            endpoints = endpoints.len(),
            groups = groups.len(),
            group_size = config.group_size,
            "built array balancer"
        );
        *shared.groups.write() = groups;
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Replace the endpoint set and recompute the groups.
    ///
    /// Load state is looked up by identity, so endpoints that were already
    /// known keep their in-flight counts. State of endpoints no balancer
    /// holds any more is dropped.
    pub fn update_endpoints(&self, endpoints: &[Arc<T>]) -> Result<()> {
        let groups = self.shared.layout(endpoints)?;
        let num_groups = groups.len();
        // Old groups must be gone before pruning sees who still holds state
        drop(std::mem::replace(&mut *self.shared.groups.write(), groups));
        let pruned = self.shared.map.prune();
        debug!(
            endpoints = endpoints.len(),
            groups = num_groups,
            pruned,
            "recomputed endpoint groups"
        );
        Ok(())
    }

    pub(crate) fn register(&self, registry: &Registry) {
        self.shared.core.load().register(registry);
    }

    pub fn num_groups(&self) -> usize {
        self.shared.groups.read().len()
    }

    /// Sizes of the current groups, in order.
    pub fn group_sizes(&self) -> Vec<usize> {
        self.shared
            .groups
            .read()
            .items()
            .iter()
            .map(Vec::len)
            .collect()
    }
}

impl<T: Send + Sync + 'static> LeastConcurrencyBalancer<T> for ArrayBalancer<T> {
    fn next(&self) -> Option<CompletableTask<T>> {
        let chosen = {
            let groups = self.shared.groups.read();
            let mut rng = rand::thread_rng();
            groups.select(&mut rng).and_then(|group| {
                let start = rng.gen_range(0..group.len());
                least_loaded(group, start).cloned()
            })
        };
        let Some(state) = chosen else {
            self.shared.core.exhausted();
            return None;
        };

        state.acquire(1);
        let dispatched_at = self.shared.core.dispatched(&state);
        let sink: Arc<dyn CompletionSink<T>> = self.shared.clone();
        Some(CompletableTask::tracked(state, dispatched_at, sink))
    }

    fn metrics(&self) -> LoadMetrics {
        let groups = self.shared.groups.read();
        self.shared.core.report(groups.items().iter().flatten())
    }
}

impl<T: Send + Sync> CompletionSink<T> for ArrayShared<T> {
    fn now_nanos(&self) -> u64 {
        self.core.now_nanos()
    }

    fn completed(&self, state: &Arc<TaskConcurrency<T>>, succeeded: bool) {
        // Scans sync every candidate, so expiring penalties need no wakeup here
        self.core.completed(state, succeeded);
    }
}

impl<T> fmt::Debug for ArrayBalancer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self.shared.groups.read();
        f.debug_struct("ArrayBalancer")
            .field("group_size", &self.shared.group_size)
            .field("groups", &groups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::ManualTicker;

    fn balancer(len: usize, group_size: usize) -> (Vec<Arc<usize>>, ArrayBalancer<usize>) {
        let config = HeddleConfig {
            group_size,
            ..Default::default()
        };
        let map = Arc::new(ConcurrencyMap::new(
            config.concurrency_settings(),
            Arc::new(ManualTicker::new()),
        ));
        let endpoints: Vec<_> = (0..len).map(Arc::new).collect();
        let balancer = ArrayBalancer::new(&config, &endpoints, map, Vec::new()).unwrap();
        (endpoints, balancer)
    }

    #[test]
    fn test_group_layout() {
        let (_, b) = balancer(8, 3);
        assert_eq!(b.group_sizes(), vec![3, 3, 2]);

        let (_, b) = balancer(21, 10);
        assert_eq!(b.group_sizes(), vec![7, 7, 7]);

        let (_, b) = balancer(0, 10);
        assert_eq!(b.num_groups(), 0);
        assert!(b.next().is_none());
    }

    #[test]
    fn test_single_endpoint() {
        let (endpoints, b) = balancer(1, 64);
        for _ in 0..10 {
            let task = b.next().unwrap();
            assert!(Arc::ptr_eq(task.endpoint(), &endpoints[0]));
        }
    }

    #[test]
    fn test_update_endpoints_keeps_load() {
        let (mut endpoints, b) = balancer(2, 64);
        let held: Vec<_> = (0..4).filter_map(|_| b.next()).collect();
        assert_eq!(held.len(), 4);

        endpoints.push(Arc::new(99));
        b.update_endpoints(&endpoints).unwrap();
        assert_eq!(b.group_sizes(), vec![3]);

        // The newcomer has no load and wins the next two picks
        let task = b.next().unwrap();
        assert_eq!(**task.endpoint(), 99);
        let task = b.next().unwrap();
        assert_eq!(**task.endpoint(), 99);
    }
}

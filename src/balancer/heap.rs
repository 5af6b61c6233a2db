//! Global-minimum balancer over an indexed priority queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use prometheus::Registry;
use tracing::{debug, info};

use super::{BalancerCore, LeastConcurrencyBalancer};
use crate::concurrency::{ConcurrencyMap, EndpointId, LoadWatcher, TaskConcurrency};
use crate::config::HeddleConfig;
use crate::error::Result;
use crate::metrics::LoadMetrics;
use crate::queue::{Comparator, IndexedPriorityQueue};
use crate::task::{CompletableTask, CompletionSink, TaskListener};

/// Queue element keyed by the identity of its load state.
struct Entry<T>(Arc<TaskConcurrency<T>>);

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Entry(self.0.clone())
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Hash for Entry<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

#[derive(Clone, Copy, Default)]
struct EntryOrder;

impl<T> Comparator<Entry<T>> for EntryOrder {
    fn compare(&self, a: &Entry<T>, b: &Entry<T>) -> Ordering {
        a.0.compare(&b.0)
    }
}

/// A pending re-sift for an endpoint whose failure penalty expires at `due`.
#[derive(Debug, PartialEq, Eq)]
struct Wakeup {
    due: u64,
    id: EndpointId,
}

impl PartialOrd for Wakeup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wakeup {
    // Earliest due first out of the max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct HeapState<T> {
    queue: IndexedPriorityQueue<Entry<T>, EntryOrder>,
    by_id: HashMap<EndpointId, Entry<T>>,
    wakeups: BinaryHeap<Wakeup>,
}

impl<T> HeapState<T> {
    fn new() -> Self {
        Self {
            queue: IndexedPriorityQueue::with_comparator(EntryOrder),
            by_id: HashMap::new(),
            wakeups: BinaryHeap::new(),
        }
    }

    /// Sync one entry and move it to its current place.
    fn resift(&mut self, id: EndpointId) {
        if let Some(entry) = self.by_id.get(&id).cloned() {
            entry.0.sync_state();
            self.queue.offer(entry);
        }
    }

    /// Re-sift entries whose penalty has expired by `now`.
    fn wake(&mut self, now: u64) {
        while self.wakeups.peek().is_some_and(|w| w.due <= now) {
            let Some(Wakeup { id, .. }) = self.wakeups.pop() else {
                break;
            };
            self.resift(id);
        }
    }

    /// Sync the top until it stops moving.
    ///
    /// Load that rose elsewhere (another balancer sharing the endpoint, an
    /// administrative disable) leaves a stale key that is too low; each
    /// round sinks such a top. At most `len` rounds run.
    fn settle(&mut self) -> Option<Arc<TaskConcurrency<T>>> {
        for _ in 0..self.queue.len() {
            let top = self.queue.peek()?.clone();
            top.0.sync_state();
            self.queue.offer(top.clone());
            if self.queue.peek() == Some(&top) {
                break;
            }
        }
        self.queue.peek().map(|e| e.0.clone())
    }

    /// Sync and re-sift every entry.
    fn refresh(&mut self) {
        let entries: Vec<_> = self.queue.iter().cloned().collect();
        for entry in entries {
            entry.0.sync_state();
            self.queue.offer(entry);
        }
    }

    /// Swap in a new endpoint set. Returns the states that left it.
    fn replace(&mut self, states: Vec<Arc<TaskConcurrency<T>>>) -> Vec<Arc<TaskConcurrency<T>>> {
        self.queue.clear();
        let mut previous = std::mem::take(&mut self.by_id);
        for state in states {
            let entry = Entry(state);
            previous.remove(&entry.0.id());
            self.by_id.insert(entry.0.id(), entry.clone());
            self.queue.offer(entry);
        }
        let by_id = &self.by_id;
        self.wakeups.retain(|w| by_id.contains_key(&w.id));
        previous.into_values().map(|e| e.0).collect()
    }
}

struct HeapShared<T> {
    core: BalancerCore<T>,
    map: Arc<ConcurrencyMap<T>>,
    state: Mutex<HeapState<T>>,
}

impl<T: Send + Sync + 'static> HeapShared<T> {
    /// Replace the endpoint set and subscribe to load drops of its members.
    fn install(self: &Arc<Self>, states: Vec<Arc<TaskConcurrency<T>>>) {
        let watcher: Weak<dyn LoadWatcher> = Arc::downgrade(self) as Weak<dyn LoadWatcher>;
        for state in &states {
            state.watch(watcher.clone());
        }
        let departed = self.state.lock().replace(states);
        for state in departed {
            state.unwatch(&watcher);
        }
    }
}

/// Hands out the globally least loaded endpoint.
///
/// Every endpoint lives in one [`IndexedPriorityQueue`]. `next()` peeks the
/// top, acquires it and sifts it back into place. Each endpoint tells the
/// balancer when its load drops (a completion through any balancer, a
/// re-enable, an expiring failure penalty) and the entry is re-sifted, so a
/// second balancer sharing the endpoint never hides spare capacity. Load that
/// rises elsewhere is caught when the entry reaches the top. Only decaying
/// tie-break values can go stale deeper in the queue;
/// [`refresh`](HeapBalancer::refresh) re-sorts everything.
pub struct HeapBalancer<T> {
    shared: Arc<HeapShared<T>>,
}

impl<T: Send + Sync + 'static> HeapBalancer<T> {
    pub(crate) fn new(
        config: &HeddleConfig,
        endpoints: &[Arc<T>],
        map: Arc<ConcurrencyMap<T>>,
        listeners: Vec<Arc<dyn TaskListener<T>>>,
    ) -> Result<Self> {
        let core = BalancerCore::new(config, listeners, map.ticker().clone())?;
        let states = map.resolve(endpoints)?;
        let shared = Arc::new(HeapShared {
            core,
            map,
            state: Mutex::new(HeapState::new()),
        });
        shared.install(states);
        info!(endpoints = shared.state.lock().queue.len(), "built heap balancer");
        Ok(Self { shared })
    }

    /// Replace the endpoint set and rebuild the queue.
    ///
    /// Endpoints that were already known keep their load state. State of
    /// endpoints no balancer holds any more is dropped.
    pub fn update_endpoints(&self, endpoints: &[Arc<T>]) -> Result<()> {
        let states = self.shared.map.resolve(endpoints)?;
        self.shared.install(states);
        let pruned = self.shared.map.prune();
        debug!(endpoints = self.len(), pruned, "rebuilt endpoint queue");
        Ok(())
    }

    pub(crate) fn register(&self, registry: &Registry) {
        self.shared.core.load().register(registry);
    }

    /// Re-sift every endpoint against its current load and tie-break value.
    pub fn refresh(&self) {
        self.shared.state.lock().refresh();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }
}

impl<T: Send + Sync + 'static> LeastConcurrencyBalancer<T> for HeapBalancer<T> {
    fn next(&self) -> Option<CompletableTask<T>> {
        let chosen = {
            let mut state = self.shared.state.lock();
            state.wake(self.shared.core.now_nanos());
            match state.settle() {
                Some(top) if top.is_available() => {
                    top.acquire(1);
                    state.queue.offer(Entry(top.clone()));
                    Some(top)
                }
                _ => None,
            }
        };
        let Some(top) = chosen else {
            self.shared.core.exhausted();
            return None;
        };

        let dispatched_at = self.shared.core.dispatched(&top);
        let sink: Arc<dyn CompletionSink<T>> = self.shared.clone();
        Some(CompletableTask::tracked(top, dispatched_at, sink))
    }

    fn metrics(&self) -> LoadMetrics {
        let states: Vec<_> = {
            let state = self.shared.state.lock();
            state.queue.iter().map(|e| e.0.clone()).collect()
        };
        self.shared.core.report(&states)
    }
}

impl<T: Send + Sync> CompletionSink<T> for HeapShared<T> {
    fn now_nanos(&self) -> u64 {
        self.core.now_nanos()
    }

    fn completed(&self, state: &Arc<TaskConcurrency<T>>, succeeded: bool) {
        // The entry was already re-sifted through its load-drop notice
        self.core.completed(state, succeeded);
    }
}

impl<T: Send + Sync> LoadWatcher for HeapShared<T> {
    fn load_dropped(&self, id: EndpointId, at: u64) {
        let now = self.core.now_nanos();
        let mut state = self.state.lock();
        if !state.by_id.contains_key(&id) {
            return;
        }
        state.wake(now);
        if at <= now {
            state.resift(id);
        } else {
            state.wakeups.push(Wakeup { due: at, id });
        }
    }
}

impl<T> fmt::Debug for HeapBalancer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HeapBalancer")
            .field("endpoints", &state.queue.len())
            .field("wakeups", &state.wakeups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::ManualTicker;

    fn balancer(len: usize) -> (Vec<Arc<usize>>, HeapBalancer<usize>) {
        let config = HeddleConfig::default();
        let map = Arc::new(ConcurrencyMap::new(
            config.concurrency_settings(),
            Arc::new(ManualTicker::new()),
        ));
        let endpoints: Vec<_> = (0..len).map(Arc::new).collect();
        let balancer = HeapBalancer::new(&config, &endpoints, map, Vec::new()).unwrap();
        (endpoints, balancer)
    }

    fn state_of(b: &HeapBalancer<usize>, endpoint: &Arc<usize>) -> Arc<TaskConcurrency<usize>> {
        b.shared.map.get(endpoint).unwrap()
    }

    #[test]
    fn test_empty_heap() {
        let (_, b) = balancer(0);
        assert!(b.is_empty());
        assert!(b.next().is_none());
    }

    #[test]
    fn test_queue_stays_valid() {
        let (_, b) = balancer(16);
        let mut held = Vec::new();
        for i in 0..200 {
            let task = b.next().unwrap();
            if i % 3 == 0 {
                task.complete_with(i % 2 == 0);
            } else {
                held.push(task);
            }
            assert_eq!(b.shared.state.lock().queue.validate(), Ok(()));
        }
        for task in held {
            task.complete();
        }
        assert_eq!(b.shared.state.lock().queue.validate(), Ok(()));
    }

    #[test]
    fn test_disabled_top_is_skipped() {
        let (endpoints, b) = balancer(2);
        state_of(&b, &endpoints[0]).set_disabled(true);
        for _ in 0..5 {
            let task = b.next().unwrap();
            assert_eq!(**task.endpoint(), 1);
            task.complete();
        }
    }

    #[test]
    fn test_reenabled_entry_is_found() {
        let (endpoints, b) = balancer(2);
        let first = state_of(&b, &endpoints[0]);
        let second = state_of(&b, &endpoints[1]);
        first.set_disabled(true);
        second.set_disabled(true);
        assert!(b.next().is_none());

        second.set_disabled(false);
        let task = b.next().unwrap();
        assert_eq!(**task.endpoint(), 1);
    }

    #[test]
    fn test_update_endpoints_rebuilds_queue() {
        let (mut endpoints, b) = balancer(3);
        assert_eq!(b.shared.map.len(), 3);
        endpoints.truncate(1);
        b.update_endpoints(&endpoints).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.shared.map.len(), 1);
        for _ in 0..3 {
            assert_eq!(**b.next().unwrap().endpoint(), 0);
        }
    }

    #[test]
    fn test_departed_endpoint_stops_notifying() {
        let (endpoints, b) = balancer(2);
        let departed = state_of(&b, &endpoints[1]);
        b.update_endpoints(&endpoints[..1]).unwrap();

        departed.acquire(1);
        departed.complete(1, std::time::Duration::ZERO);
        assert!(!b.shared.state.lock().by_id.contains_key(&departed.id()));
        assert_eq!(**b.next().unwrap().endpoint(), 0);
    }

    #[test]
    fn test_outside_load_drop_is_seen() {
        let (endpoints, b) = balancer(64);
        let last = state_of(&b, &endpoints[63]);
        last.acquire(50);

        let held: Vec<_> = (0..192).map(|_| b.next().unwrap()).collect();
        assert!(held.iter().all(|t| **t.endpoint() != 63));
        assert_eq!(b.shared.state.lock().queue.validate(), Ok(()));

        // Work dispatched elsewhere finishes; endpoint 63 is now the idlest
        last.complete(50, std::time::Duration::ZERO);
        for _ in 0..3 {
            assert_eq!(**b.next().unwrap().endpoint(), 63);
        }
        drop(held);
    }

    #[test]
    fn test_refresh_sorts_outside_increases() {
        let (endpoints, b) = balancer(8);
        for endpoint in &endpoints[..7] {
            state_of(&b, endpoint).acquire(2);
        }
        assert_ne!(b.shared.state.lock().queue.validate(), Ok(()));
        b.refresh();
        assert_eq!(b.shared.state.lock().queue.validate(), Ok(()));
        assert_eq!(**b.next().unwrap().endpoint(), 7);
    }

    #[test]
    fn test_reenable_after_exhaustion() {
        let (endpoints, b) = balancer(4);
        for endpoint in &endpoints {
            state_of(&b, endpoint).set_disabled(true);
        }
        assert!(b.next().is_none());
        assert!(b.next().is_none());

        state_of(&b, &endpoints[2]).set_disabled(false);
        assert_eq!(**b.next().unwrap().endpoint(), 2);
    }
}

//! Dispatch handles and lifecycle listeners.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::concurrency::TaskConcurrency;

/// Observer of task lifecycle events.
///
/// Both methods default to doing nothing. A panicking listener is logged and
/// otherwise ignored; it never affects balancer state.
pub trait TaskListener<T>: Send + Sync {
    /// An endpoint was handed out by `next()`.
    fn on_create(&self, _endpoint: &Arc<T>) {}

    /// A task was completed for the first time.
    fn on_complete(&self, _endpoint: &Arc<T>, _succeeded: bool) {}
}

/// Run a listener callback, containing any panic it raises.
pub(crate) fn notify<T, F>(listeners: &[Arc<dyn TaskListener<T>>], event: &'static str, f: F)
where
    F: Fn(&dyn TaskListener<T>),
{
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
            warn!(event, "task listener panicked");
        }
    }
}

/// Receives completions on behalf of the balancer that created the task.
pub(crate) trait CompletionSink<T>: Send + Sync {
    fn now_nanos(&self) -> u64;

    /// Called once per task after its load state has been updated.
    fn completed(&self, state: &Arc<TaskConcurrency<T>>, succeeded: bool);
}

enum Kind<T> {
    Noop(Arc<T>),
    Tracked {
        state: Arc<TaskConcurrency<T>>,
        dispatched_at: u64,
        completed: AtomicBool,
        sink: Arc<dyn CompletionSink<T>>,
    },
}

/// Handle for one unit of work dispatched to an endpoint.
///
/// Completing the task releases the endpoint's load. Only the first
/// completion has any effect; later calls return `false`.
pub struct CompletableTask<T> {
    kind: Kind<T>,
}

impl<T> CompletableTask<T> {
    /// A task that tracks nothing. Every completion reports success.
    pub fn noop(endpoint: Arc<T>) -> Self {
        Self {
            kind: Kind::Noop(endpoint),
        }
    }

    pub(crate) fn tracked(
        state: Arc<TaskConcurrency<T>>,
        dispatched_at: u64,
        sink: Arc<dyn CompletionSink<T>>,
    ) -> Self {
        Self {
            kind: Kind::Tracked {
                state,
                dispatched_at,
                completed: AtomicBool::new(false),
                sink,
            },
        }
    }

    /// The endpoint this task was dispatched to.
    pub fn endpoint(&self) -> &Arc<T> {
        match &self.kind {
            Kind::Noop(endpoint) => endpoint,
            Kind::Tracked { state, .. } => state.endpoint(),
        }
    }

    /// Complete successfully, measuring latency from dispatch.
    pub fn complete(&self) -> bool {
        self.complete_with(true)
    }

    /// Complete with the given outcome, measuring latency from dispatch.
    pub fn complete_with(&self, succeeded: bool) -> bool {
        match &self.kind {
            Kind::Noop(_) => true,
            Kind::Tracked {
                dispatched_at,
                sink,
                ..
            } => {
                let elapsed = sink.now_nanos().saturating_sub(*dispatched_at);
                self.finish(succeeded, Duration::from_nanos(elapsed))
            }
        }
    }

    /// Complete with the given outcome and a caller-measured latency.
    pub fn complete_with_latency(&self, succeeded: bool, latency: Duration) -> bool {
        self.finish(succeeded, latency)
    }

    pub fn is_completed(&self) -> bool {
        match &self.kind {
            Kind::Noop(_) => false,
            Kind::Tracked { completed, .. } => completed.load(Ordering::Acquire),
        }
    }

    fn finish(&self, succeeded: bool, latency: Duration) -> bool {
        let Kind::Tracked {
            state,
            completed,
            sink,
            ..
        } = &self.kind
        else {
            return true;
        };
        if completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if !succeeded {
            state.penalize(latency);
        }
        state.complete(1, latency);
        sink.completed(state, succeeded);
        true
    }
}

impl<T> fmt::Debug for CompletableTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Noop(_) => f.debug_struct("CompletableTask").field("noop", &true).finish(),
            Kind::Tracked {
                state,
                dispatched_at,
                completed,
                ..
            } => f
                .debug_struct("CompletableTask")
                .field("state", state)
                .field("dispatched_at", dispatched_at)
                .field("completed", &completed.load(Ordering::Acquire))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{ConcurrencySettings, FailureSustain};
    use crate::ticker::{ManualTicker, Ticker};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        now: ManualTicker,
        events: Mutex<Vec<(bool, i32)>>,
    }

    impl CompletionSink<&'static str> for Recorder {
        fn now_nanos(&self) -> u64 {
            self.now.now_nanos()
        }

        fn completed(&self, state: &Arc<TaskConcurrency<&'static str>>, succeeded: bool) {
            self.events.lock().push((succeeded, state.concurrency()));
        }
    }

    fn state(settings: &ConcurrencySettings) -> Arc<TaskConcurrency<&'static str>> {
        Arc::new(
            TaskConcurrency::new(Arc::new("a"), settings, Arc::new(ManualTicker::new())).unwrap(),
        )
    }

    #[test]
    fn test_noop_task() {
        let task = CompletableTask::noop(Arc::new("a"));
        assert_eq!(**task.endpoint(), "a");
        assert!(task.complete_with(true));
        assert!(task.complete());
        assert!(!task.is_completed());
    }

    #[test]
    fn test_completes_once() {
        let recorder = Arc::new(Recorder::default());
        let tc = state(&ConcurrencySettings::default());
        tc.acquire(1);
        let task = CompletableTask::tracked(tc.clone(), 0, recorder.clone());

        assert!(task.complete());
        assert!(task.is_completed());
        assert_eq!(tc.concurrency(), 0);

        assert!(!task.complete());
        assert!(!task.complete_with(false));
        assert_eq!(tc.concurrency(), 0);
        assert_eq!(recorder.events.lock().as_slice(), &[(true, 0)]);
    }

    #[test]
    fn test_failure_penalty_precedes_sink() {
        let settings = ConcurrencySettings {
            failure_sustain: Some(FailureSustain {
                duration: Duration::from_secs(30),
                weight: 1,
            }),
            ..Default::default()
        };
        let recorder = Arc::new(Recorder::default());
        let tc = state(&settings);
        tc.acquire(1);
        let task = CompletableTask::tracked(tc.clone(), 0, recorder.clone());

        assert!(task.complete_with_latency(false, Duration::from_secs(1)));
        assert_eq!(tc.concurrency(), 1);
        // The sink already sees the penalty in place
        assert_eq!(recorder.events.lock().as_slice(), &[(false, 1)]);
    }

    struct Panicky;

    impl TaskListener<&'static str> for Panicky {
        fn on_create(&self, _endpoint: &Arc<&'static str>) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_listener_panic_contained() {
        let listeners: Vec<Arc<dyn TaskListener<&'static str>>> = vec![Arc::new(Panicky)];
        let endpoint = Arc::new("a");
        notify(&listeners, "create", |l| l.on_create(&endpoint));
    }
}

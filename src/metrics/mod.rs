//! Load reporting for balancers.
//!
//! Every balancer feeds its lifecycle events into a [`LoadTracker`], which
//! keeps windowed rates and Prometheus counters. [`LoadMetrics`] is the
//! read-only snapshot returned by
//! [`LeastConcurrencyBalancer::metrics`](crate::LeastConcurrencyBalancer::metrics).
//!
//! # Available Metrics
//!
//! ## Gauges
//!
//! - `heddle_inflight` - Tasks dispatched and not yet completed
//! - `heddle_request_rate` - Requests per second over the rate window
//! - `heddle_request_cov` - Coefficient of variation of in-flight load
//!
//! ## Counters
//!
//! - `heddle_requests_total` - Tasks dispatched
//! - `heddle_successes_total` - Successful completions
//! - `heddle_failures_total` - Failed completions
//! - `heddle_exhausted_total` - Selections with no eligible endpoint

mod meter;
mod prometheus;
mod sampler;

pub use self::meter::{IntervalLimiter, Meter};
pub use self::prometheus::HeddleMetrics;
pub use self::sampler::ReservoirSampler;

use std::time::Duration;

use ::prometheus::Registry;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::HeddleConfig;
use crate::error::Result;
use crate::ticker::SharedTicker;

/// Point-in-time load report of one balancer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadMetrics {
    /// Tasks dispatched per second over the rate window.
    pub request_rate: f64,
    /// Successful completions per second over the rate window.
    pub success_rate: f64,
    /// Failed completions per second over the rate window.
    pub failure_rate: f64,
    /// Standard deviation over mean of in-flight load across endpoints.
    /// Zero when nothing is in flight.
    pub request_cov: f64,
}

/// Collects lifecycle events of one balancer.
#[derive(Debug)]
pub(crate) struct LoadTracker {
    requests: Meter,
    successes: Meter,
    failures: Meter,
    sampler: Mutex<ReservoirSampler<i64>>,
    publish: IntervalLimiter,
    prometheus: HeddleMetrics,
}

impl LoadTracker {
    pub(crate) fn new(config: &HeddleConfig, ticker: SharedTicker) -> Result<Self> {
        let window = Duration::from_millis(config.rate_window_ms);
        let meter = || Meter::new(window, config.num_windows, ticker.clone());
        Ok(Self {
            requests: meter()?,
            successes: meter()?,
            failures: meter()?,
            sampler: Mutex::new(ReservoirSampler::new(config.cov_sample_size)),
            publish: IntervalLimiter::new(window, ticker.clone()),
            prometheus: HeddleMetrics::with_prefix(&config.metrics_prefix),
        })
    }

    /// Expose the Prometheus metrics through `registry`, logging on failure.
    pub(crate) fn register(&self, registry: &Registry) {
        if let Err(e) = self.prometheus.register(registry) {
            warn!(%e, "failed to register prometheus metrics");
        }
    }

    pub(crate) fn prometheus(&self) -> &HeddleMetrics {
        &self.prometheus
    }

    pub(crate) fn on_request(&self) {
        self.requests.mark(1);
        self.prometheus.record_request();
        if self.publish.try_acquire().is_some() {
            self.prometheus.request_rate.set(self.requests.rate());
        }
    }

    pub(crate) fn on_complete(&self, succeeded: bool) {
        if succeeded {
            self.successes.mark(1);
        } else {
            self.failures.mark(1);
        }
        self.prometheus.record_completion(succeeded);
    }

    pub(crate) fn on_exhausted(&self) {
        self.prometheus.record_exhausted();
    }

    /// Build a report, sampling in-flight load from `loads`.
    pub(crate) fn snapshot<I>(&self, loads: I) -> LoadMetrics
    where
        I: IntoIterator<Item = i64>,
    {
        let request_cov = {
            let mut sampler = self.sampler.lock();
            sampler.reset();
            for load in loads {
                sampler.sample(load.max(0));
            }
            coefficient_of_variation(sampler.samples())
        };
        let request_rate = self.requests.rate();
        self.prometheus.request_rate.set(request_rate);
        self.prometheus.request_cov.set(request_cov);

        LoadMetrics {
            request_rate,
            success_rate: self.successes.rate(),
            failure_rate: self.failures.rate(),
            request_cov,
        }
    }
}

/// Population standard deviation divided by the mean; zero for a zero mean.
pub fn coefficient_of_variation(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt() / mean
}

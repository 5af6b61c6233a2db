//! Prometheus metrics for balancer observability.
//!
//! Counters are plain atomics and work without a [`Registry`]; registering
//! them is only needed for exposition.
//!
//! # Usage
//!
//! ```ignore
//! let registry = prometheus::Registry::new();
//! let balancer = HeddleBuilder::new()
//!     .endpoints(endpoints)
//!     .prometheus_registry(registry.clone())
//!     .build_heap()?;
//!
//! let encoder = prometheus::TextEncoder::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for one balancer.
#[derive(Clone)]
pub struct HeddleMetrics {
    // === Gauges ===
    /// Tasks handed out and not yet completed
    pub inflight: IntGauge,

    /// Requests per second over the rate window
    pub request_rate: Gauge,

    /// Coefficient of variation of in-flight load across endpoints
    pub request_cov: Gauge,

    // === Counters ===
    /// Tasks handed out
    pub requests: IntCounter,

    /// Tasks completed successfully
    pub successes: IntCounter,

    /// Tasks completed with a failure
    pub failures: IntCounter,

    /// `next()` calls that found no eligible endpoint
    pub exhausted: IntCounter,
}

impl Default for HeddleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HeddleMetrics {
    /// Create metrics with the default prefix "heddle".
    pub fn new() -> Self {
        Self::with_prefix("heddle")
    }

    /// Create metrics named `{prefix}_requests_total`, `{prefix}_inflight`, etc.
    ///
    /// Characters that are not valid in a Prometheus metric name are replaced
    /// with underscores, so `"my-app"` yields `my_app_requests_total`.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = sanitize_prefix(prefix);
        Self {
            inflight: IntGauge::with_opts(Opts::new(
                format!("{}_inflight", prefix),
                "Tasks dispatched and not yet completed",
            ))
            .expect("metric creation should not fail"),

            request_rate: Gauge::with_opts(Opts::new(
                format!("{}_request_rate", prefix),
                "Requests per second over the rate window",
            ))
            .expect("metric creation should not fail"),

            request_cov: Gauge::with_opts(Opts::new(
                format!("{}_request_cov", prefix),
                "Coefficient of variation of in-flight load across endpoints",
            ))
            .expect("metric creation should not fail"),

            requests: IntCounter::with_opts(Opts::new(
                format!("{}_requests_total", prefix),
                "Tasks dispatched",
            ))
            .expect("metric creation should not fail"),

            successes: IntCounter::with_opts(Opts::new(
                format!("{}_successes_total", prefix),
                "Tasks completed successfully",
            ))
            .expect("metric creation should not fail"),

            failures: IntCounter::with_opts(Opts::new(
                format!("{}_failures_total", prefix),
                "Tasks completed with a failure",
            ))
            .expect("metric creation should not fail"),

            exhausted: IntCounter::with_opts(Opts::new(
                format!("{}_exhausted_total", prefix),
                "Selections that found no eligible endpoint",
            ))
            .expect("metric creation should not fail"),
        }
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.inflight.clone()))?;
        registry.register(Box::new(self.request_rate.clone()))?;
        registry.register(Box::new(self.request_cov.clone()))?;
        registry.register(Box::new(self.requests.clone()))?;
        registry.register(Box::new(self.successes.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.exhausted.clone()))?;
        Ok(())
    }

    #[inline]
    pub fn record_request(&self) {
        self.requests.inc();
        self.inflight.inc();
    }

    #[inline]
    pub fn record_completion(&self, succeeded: bool) {
        if succeeded {
            self.successes.inc();
        } else {
            self.failures.inc();
        }
        self.inflight.dec();
    }

    #[inline]
    pub fn record_exhausted(&self) {
        self.exhausted.inc();
    }
}

fn sanitize_prefix(prefix: &str) -> String {
    // Valid chars: [a-zA-Z_:] for first char, [a-zA-Z0-9_:] for rest
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let valid = c.is_ascii_alphabetic() || c == '_' || c == ':';
            if valid || (i > 0 && c.is_ascii_digit()) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl std::fmt::Debug for HeddleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeddleMetrics")
            .field("inflight", &self.inflight.get())
            .field("requests", &self.requests.get())
            .field("successes", &self.successes.get())
            .field("failures", &self.failures.get())
            .finish()
    }
}

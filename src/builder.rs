//! Builder for heddle balancers.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap
//!
//! Endpoints, listeners, the time source and the Prometheus registry are not
//! serializable and are set directly.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;

use crate::balancer::{ArrayBalancer, HeapBalancer};
use crate::concurrency::{ConcurrencyMap, SubStrategy, TaskConcurrency};
use crate::config::HeddleConfig;
use crate::error::Result;
use crate::task::TaskListener;
use crate::ticker::{SharedTicker, SystemTicker};

/// Builder for [`ArrayBalancer`] and [`HeapBalancer`].
///
/// Configuration sources are merged in the following order (later sources override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
///
/// Every balancer built from one builder shares per-endpoint load state, so
/// two balancers over the same endpoint handles see each other's traffic.
/// The load-state settings (sub-strategy, look-back, failure sustain) are
/// fixed by the first build.
///
/// # Examples
///
/// ```ignore
/// use std::sync::Arc;
/// use heddle::{HeddleBuilder, LeastConcurrencyBalancer, SubStrategy};
///
/// let balancer = HeddleBuilder::new()
///     .file("heddle.toml")
///     .env_prefix("HEDDLE")
///     .endpoints(["a", "b", "c"].map(Arc::new))
///     .sub_strategy(SubStrategy::LeastTime)
///     .build_heap()?;
///
/// if let Some(task) = balancer.next() {
///     // ... send the request to task.endpoint()
///     task.complete_with(true);
/// }
/// ```
pub struct HeddleBuilder<T> {
    figment: Figment,
    endpoints: Vec<Arc<T>>,
    listeners: Vec<Arc<dyn TaskListener<T>>>,
    ticker: Option<SharedTicker>,
    prometheus_registry: Option<Registry>,
    shared: OnceLock<Arc<ConcurrencyMap<T>>>,
}

impl<T> Default for HeddleBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HeddleBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeddleBuilder")
            .field("figment", &self.figment)
            .field("endpoints", &self.endpoints.len())
            .field("listeners", &self.listeners.len())
            .field("ticker", &self.ticker)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .finish()
    }
}

impl<T> HeddleBuilder<T> {
    /// Create a new builder with default configuration and no endpoints.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(HeddleConfig::default())),
            endpoints: Vec::new(),
            listeners: Vec::new(),
            ticker: None,
            prometheus_registry: None,
            shared: OnceLock::new(),
        }
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension).
    /// Files are merged in the order they are added.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are read as `{PREFIX}_{KEY}`, e.g. `HEDDLE_GROUP_SIZE`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(&format!("{prefix}_")));
        self
    }

    /// Maximum endpoints scanned by one array selection.
    pub fn group_size(mut self, size: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("group_size", size));
        self
    }

    pub fn sub_strategy(mut self, strategy: SubStrategy) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("sub_strategy", strategy));
        self
    }

    /// Look-back window of the frequency or latency tie-break.
    pub fn look_back(mut self, window: Duration) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("look_back_ms", millis(window)));
        self
    }

    /// Ring-buffer windows per time-bucketed counter.
    ///
    /// More windows means finer expiry precision at the cost of memory.
    pub fn num_windows(mut self, n: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("num_windows", n));
        self
    }

    /// Penalize an endpoint for `sustain` after a failed request.
    pub fn failure_sustain(self, sustain: Duration) -> Self {
        let ms = i64::try_from(sustain.as_millis()).unwrap_or(i64::MAX);
        self.failure_sustain_ms(ms)
    }

    /// Failure sustain in milliseconds. Negative values fail the build.
    pub fn failure_sustain_ms(mut self, ms: i64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("failure_sustain_ms", ms));
        self
    }

    /// Synthetic load added while an endpoint is penalized. Default is 1.
    pub fn failure_weight(mut self, weight: u32) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("failure_weight", weight));
        self
    }

    /// Window over which request, success and failure rates are reported.
    pub fn rate_window(mut self, window: Duration) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("rate_window_ms", millis(window)));
        self
    }

    pub fn cov_sample_size(mut self, size: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("cov_sample_size", size));
        self
    }

    pub fn metrics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("metrics_prefix", prefix.into()));
        self
    }

    /// Set the endpoints to balance over, replacing any set before.
    ///
    /// Load is tracked by handle identity: clones of one `Arc` are the same
    /// endpoint, equal values in separate allocations are not.
    pub fn endpoints<I>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = Arc<T>>,
    {
        self.endpoints = endpoints.into_iter().collect();
        self
    }

    /// Add a lifecycle listener. Listeners run in the order they were added.
    pub fn listener(mut self, listener: Arc<dyn TaskListener<T>>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override the time source, e.g. with a [`ManualTicker`](crate::ManualTicker).
    pub fn ticker(mut self, ticker: SharedTicker) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Provide an external Prometheus registry for metrics exposition.
    ///
    /// Each built balancer registers its counters under the configured
    /// metrics prefix. Give balancers sharing a registry distinct prefixes;
    /// a duplicate registration is logged and otherwise ignored.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// This method applies any non-None values from the `HeddleArgs` struct.
    pub fn with_cli_args(mut self, args: &HeddleArgs) -> Self {
        if let Some(size) = args.heddle_group_size {
            self = self.group_size(size);
        }
        if let Some(strategy) = args.heddle_sub_strategy {
            self = self.sub_strategy(strategy);
        }
        if let Some(ms) = args.heddle_look_back_ms {
            self.figment = self
                .figment
                .merge(Serialized::default("look_back_ms", ms));
        }
        if let Some(n) = args.heddle_num_windows {
            self = self.num_windows(n);
        }
        if let Some(ms) = args.heddle_failure_sustain_ms {
            self = self.failure_sustain_ms(ms);
        }
        if let Some(weight) = args.heddle_failure_weight {
            self = self.failure_weight(weight);
        }
        if let Some(ms) = args.heddle_rate_window_ms {
            self.figment = self
                .figment
                .merge(Serialized::default("rate_window_ms", ms));
        }
        if let Some(ref prefix) = args.heddle_metrics_prefix {
            self = self.metrics_prefix(prefix.clone());
        }
        self
    }

    /// Extract and validate the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails or a value is out of range.
    pub fn config(&self) -> Result<HeddleConfig> {
        let config: HeddleConfig = self.figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Load state shared by every balancer from this builder, created on first use.
    pub fn concurrency_map(&self) -> Result<Arc<ConcurrencyMap<T>>> {
        if let Some(map) = self.shared.get() {
            return Ok(map.clone());
        }
        let config = self.config()?;
        let ticker = self.ticker.clone().unwrap_or_else(SystemTicker::shared);
        let map = Arc::new(ConcurrencyMap::new(config.concurrency_settings(), ticker));
        Ok(self.shared.get_or_init(|| map).clone())
    }

    /// Shared load state of `endpoint`, if a balancer has registered it.
    pub fn task_concurrency(&self, endpoint: &Arc<T>) -> Option<Arc<TaskConcurrency<T>>> {
        self.shared.get()?.get(endpoint)
    }
}

impl<T: Send + Sync + 'static> HeddleBuilder<T> {
    /// Build a grouped linear-scan balancer.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration extraction fails or a value is
    /// out of range (negative failure sustain, zero group size, zero windows).
    pub fn build_array(&self) -> Result<ArrayBalancer<T>> {
        let config = self.config()?;
        let balancer = ArrayBalancer::new(
            &config,
            &self.endpoints,
            self.concurrency_map()?,
            self.listeners.clone(),
        )?;
        if let Some(registry) = &self.prometheus_registry {
            balancer.register(registry);
        }
        Ok(balancer)
    }

    /// Build a priority-queue balancer.
    ///
    /// # Errors
    ///
    /// Same conditions as [`build_array`](Self::build_array).
    pub fn build_heap(&self) -> Result<HeapBalancer<T>> {
        let config = self.config()?;
        let balancer = HeapBalancer::new(
            &config,
            &self.endpoints,
            self.concurrency_map()?,
            self.listeners.clone(),
        )?;
        if let Some(registry) = &self.prometheus_registry {
            balancer.register(registry);
        }
        Ok(balancer)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// CLI arguments for heddle configuration.
///
/// Use with clap's `Parser` derive macro. These arguments can be applied
/// to a `HeddleBuilder` using `with_cli_args`.
///
/// # Examples
///
/// ```ignore
/// use clap::Parser;
/// use heddle::{HeddleArgs, HeddleBuilder};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     heddle: HeddleArgs,
/// }
///
/// let args = MyArgs::parse();
/// let balancer = HeddleBuilder::<String>::new()
///     .with_cli_args(&args.heddle)
///     .build_array()?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct HeddleArgs {
    /// Maximum endpoints scanned per array selection
    #[arg(long)]
    pub heddle_group_size: Option<usize>,

    /// Tie-break among equally loaded endpoints
    #[arg(long, value_enum)]
    pub heddle_sub_strategy: Option<SubStrategy>,

    /// Tie-break look-back window in milliseconds
    #[arg(long)]
    pub heddle_look_back_ms: Option<u64>,

    /// Windows per time-bucketed counter
    #[arg(long)]
    pub heddle_num_windows: Option<usize>,

    /// Failure penalty duration in milliseconds
    #[arg(long, allow_negative_numbers = true)]
    pub heddle_failure_sustain_ms: Option<i64>,

    /// Synthetic load added per failure
    #[arg(long)]
    pub heddle_failure_weight: Option<u32>,

    /// Rate reporting window in milliseconds
    #[arg(long)]
    pub heddle_rate_window_ms: Option<u64>,

    /// Prometheus metric name prefix
    #[arg(long)]
    pub heddle_metrics_prefix: Option<String>,
}

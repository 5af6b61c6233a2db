//! # heddle
//!
//! **Threading work through the least busy eye**
//!
//! Client-side least-concurrency load balancing. A balancer tracks how many
//! requests are in flight to each endpoint and hands out the least loaded one.
//!
//! ## Features
//!
//! - **Two Strategies**: [`ArrayBalancer`] scans a bounded, randomly chosen
//!   group of endpoints; [`HeapBalancer`] keeps every endpoint in one indexed
//!   priority queue for an exact global minimum
//! - **Tie-Breaks**: among equally loaded endpoints prefer the one picked
//!   least often ([`SubStrategy::LeastFrequency`]) or with the lowest recent
//!   cumulative latency ([`SubStrategy::LeastTime`])
//! - **Failure Sustain**: a failed request makes its endpoint look busier for
//!   a bounded time
//! - **Shared State**: balancers built from one [`HeddleBuilder`] observe each
//!   other's load on common endpoints
//! - **Flexible Configuration**: Configure via files (TOML/YAML/JSON), environment variables, or code
//! - **CLI Integration**: Built-in clap support for command-line overrides
//! - **Metrics**: windowed request/success/failure rates and load COV, plus
//!   Prometheus counters
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use heddle::{HeddleBuilder, LeastConcurrencyBalancer};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let balancer = HeddleBuilder::new()
//!         .endpoints(["10.0.0.1:80", "10.0.0.2:80"].map(Arc::new))
//!         .failure_sustain(std::time::Duration::from_secs(30))
//!         .build_array()?;
//!
//!     if let Some(task) = balancer.next() {
//!         let ok = send(task.endpoint());
//!         task.complete_with(ok);
//!     }
//!
//!     println!("{:?}", balancer.metrics());
//!     Ok(())
//! }
//! ```
//!
//! `next()` returns `None` when no endpoint is eligible. Callers should retry
//! later or fall back.
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides
//! 5. CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! group_size = 64
//! sub_strategy = "least_time"
//! look_back_ms = 300000
//! failure_sustain_ms = 30000
//! failure_weight = 1
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("HEDDLE")`:
//! - `HEDDLE_GROUP_SIZE=32`
//! - `HEDDLE_SUB_STRATEGY=least_frequency`
//! - `HEDDLE_FAILURE_SUSTAIN_MS=30000`
//!
//! ### CLI Arguments
//!
//! ```ignore
//! use clap::Parser;
//! use heddle::{HeddleArgs, HeddleBuilder};
//!
//! #[derive(Parser)]
//! struct MyArgs {
//!     #[command(flatten)]
//!     heddle: HeddleArgs,
//! }
//!
//! let args = MyArgs::parse();
//! let balancer = HeddleBuilder::<String>::new()
//!     .file("config.toml")
//!     .env_prefix("HEDDLE")
//!     .with_cli_args(&args.heddle)
//!     .build_heap()?;
//! ```

pub mod balancer;
pub mod builder;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod task;
pub mod ticker;
pub mod timed;

pub use balancer::{ArrayBalancer, HeapBalancer, LeastConcurrencyBalancer, NoopBalancer};
pub use builder::{HeddleArgs, HeddleBuilder};
pub use concurrency::{ConcurrencyMap, EndpointId, FailureSustain, SubStrategy, TaskConcurrency};
pub use config::HeddleConfig;
pub use error::{HeddleError, Result};
pub use metrics::{HeddleMetrics, LoadMetrics};
pub use queue::IndexedPriorityQueue;
pub use task::{CompletableTask, TaskListener};
pub use ticker::{ManualTicker, SharedTicker, SystemTicker, Ticker};

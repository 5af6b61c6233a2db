//! Time-windowed counting primitives.
//!
//! These form the substrate for decay-based accounting:
//!
//! - [`LifespanTracker`]: bucketed ring accumulating counts until they expire.
//! - [`ScheduledCounter`]: delivers expired counts to a consumer, retaining
//!   anything the consumer refuses.
//! - [`DecayingCounter`]: a value that forgets additions older than its
//!   look-back window.
//!
//! None of them run background threads. Expiry is processed lazily whenever
//! a caller purges or checks.

mod counter;
mod lifespan;
mod scheduled;

pub use counter::DecayingCounter;
pub use lifespan::LifespanTracker;
pub use scheduled::{ConsumeError, Consumer, ScheduledCounter, ScheduledCounterBuilder};

//! Uniform fixed-size sampling over a stream.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Reservoir sampler (algorithm R) keeping up to `capacity` items.
///
/// Every item offered since the last [`reset`](ReservoirSampler::reset) has
/// the same probability of being in the sample.
#[derive(Debug)]
pub struct ReservoirSampler<T> {
    capacity: usize,
    seen: usize,
    samples: Vec<T>,
    rng: SmallRng,
}

impl<T> ReservoirSampler<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, SmallRng::from_entropy())
    }

    pub fn with_rng(capacity: usize, rng: SmallRng) -> Self {
        Self {
            capacity,
            seen: 0,
            samples: Vec::with_capacity(capacity),
            rng,
        }
    }

    pub fn sample(&mut self, item: T) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(item);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if slot < self.capacity {
            self.samples[slot] = item;
        }
    }

    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    /// Number of items offered since the last reset.
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn reset(&mut self) {
        self.seen = 0;
        self.samples.clear();
    }
}

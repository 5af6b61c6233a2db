//! Endpoint grouping and weighted group choice.

use std::ops::Range;

use rand::Rng;

/// Split `len` items into `ceil(len / max_group)` contiguous groups whose
/// sizes differ by at most one.
///
/// ```text
/// len = 8,  max_group = 3   ->  [0..3, 3..6, 6..8]
/// len = 21, max_group = 10  ->  [0..7, 7..14, 14..21]
/// ```
pub fn partition(len: usize, max_group: usize) -> Vec<Range<usize>> {
    if len == 0 || max_group == 0 {
        return Vec::new();
    }
    let groups = len.div_ceil(max_group);
    let base = len / groups;
    let extra = len % groups;

    let mut start = 0;
    (0..groups)
        .map(|g| {
            let size = base + usize::from(g < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Picks an item at random with probability proportional to its weight.
#[derive(Debug, Clone)]
pub struct WeightedSelector<G> {
    items: Vec<G>,
    /// Running total of weights, inclusive.
    cumulative: Vec<u64>,
}

impl<G> WeightedSelector<G> {
    pub fn builder() -> WeightedSelectorBuilder<G> {
        WeightedSelectorBuilder::default()
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[G] {
        &self.items
    }

    /// Draw one item. `None` when the total weight is zero.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&G> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let ticket = rng.gen_range(0..total);
        let idx = self.cumulative.partition_point(|&c| c <= ticket);
        self.items.get(idx)
    }
}

/// Accumulates weighted items for a [`WeightedSelector`].
#[derive(Debug)]
pub struct WeightedSelectorBuilder<G> {
    items: Vec<G>,
    cumulative: Vec<u64>,
}

impl<G> Default for WeightedSelectorBuilder<G> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cumulative: Vec::new(),
        }
    }
}

impl<G> WeightedSelectorBuilder<G> {
    pub fn add(mut self, item: G, weight: u64) -> Self {
        let total = self.cumulative.last().copied().unwrap_or(0);
        self.items.push(item);
        self.cumulative.push(total.saturating_add(weight));
        self
    }

    pub fn build(self) -> WeightedSelector<G> {
        WeightedSelector {
            items: self.items,
            cumulative: self.cumulative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sizes(len: usize, max_group: usize) -> Vec<usize> {
        partition(len, max_group).iter().map(|r| r.len()).collect()
    }

    #[test]
    fn test_partition_sizes() {
        assert_eq!(sizes(8, 3), vec![3, 3, 2]);
        assert_eq!(sizes(21, 10), vec![7, 7, 7]);
        assert_eq!(sizes(5, 64), vec![5]);
        assert_eq!(sizes(64, 64), vec![64]);
        assert_eq!(sizes(65, 64), vec![33, 32]);
        assert!(partition(0, 3).is_empty());
    }

    #[test]
    fn test_partition_is_contiguous() {
        let ranges = partition(23, 4);
        assert_eq!(ranges.first().map(|r| r.start), Some(0));
        assert_eq!(ranges.last().map(|r| r.end), Some(23));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_weighted_selection_frequencies() {
        let selector = WeightedSelector::builder()
            .add('a', 3)
            .add('b', 0)
            .add('c', 1)
            .build();
        assert_eq!(selector.total_weight(), 4);

        let mut rng = StdRng::seed_from_u64(12345);
        let mut counts = [0usize; 3];
        for _ in 0..40_000 {
            match selector.select(&mut rng) {
                Some('a') => counts[0] += 1,
                Some('b') => counts[1] += 1,
                Some('c') => counts[2] += 1,
                other => panic!("unexpected selection {other:?}"),
            }
        }
        assert_eq!(counts[1], 0);
        assert!((counts[0] as f64 / 30_000.0 - 1.0).abs() < 0.05);
        assert!((counts[2] as f64 / 10_000.0 - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_empty_selector() {
        let selector = WeightedSelector::<u8>::builder().build();
        assert!(selector.is_empty());
        assert!(selector.select(&mut StdRng::seed_from_u64(1)).is_none());
    }
}

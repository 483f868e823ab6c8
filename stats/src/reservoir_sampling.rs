use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::iter::IntoIterator;

struct Keyed<T> {
    // ln(u) / weight, larger is better
    key: f64,
    // position in the input stream
    seq: usize,
    item: T,
}

impl<T> PartialEq for Keyed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Keyed<T> {}

impl<T> PartialOrd for Keyed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Keyed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // On equal keys the earlier item ranks higher
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Choose `capacity` items without replacement from a stream of weighted
/// items, each item's inclusion odds proportional to its weight.
/// Uses the Efraimidis-Spirakis A-Res scheme with keys `u^(1/w)`, kept in log
/// space. See https://en.wikipedia.org/wiki/Reservoir_sampling
pub struct WeightedReservoirSampler<T> {
    capacity: usize,
    items_seen: usize,
    // min-heap on key, so the weakest sampled item is on top
    heap: BinaryHeap<Reverse<Keyed<T>>>,
    rng: Xoshiro256StarStar,
}

impl<T> WeightedReservoirSampler<T> {
    /// Create a new `WeightedReservoirSampler` with the specified capacity and random seed
    pub fn new(capacity: usize, seed: u64) -> WeightedReservoirSampler<T> {
        WeightedReservoirSampler {
            capacity,
            items_seen: 0,
            heap: BinaryHeap::with_capacity(capacity),
            rng: Xoshiro256StarStar::seed_from_u64(seed),
        }
    }

    /// Add a new item with a non-negative weight. Zero-weight items are only
    /// sampled when there are not enough positive-weight items.
    pub fn add(&mut self, item: T, weight: f64) {
        let seq = self.items_seen;
        self.items_seen += 1;
        // u in (0, 1]
        let u = 1.0 - self.rng.gen::<f64>();
        let key = if weight > 0.0 {
            u.ln() / weight
        } else {
            f64::NEG_INFINITY
        };
        if self.capacity == 0 {
            return;
        }
        let entry = Keyed { key, seq, item };
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(entry));
        } else if let Some(Reverse(weakest)) = self.heap.peek() {
            if entry > *weakest {
                self.heap.pop();
                self.heap.push(Reverse(entry));
            }
        }
    }

    /// Consume the sampler and return the sampled items in input order
    pub fn done(self) -> Vec<T> {
        let mut kept: Vec<_> = self.heap.into_iter().map(|Reverse(k)| k).collect();
        kept.sort_by_key(|k| k.seq);
        kept.into_iter().map(|k| k.item).collect()
    }

    /// Number of items seen so far by the sampler
    pub fn num_items_seen(&self) -> usize {
        self.items_seen
    }

    /// Sample from an iterator of `(item, weight)` pairs and return the
    /// sampled items in input order
    pub fn sample_from_iter<I: IntoIterator<Item = (T, f64)>>(
        iter: I,
        capacity: usize,
        seed: u64,
    ) -> Vec<T> {
        let mut sampler = WeightedReservoirSampler::new(capacity, seed);
        for (item, weight) in iter {
            sampler.add(item, weight);
        }
        sampler.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::arbitrary::any;
    use proptest::{prop_assert, prop_assert_eq, proptest};
    use std::cmp::min;

    proptest! {
        #[test]
        fn prop_test_weighted_reservoir_sampling(
            num_items in 0usize..1000usize,
            capacity in 0usize..500usize,
            seed in any::<u64>(),
        ) {
            let weighted = || (0..num_items).map(|i| (i, 1.0 + (i % 7) as f64));
            let sampled_items1 = WeightedReservoirSampler::sample_from_iter(weighted(), capacity, seed);
            prop_assert_eq!(sampled_items1.len(), min(capacity, num_items));
            let sampled_items2 = WeightedReservoirSampler::sample_from_iter(weighted(), capacity, seed);
            // Repeatability
            prop_assert_eq!(&sampled_items1, &sampled_items2);
            // Strictly ascending input order, hence no duplicates
            for w in sampled_items1.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
            for item in sampled_items1 {
                prop_assert!(item < num_items);
            }
        }
    }

    #[test]
    fn test_zero_weight_items_fill_last() {
        let items = (0..100).map(|i| (i, if i < 50 { 0.0 } else { 1.0 }));
        let sampled = WeightedReservoirSampler::sample_from_iter(items, 50, 7);
        assert_eq!(sampled, (50..100).collect::<Vec<_>>());

        // Not enough positive items: zero-weight ones are taken in input order
        let items = (0..10).map(|i| (i, if i < 8 { 0.0 } else { 1.0 }));
        let sampled = WeightedReservoirSampler::sample_from_iter(items, 4, 7);
        assert_eq!(sampled, vec![0, 1, 8, 9]);
    }

    #[test]
    fn test_heavy_items_preferred() {
        let mut heavy_hits = 0;
        for seed in 0..200 {
            let items = (0..20).map(|i| (i, if i == 3 { 100.0 } else { 1.0 }));
            let sampled = WeightedReservoirSampler::sample_from_iter(items, 2, seed);
            if sampled.contains(&3) {
                heavy_hits += 1;
            }
        }
        assert!(heavy_hits > 180, "heavy item sampled {heavy_hits} times");
    }
}

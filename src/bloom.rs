//! A scalable Bloom filter: a growable stack of fixed-capacity filters.
//!
//! Mirrors the scaling strategy of Python's `pybloom_live.ScalableBloomFilter`
//! (the original engine this crate is modeled on relies on it): once the
//! current filter's expected capacity is exhausted, a new, larger filter is
//! appended with a tightened per-filter error rate, so the compounded
//! false-positive rate across the whole stack stays bounded as the key
//! count grows without bound.

use bloom::{BloomFilter, ASMS};

const INITIAL_CAPACITY: u32 = 128;
const INITIAL_ERROR_RATE: f32 = 0.001;
const GROWTH_FACTOR: u32 = 2;
const TIGHTENING_RATIO: f32 = 0.9;

struct Tier {
    filter: BloomFilter,
    capacity: u32,
    count: u32,
}

pub struct ScalableBloomFilter {
    tiers: Vec<Tier>,
    next_capacity: u32,
    next_error_rate: f32,
}

impl ScalableBloomFilter {
    pub fn new() -> Self {
        ScalableBloomFilter {
            tiers: Vec::new(),
            next_capacity: INITIAL_CAPACITY,
            next_error_rate: INITIAL_ERROR_RATE,
        }
    }

    pub fn add(&mut self, key: &str) {
        if self.tiers.last().map_or(true, |t| t.count >= t.capacity) {
            self.grow();
        }
        let tier = self.tiers.last_mut().expect("grow() always pushes a tier");
        tier.filter.insert(&key);
        tier.count += 1;
    }

    /// `false` is an absolute guarantee of absence; `true` may be a false
    /// positive and must be followed by an authoritative lookup.
    pub fn contains(&self, key: &str) -> bool {
        self.tiers.iter().any(|t| t.filter.contains(&key))
    }

    fn grow(&mut self) {
        tracing::warn!(capacity = self.next_capacity, error_rate = self.next_error_rate, tier = self.tiers.len(), "scaling up bloom filter");
        self.tiers.push(Tier {
            filter: BloomFilter::with_rate(self.next_error_rate, self.next_capacity),
            capacity: self.next_capacity,
            count: 0,
        });
        self.next_capacity *= GROWTH_FACTOR;
        self.next_error_rate *= TIGHTENING_RATIO;
    }
}

impl Default for ScalableBloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = ScalableBloomFilter::new();
        for i in 0..500 {
            filter.add(&format!("k{i}"));
        }
        for i in 0..500 {
            assert!(filter.contains(&format!("k{i}")));
        }
    }

    #[test]
    fn absent_key_usually_rejected() {
        let mut filter = ScalableBloomFilter::new();
        filter.add("present");
        assert!(!filter.contains("definitely-absent-key"));
    }

    #[test]
    fn scales_past_the_initial_tier() {
        let mut filter = ScalableBloomFilter::new();
        for i in 0..(INITIAL_CAPACITY as usize * 3) {
            filter.add(&format!("k{i}"));
        }
        assert!(filter.tiers.len() >= 2);
        for i in 0..(INITIAL_CAPACITY as usize * 3) {
            assert!(filter.contains(&format!("k{i}")));
        }
    }
}

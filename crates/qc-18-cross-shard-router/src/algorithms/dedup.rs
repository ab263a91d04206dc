//! # Duplicate Suppression Filter
//!
//! Generational, lock-striped bloom filter keyed by message fingerprint.
//!
//! - Each generation is a blocked bloom filter split into stripes. The stripe
//!   is picked by one hash; all k bits of an element live in that stripe, so
//!   one stripe mutex makes test-and-insert atomic.
//! - Generations rotate: a fresh filter is pushed on a timer and the oldest
//!   dropped. Lookups consult every retained generation, inserts go to the
//!   newest. Rotation swaps whole filters, nothing is resized in place.
//!
//! False positives are possible and tolerated. False negatives are not
//! possible within the retained window.
//!
//! Sizing: m = -n*ln(p) / ln(2)^2, k = (m/n) * ln(2).

use std::collections::VecDeque;
use std::f64::consts::LN_2;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitvec::prelude::*;
use parking_lot::{Mutex, RwLock};

use super::hashing::{compute_hash_positions, murmur_hash};
use crate::domain::Fingerprint;

/// Stripes per generation.
pub const DEFAULT_STRIPES: usize = 64;

/// Bloom filter sizing.
#[derive(Clone, Debug, PartialEq)]
pub struct BloomParams {
    /// Total bits (m)
    pub size_bits: usize,
    /// Hash functions (k)
    pub hash_count: usize,
    /// FPR these parameters give at the expected load
    pub expected_fpr: f64,
}

/// Optimal parameters for `num_elements` at `target_fpr`.
pub fn optimal_params(num_elements: usize, target_fpr: f64) -> BloomParams {
    if num_elements == 0 {
        return BloomParams {
            size_bits: 64,
            hash_count: 1,
            expected_fpr: 0.0,
        };
    }

    let n = num_elements as f64;
    let m = (-n * target_fpr.ln() / (LN_2 * LN_2)).ceil() as usize;
    let k = ((m as f64 / n) * LN_2).round() as usize;
    let k = k.clamp(1, 32);

    BloomParams {
        size_bits: m.max(64),
        hash_count: k,
        expected_fpr: false_positive_rate(m, num_elements, k),
    }
}

/// FPR = (1 - e^(-kn/m))^k
pub fn false_positive_rate(m: usize, n: usize, k: usize) -> f64 {
    if m == 0 {
        return 1.0;
    }
    let exponent = -(k as f64) * (n as f64) / (m as f64);
    (1.0 - exponent.exp()).powi(k as i32)
}

/// One generation: a blocked bloom filter with a mutex per stripe.
pub struct StripedBloomFilter {
    stripes: Vec<Mutex<BitVec<u8, Lsb0>>>,
    bits_per_stripe: usize,
    hash_count: usize,
    tweak: u32,
}

impl StripedBloomFilter {
    /// Create an empty filter.
    pub fn new(params: &BloomParams, stripes: usize, tweak: u32) -> Self {
        let stripes = stripes.max(1);
        let bits_per_stripe = params.size_bits.div_ceil(stripes).max(8);
        Self {
            stripes: (0..stripes)
                .map(|_| Mutex::new(bitvec![u8, Lsb0; 0; bits_per_stripe]))
                .collect(),
            bits_per_stripe,
            hash_count: params.hash_count,
            tweak,
        }
    }

    fn stripe_of(&self, element: &[u8]) -> usize {
        (murmur_hash(element, 2, self.tweak) % self.stripes.len() as u64) as usize
    }

    /// Set the element's bits; returns true if all were already set.
    pub fn test_and_insert(&self, element: &[u8]) -> bool {
        let positions =
            compute_hash_positions(element, self.hash_count, self.bits_per_stripe, self.tweak);
        let mut bits = self.stripes[self.stripe_of(element)].lock();
        let mut present = true;
        for pos in positions {
            if !bits[pos] {
                present = false;
                bits.set(pos, true);
            }
        }
        present
    }

    /// Whether the element may have been inserted.
    pub fn contains(&self, element: &[u8]) -> bool {
        let positions =
            compute_hash_positions(element, self.hash_count, self.bits_per_stripe, self.tweak);
        let bits = self.stripes[self.stripe_of(element)].lock();
        positions.iter().all(|&pos| bits[pos])
    }

    /// Fraction of bits set (diagnostics).
    pub fn fill_ratio(&self) -> f64 {
        let total = (self.stripes.len() * self.bits_per_stripe) as f64;
        let ones: usize = self.stripes.iter().map(|s| s.lock().count_ones()).sum();
        ones as f64 / total
    }
}

/// Generational dedup filter.
pub struct DedupFilter {
    generations: RwLock<VecDeque<Arc<StripedBloomFilter>>>,
    params: BloomParams,
    max_generations: usize,
    stripes: usize,
    rotations: AtomicU32,
}

impl DedupFilter {
    /// Filter sized for `expected_insertions` per generation.
    pub fn new(expected_insertions: usize, false_positive_rate: f64, generations: usize) -> Self {
        let params = optimal_params(expected_insertions, false_positive_rate);
        let mut ring = VecDeque::with_capacity(generations.max(1));
        ring.push_front(Arc::new(StripedBloomFilter::new(&params, DEFAULT_STRIPES, 0)));
        Self {
            generations: RwLock::new(ring),
            params,
            max_generations: generations.max(1),
            stripes: DEFAULT_STRIPES,
            rotations: AtomicU32::new(0),
        }
    }

    /// Whether the fingerprint was (probably) seen. No side effects.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let generations = self.generations.read();
        generations.iter().any(|g| g.contains(fingerprint.as_bytes()))
    }

    /// Record the fingerprint; returns true if it was (probably) seen before.
    ///
    /// Atomic with respect to concurrent calls for the same fingerprint: at
    /// most one of them observes `false`.
    pub fn check_and_insert(&self, fingerprint: &Fingerprint) -> bool {
        let generations = self.generations.read();
        let mut iter = generations.iter();
        let Some(newest) = iter.next() else {
            return false;
        };
        if iter.any(|g| g.contains(fingerprint.as_bytes())) {
            return true;
        }
        newest.test_and_insert(fingerprint.as_bytes())
    }

    /// Start a new generation, dropping the oldest beyond the limit.
    pub fn rotate(&self) {
        let tweak = self.rotations.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = Arc::new(StripedBloomFilter::new(&self.params, self.stripes, tweak));
        let mut generations = self.generations.write();
        generations.push_front(fresh);
        generations.truncate(self.max_generations);
    }

    /// Generations currently retained.
    pub fn generation_count(&self) -> usize {
        self.generations.read().len()
    }

    /// Sizing in use.
    pub fn params(&self) -> &BloomParams {
        &self.params
    }

    /// Fill ratio of the newest generation.
    pub fn fill_ratio(&self) -> f64 {
        self.generations
            .read()
            .front()
            .map(|g| g.fill_ratio())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(i: u32) -> Fingerprint {
        Fingerprint::of(&i.to_le_bytes())
    }

    #[test]
    fn test_optimal_params() {
        let params = optimal_params(1_000_000, 0.001);
        // ~14.4 bits per element, ~10 hashes
        assert!(params.size_bits > 14_000_000 && params.size_bits < 15_000_000);
        assert_eq!(params.hash_count, 10);
        assert!(params.expected_fpr <= 0.0011);
    }

    #[test]
    fn test_second_insert_is_duplicate() {
        let filter = DedupFilter::new(1_000, 0.01, 2);
        assert!(!filter.check_and_insert(&fp(1)));
        assert!(filter.check_and_insert(&fp(1)));
        assert!(filter.contains(&fp(1)));
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = DedupFilter::new(5_000, 0.01, 1);
        for i in 0..5_000 {
            filter.check_and_insert(&fp(i));
        }
        for i in 0..5_000 {
            assert!(filter.contains(&fp(i)), "false negative for {}", i);
        }
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let filter = DedupFilter::new(10_000, 0.01, 1);
        for i in 0..10_000 {
            filter.check_and_insert(&fp(i));
        }
        let false_positives = (10_000..30_000).filter(|&i| filter.contains(&fp(i))).count();
        let rate = false_positives as f64 / 20_000.0;
        assert!(rate < 0.03, "fpr {} too high", rate);
    }

    #[test]
    fn test_contains_has_no_side_effects() {
        let filter = DedupFilter::new(1_000, 0.01, 1);
        assert!(!filter.contains(&fp(42)));
        assert!(!filter.check_and_insert(&fp(42)));
    }

    #[test]
    fn test_rotation_retains_window() {
        let filter = DedupFilter::new(1_000, 0.01, 2);
        filter.check_and_insert(&fp(7));

        filter.rotate();
        assert_eq!(filter.generation_count(), 2);
        assert!(filter.check_and_insert(&fp(7)), "previous generation still consulted");

        filter.rotate();
        assert_eq!(filter.generation_count(), 2);
        assert!(!filter.contains(&fp(7)), "aged out after two rotations");
    }

    #[test]
    fn test_concurrent_inserts_single_winner() {
        let filter = Arc::new(DedupFilter::new(10_000, 0.001, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || !filter.check_and_insert(&fp(99)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }
}

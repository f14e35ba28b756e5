//! Seeded pseudo-random numbers for script-visible decisions.
//!
//! Every random choice a run can observe goes through [`SeededRandom`]. The
//! generator is SplitMix64: small, fast and fully determined by its seed.
//! It is **not** cryptographic.

use serde::{Deserialize, Serialize};

/// SplitMix64 finaliser.
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58476D1CE4E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

/// Derive an independent stream seed from a parent seed.
pub fn derive_seed(seed: u64, stream: u64) -> u64 {
    mix64(seed ^ mix64(stream.wrapping_add(0x9E3779B97F4A7C15)))
}

/// Deterministic generator: same seed + same call sequence gives the same
/// outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededRandom {
    seed: u64,
    state: u64,
    calls: u64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            state: seed,
            calls: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of raw draws taken so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// A child generator on an independent stream. Does not advance `self`.
    pub fn fork(&self, stream: u64) -> Self {
        Self::new(derive_seed(self.seed, stream))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.calls += 1;
        self.state = self.state.wrapping_add(0x9E3779B97F4A7C15);
        mix64(self.state)
    }

    /// Uniform float in `[0, 1)` built from the top 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `[min, max]`. Bounds are swapped if reversed.
    pub fn range_i64(&mut self, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let span = (hi as i128 - lo as i128 + 1) as u128;
        let draw = self.next_u64() as u128 % span;
        (lo as i128 + draw as i128) as i64
    }

    /// Uniform float in `[min, max)`.
    pub fn range_f64(&mut self, min: f64, max: f64) -> f64 {
        min + (max - min) * self.next_f64()
    }

    /// `true` with probability `p` (clamped to `[0, 1]`).
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p.clamp(0.0, 1.0)
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.range_i64(0, items.len() as i64 - 1) as usize;
        items.get(idx)
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range_i64(0, i as i64) as usize;
            items.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SeededRandom::new(42);
        let mut b = SeededRandom::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        assert_eq!(a.calls(), 100);
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = SeededRandom::new(1);
        let mut b = SeededRandom::new(2);
        let xs: Vec<u64> = (0..8).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.next_u64()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_ranges_stay_in_bounds() {
        let mut rng = SeededRandom::new(7);
        for _ in 0..1000 {
            let i = rng.range_i64(-3, 3);
            assert!((-3..=3).contains(&i));
            let f = rng.next_f64();
            assert!((0.0..1.0).contains(&f));
            let g = rng.range_f64(2.0, 4.0);
            assert!((2.0..4.0).contains(&g));
        }
        assert_eq!(rng.range_i64(5, 5), 5);
        assert!((-1..=9).contains(&rng.range_i64(9, -1)));
    }

    #[test]
    fn test_shuffle_is_a_deterministic_permutation() {
        let mut a = SeededRandom::new(99);
        let mut b = SeededRandom::new(99);
        let mut xs: Vec<u32> = (0..20).collect();
        let mut ys = xs.clone();
        a.shuffle(&mut xs);
        b.shuffle(&mut ys);
        assert_eq!(xs, ys);
        let mut sorted = xs.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_fork_does_not_advance_parent() {
        let parent = SeededRandom::new(5);
        let mut child_a = parent.fork(1);
        let mut child_b = parent.fork(1);
        let mut child_c = parent.fork(2);
        assert_eq!(parent.calls(), 0);
        let a = child_a.next_u64();
        assert_eq!(a, child_b.next_u64());
        assert_ne!(a, child_c.next_u64());
    }

    #[test]
    fn test_pick_and_chance_edges() {
        let mut rng = SeededRandom::new(3);
        let empty: [u8; 0] = [];
        assert!(rng.pick(&empty).is_none());
        assert_eq!(rng.pick(&[9]), Some(&9));
        assert!(!rng.chance(0.0));
        assert!(rng.chance(1.0));
    }
}

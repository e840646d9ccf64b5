//! Secure random source
//!
//! Uniform selection for path shuffles, circuit/stream id allocation and
//! randomised request matching. Backed by the OS generator.
//!
//! Bounded selection uses rejection sampling so results are exactly
//! uniform; a plain modulus would skew shuffles toward low residues.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Result, TorError};

/// Cryptographically strong random source.
///
/// Construction probes the OS generator and fails when no strong
/// generator is available or its output is degenerate.
#[derive(Debug, Clone, Copy)]
pub struct SecureRandom {
    _priv: (),
}

impl SecureRandom {
    /// Create a new random source, verifying the OS generator works.
    pub fn new() -> Result<Self> {
        let mut probe = [0u8; 32];
        getrandom::getrandom(&mut probe)
            .map_err(|e| TorError::EntropyError(format!("OS generator unavailable: {}", e)))?;

        // Reject obviously broken output (all equal bytes).
        let first = probe[0];
        if probe.iter().all(|&b| b == first) {
            return Err(TorError::EntropyError(
                "OS generator returned degenerate output".into(),
            ));
        }

        Ok(Self { _priv: () })
    }

    /// Fill `buf` with random bytes.
    pub fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    /// Return `n` random bytes.
    pub fn bytes(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf);
        buf
    }

    /// Uniform value in `[0, n)`, by rejection sampling.
    ///
    /// Panics if `n` is zero.
    pub fn int_below(&self, n: u64) -> u64 {
        assert!(n > 0, "int_below(0)");
        // Accept only values below the largest multiple of n that fits
        // in a u64, so the final modulus is unbiased.
        let rem = ((u64::MAX % n) + 1) % n;
        let limit = u64::MAX - rem;
        loop {
            let v = OsRng.next_u64();
            if v <= limit {
                return v % n;
            }
        }
    }

    /// Uniform `usize` in `[0, n)`.
    pub fn index_below(&self, n: usize) -> usize {
        self.int_below(n as u64) as usize
    }

    /// Non-negative 63-bit random value.
    pub fn next_long(&self) -> u64 {
        OsRng.next_u64() >> 1
    }

    /// Random `u32`.
    pub fn next_u32(&self) -> u32 {
        OsRng.next_u32()
    }

    /// Fisher-Yates shuffle using the unbiased sampler.
    pub fn shuffle<T>(&self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.index_below(i + 1);
            items.swap(i, j);
        }
    }

    /// Pick one element of a slice uniformly, if any.
    pub fn choose<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            None
        } else {
            Some(&items[self.index_below(items.len())])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_succeeds() {
        SecureRandom::new().unwrap();
    }

    #[test]
    fn test_int_below_range() {
        let rng = SecureRandom::new().unwrap();
        for _ in 0..1000 {
            assert!(rng.int_below(7) < 7);
        }
        // n = 1 always yields 0
        assert_eq!(rng.int_below(1), 0);
    }

    #[test]
    fn test_int_below_covers_small_range() {
        let rng = SecureRandom::new().unwrap();
        let mut seen = [false; 5];
        for _ in 0..1000 {
            seen[rng.int_below(5) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s), "all residues should appear");
    }

    #[test]
    fn test_next_long_is_63_bit() {
        let rng = SecureRandom::new().unwrap();
        for _ in 0..100 {
            assert!(rng.next_long() < (1u64 << 63));
        }
    }

    #[test]
    fn test_shuffle_preserves_elements() {
        let rng = SecureRandom::new().unwrap();
        let mut items: Vec<u32> = (0..20).collect();
        rng.shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_choose_empty() {
        let rng = SecureRandom::new().unwrap();
        let empty: [u8; 0] = [];
        assert!(rng.choose(&empty).is_none());
    }
}

//! Bloom filter with SipHash-2-4 double hashing.
//!
//! ## Parameters
//!
//! - Filter size `m = 2^m_ln2` bits, `m_ln2 <= 31`
//! - Capacity `n = -m * ln(2)^2 / ln(p)` for a target false-positive rate `p`
//! - Hash count `k = round(m * ln(2) / n)`, at least 2 and at most [`MAX_HASHES`]
//!
//! A single keyed SipHash-2-4 call yields 64 bits, split into two 32-bit
//! halves `h0` and `h1`; position `i` is `h0 + i * h1` (Kirsch–Mitzenmacher).
//! The SipHash key is random per filter, so bit positions are not
//! predictable by whoever chooses the inserted values.

use std::hash::Hasher;

use rand::RngCore;
use siphasher::sip::SipHasher24;

use crate::{ReplayError, Result};

/// Upper bound on the number of bit positions per entry.
pub const MAX_HASHES: usize = 32;

/// Largest supported filter, `2^31` bits.
pub const MAX_M_LN2: u32 = 31;

const LN2: f64 = std::f64::consts::LN_2;

/// Probabilistic set membership over byte strings.
///
/// False positives occur at roughly the configured rate once the filter is
/// at capacity; false negatives never occur.
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_mask: u32,
    k0: u64,
    k1: u64,
    num_hashes: usize,
    max_entries: usize,
    entries: usize,
}

impl BloomFilter {
    /// Create a filter of `2^m_ln2` bits targeting `false_positive_rate`,
    /// keyed from the OS random source.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::FilterTooLarge`] if `m_ln2` exceeds [`MAX_M_LN2`]
    /// - [`ReplayError::InvalidRate`] unless `0 < false_positive_rate < 1`
    /// - [`ReplayError::TooManyHashes`] if the parameters need more than [`MAX_HASHES`] hashes
    pub fn new(m_ln2: u32, false_positive_rate: f64) -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        Self::with_keys(m_ln2, false_positive_rate, rng.next_u64(), rng.next_u64())
    }

    /// Create a filter with explicit SipHash keys.
    ///
    /// # Errors
    ///
    /// Same as [`BloomFilter::new`].
    pub fn with_keys(m_ln2: u32, false_positive_rate: f64, k0: u64, k1: u64) -> Result<Self> {
        if m_ln2 > MAX_M_LN2 {
            return Err(ReplayError::FilterTooLarge(m_ln2));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(ReplayError::InvalidRate(false_positive_rate));
        }

        let m = 1u64 << m_ln2;
        let m_f = m as f64;
        let n = -m_f * LN2 * LN2 / false_positive_rate.ln();
        let k = ((m_f * LN2 / n) + 0.5) as usize;
        let num_hashes = k.max(2);
        if num_hashes > MAX_HASHES {
            return Err(ReplayError::TooManyHashes(num_hashes));
        }

        let byte_len = usize::try_from((m / 8).max(1))
            .map_err(|_| ReplayError::FilterTooLarge(m_ln2))?;

        Ok(Self {
            bits: vec![0u8; byte_len],
            hash_mask: (m - 1) as u32,
            k0,
            k1,
            num_hashes,
            max_entries: n as usize,
            entries: 0,
        })
    }

    /// Test for membership, inserting the value if absent.
    ///
    /// Returns `true` iff the value was (probably) already present.
    pub fn test_and_set(&mut self, value: &[u8]) -> bool {
        let positions = self.positions(value);
        if self.all_set(&positions) {
            return true;
        }
        for &idx in &positions[..self.num_hashes] {
            self.bits[(idx / 8) as usize] |= 1 << (idx & 7);
        }
        self.entries += 1;
        false
    }

    /// Test for membership without inserting.
    pub fn test(&self, value: &[u8]) -> bool {
        let positions = self.positions(value);
        self.all_set(&positions)
    }

    /// Number of values inserted.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Capacity at which the target false-positive rate is reached.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of bit positions per value.
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Whether the filter holds at least [`Self::max_entries`] values.
    pub fn is_saturated(&self) -> bool {
        self.entries >= self.max_entries
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.entries = 0;
    }

    /// Estimated false-positive rate at the current load.
    pub fn false_positive_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let m = (u64::from(self.hash_mask) + 1) as f64;
        let n = self.entries as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn positions(&self, value: &[u8]) -> [u32; MAX_HASHES] {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write(value);
        let base = hasher.finish();

        let mut positions = [0u32; MAX_HASHES];
        let h0 = base as u32;
        let h1 = (base >> 32) as u32;
        for (i, bit) in positions.iter_mut().take(self.num_hashes).enumerate() {
            *bit = h0.wrapping_add((i as u32).wrapping_mul(h1)) & self.hash_mask;
        }
        positions
    }

    fn all_set(&self, positions: &[u32; MAX_HASHES]) -> bool {
        positions[..self.num_hashes]
            .iter()
            .all(|&idx| self.bits[(idx / 8) as usize] & (1 << (idx & 7)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters() {
        let filter = BloomFilter::with_keys(15, 0.001, 1, 2).expect("filter");
        assert_eq!(filter.num_hashes(), 10);
        assert_eq!(filter.max_entries(), 2279);
        assert_eq!(filter.entries(), 0);
    }

    #[test]
    fn test_test_and_set() {
        let mut filter = BloomFilter::with_keys(12, 0.01, 7, 11).expect("filter");
        assert!(!filter.test(b"tag-1"));
        assert!(!filter.test_and_set(b"tag-1"));
        assert!(filter.test(b"tag-1"));
        assert!(filter.test_and_set(b"tag-1"));
        assert_eq!(filter.entries(), 1);
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(16, 0.001).expect("filter");
        for i in 0u32..1000 {
            filter.test_and_set(&i.to_be_bytes());
        }
        for i in 0u32..1000 {
            assert!(filter.test(&i.to_be_bytes()), "missing {i}");
        }
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let mut filter = BloomFilter::new(15, 0.01).expect("filter");
        let mut next = 0u32;
        while !filter.is_saturated() {
            filter.test_and_set(&next.to_le_bytes());
            next += 1;
        }
        let trials = 20_000u32;
        let hits = (next..next + trials)
            .filter(|i| filter.test(&i.to_le_bytes()))
            .count();
        let observed = hits as f64 / f64::from(trials);
        assert!(observed < 0.03, "false positive rate {observed}");
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::new(10, 0.01).expect("filter");
        filter.test_and_set(b"x");
        filter.clear();
        assert_eq!(filter.entries(), 0);
        assert!(!filter.test(b"x"));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            BloomFilter::new(32, 0.01),
            Err(ReplayError::FilterTooLarge(32))
        ));
        assert!(matches!(
            BloomFilter::new(10, 1.5),
            Err(ReplayError::InvalidRate(_))
        ));
        assert!(matches!(
            BloomFilter::new(10, 1e-12),
            Err(ReplayError::TooManyHashes(_))
        ));
    }
}

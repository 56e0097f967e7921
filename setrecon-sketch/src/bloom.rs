//! Bloom filter over byte-string keys.
//!
//! Bit positions are taken from consecutive 32-bit words of the SHA-512 of
//! the key; when more than sixteen positions are needed the digest is hashed
//! again. Both peers must use the same size and hash count.

use crate::{SketchError, SketchResult};
use sha2::{Digest, Sha512};

const WORDS_PER_DIGEST: usize = 64 / 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_count: u32,
}

impl BloomFilter {
    /// Empty filter of `size_bytes` bytes.
    pub fn new(size_bytes: usize, hash_count: u32) -> SketchResult<Self> {
        Self::from_bytes(vec![0u8; size_bytes], hash_count)
    }

    /// Filter sized for `element_count` keys at `bits_per_element`.
    ///
    /// Uses `hash_count = bits_per_element` and
    /// `ceil(n * k / ln 2)` bits, rounded up to whole bytes.
    pub fn for_elements(element_count: usize, bits_per_element: u32) -> SketchResult<Self> {
        Self::new(
            filter_size_bytes(element_count, bits_per_element),
            bits_per_element,
        )
    }

    /// Wraps received filter bytes.
    pub fn from_bytes(bits: Vec<u8>, hash_count: u32) -> SketchResult<Self> {
        if bits.is_empty() {
            return Err(SketchError::InvalidBloomFilter("zero-length filter".into()));
        }
        if hash_count == 0 {
            return Err(SketchError::InvalidBloomFilter("zero hash functions".into()));
        }
        Ok(Self { bits, hash_count })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bits.len()
    }

    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Number of set bits.
    #[must_use]
    pub fn bits_set(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn insert(&mut self, key: &[u8]) {
        for bit in self.positions(key) {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// May return false positives, never false negatives.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.positions(key)
            .into_iter()
            .all(|bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    fn positions(&self, key: &[u8]) -> Vec<usize> {
        let total_bits = self.bits.len() as u64 * 8;
        let wanted = self.hash_count as usize;
        let mut positions = Vec::with_capacity(wanted);
        let mut digest = Sha512::digest(key);
        loop {
            for word in digest.chunks_exact(4).take(WORDS_PER_DIGEST) {
                if positions.len() == wanted {
                    return positions;
                }
                let v = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                positions.push((u64::from(v) % total_bits) as usize);
            }
            if positions.len() == wanted {
                return positions;
            }
            digest = Sha512::digest(digest);
        }
    }
}

/// Byte size of [`BloomFilter::for_elements`] for the same arguments.
#[must_use]
pub fn filter_size_bytes(element_count: usize, bits_per_element: u32) -> usize {
    let bits = (element_count.max(1) as f64 * f64::from(bits_per_element)
        / std::f64::consts::LN_2)
        .ceil() as usize;
    bits.div_ceil(8).max(1)
}

/// Bits per element for a filter sent from a side holding `my_count`
/// elements to a side holding `other_count`.
///
/// `2 + ceil(log2(other / my))`, clamped to at least 1. A larger peer needs
/// a lower false positive rate.
#[must_use]
pub fn optimal_bits_per_element(my_count: u64, other_count: u64) -> u32 {
    let my = my_count.max(1) as f64;
    let other = other_count.max(1) as f64;
    let bpe = 2.0 + (other / my).log2().ceil();
    if bpe < 1.0 { 1 } else { bpe as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn many_hash_functions_rehash() {
        let mut bf = BloomFilter::new(128, 40).unwrap();
        bf.insert(b"key");
        assert!(bf.contains(b"key"));
        assert_eq!(bf.positions(b"key").len(), 40);
    }

    #[test]
    fn bits_per_element_formula() {
        assert_eq!(optimal_bits_per_element(10, 10), 2);
        assert_eq!(optimal_bits_per_element(10, 40), 4);
        assert_eq!(optimal_bits_per_element(10, 11), 3);
        assert_eq!(optimal_bits_per_element(100, 10), 1);
        assert_eq!(optimal_bits_per_element(0, 0), 2);
    }

    #[test]
    fn size_matches_constructed_filter() {
        for (n, k) in [(0, 1), (1, 2), (100, 4), (12_345, 9)] {
            let bf = BloomFilter::for_elements(n, k).unwrap();
            assert_eq!(bf.size_bytes(), filter_size_bytes(n, k));
        }
    }
}

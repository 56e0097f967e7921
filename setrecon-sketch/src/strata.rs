//! Strata estimator.
//!
//! Keys are spread over strata by the number of trailing zero bits of their
//! hash, so stratum `i` sees roughly a `2^-(i+1)` sample of the set. To
//! estimate a difference, strata are subtracted and decoded from the sparsest
//! down; the first one that fails to decode is scaled up by its sampling
//! rate.

use crate::compress;
use crate::ibf::{InvertibleBloomFilter, IBF_BUCKET_SIZE};
use crate::key::IbfKey;
use crate::{SketchError, SketchResult};

/// Number of strata.
pub const SE_STRATA_COUNT: usize = 32;
/// Buckets per stratum.
pub const SE_IBF_SIZE: usize = 80;
/// Hash functions per stratum IBF.
pub const SE_IBF_HASH_NUM: usize = 4;

/// A serialized estimator, optionally compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStrata {
    pub compressed: bool,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrataEstimator {
    strata: Vec<InvertibleBloomFilter>,
}

impl Default for StrataEstimator {
    fn default() -> Self {
        Self {
            strata: (0..SE_STRATA_COUNT).map(|_| standard_stratum()).collect(),
        }
    }
}

fn standard_stratum() -> InvertibleBloomFilter {
    InvertibleBloomFilter::zeroed(SE_IBF_SIZE, SE_IBF_HASH_NUM)
}

impl StrataEstimator {
    /// Estimator with the standard shape.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimator with a custom shape. Both peers must agree on it.
    pub fn with_shape(strata_count: usize, ibf_size: usize, hash_num: usize) -> SketchResult<Self> {
        if strata_count == 0 {
            return Err(SketchError::Malformed("estimator needs at least one stratum".into()));
        }
        let strata = (0..strata_count)
            .map(|_| InvertibleBloomFilter::new(ibf_size, hash_num))
            .collect::<SketchResult<Vec<_>>>()?;
        Ok(Self { strata })
    }

    #[must_use]
    pub fn strata_count(&self) -> usize {
        self.strata.len()
    }

    #[must_use]
    pub fn strata(&self) -> &[InvertibleBloomFilter] {
        &self.strata
    }

    fn stratum_of(&self, key: IbfKey) -> usize {
        let zeros = key.digest().stratum_bits.trailing_zeros() as usize;
        zeros.min(self.strata.len() - 1)
    }

    pub fn insert(&mut self, key: IbfKey) {
        let s = self.stratum_of(key);
        self.strata[s].insert(key);
    }

    pub fn remove(&mut self, key: IbfKey) {
        let s = self.stratum_of(key);
        self.strata[s].remove(key);
    }

    /// Estimates the size of the symmetric difference between the two
    /// underlying sets. Neither estimator is modified.
    pub fn difference(&self, other: &Self) -> SketchResult<u64> {
        if self.strata.len() != other.strata.len() {
            return Err(SketchError::SizeMismatch {
                left: self.strata.len(),
                right: other.strata.len(),
            });
        }
        let mut count: u64 = 0;
        for i in (0..self.strata.len()).rev() {
            let mut diff = self.strata[i].clone();
            diff.subtract(&other.strata[i])?;
            match diff.decode_all() {
                Ok(keys) => count += keys.len() as u64,
                Err(SketchError::DecodeFailed { .. }) => {
                    let scale = 1u64.checked_shl(i as u32 + 1).unwrap_or(u64::MAX);
                    return Ok(count.saturating_mul(scale));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Size of the raw serialization.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.strata.iter().map(|s| s.size() * IBF_BUCKET_SIZE).sum()
    }

    /// Concatenated bucket arrays of all strata.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for stratum in &self.strata {
            // Whole-range slices are always in bounds.
            let _ = stratum.write_slice(0, stratum.size(), &mut out);
        }
        out
    }

    /// Overwrites this estimator from raw bytes produced by [`Self::to_bytes`]
    /// on an estimator of the same shape.
    pub fn read_bytes(&mut self, data: &[u8]) -> SketchResult<()> {
        if data.len() != self.encoded_len() {
            return Err(SketchError::Malformed(format!(
                "strata data is {} bytes, expected {}",
                data.len(),
                self.encoded_len()
            )));
        }
        let mut offset = 0;
        for stratum in &mut self.strata {
            let len = stratum.size() * IBF_BUCKET_SIZE;
            stratum.read_slice(&data[offset..offset + len], 0)?;
            offset += len;
        }
        Ok(())
    }

    /// Serializes, compressing when that is smaller.
    #[must_use]
    pub fn encode(&self) -> EncodedStrata {
        let raw = self.to_bytes();
        let packed = compress::compress(&raw);
        if packed.len() < raw.len() {
            EncodedStrata {
                compressed: true,
                bytes: packed,
            }
        } else {
            EncodedStrata {
                compressed: false,
                bytes: raw,
            }
        }
    }

    /// Decodes a standard-shape estimator from the wire.
    pub fn decode(encoded: &EncodedStrata) -> SketchResult<Self> {
        let mut se = Self::new();
        if encoded.compressed {
            let raw = compress::decompress(&encoded.bytes, se.encoded_len())?;
            se.read_bytes(&raw)?;
        } else {
            se.read_bytes(&encoded.bytes)?;
        }
        Ok(se)
    }
}

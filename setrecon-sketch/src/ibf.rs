//! Invertible Bloom filter.
//!
//! Each key is added to `hash_num` distinct buckets. A bucket keeps the xor
//! of its keys, the xor of their checksums and a signed count. After
//! subtracting two filters, buckets holding exactly one key ("pure"
//! buckets) can be peeled off until the filter is empty or no pure bucket
//! remains.

use crate::key::{key_hash, IbfKey};
use crate::{SketchError, SketchResult};

/// Serialized size of one bucket: `id_sum` u64, `id_hash` u32, `count` i64.
pub const IBF_BUCKET_SIZE: usize = 20;

/// One IBF cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub id_sum: u64,
    pub id_hash: u32,
    pub count: i64,
}

impl Bucket {
    fn apply(&mut self, key: IbfKey, hash: u32, delta: i64) {
        self.id_sum ^= key.0;
        self.id_hash ^= hash;
        self.count = self.count.wrapping_add(delta);
    }

    fn is_zero(&self) -> bool {
        self.id_sum == 0 && self.id_hash == 0 && self.count == 0
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id_sum.to_le_bytes());
        out.extend_from_slice(&self.id_hash.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut id_sum = [0u8; 8];
        let mut id_hash = [0u8; 4];
        let mut count = [0u8; 8];
        id_sum.copy_from_slice(&bytes[0..8]);
        id_hash.copy_from_slice(&bytes[8..12]);
        count.copy_from_slice(&bytes[12..20]);
        Self {
            id_sum: u64::from_le_bytes(id_sum),
            id_hash: u32::from_le_bytes(id_hash),
            count: i64::from_le_bytes(count),
        }
    }
}

/// Which filter a decoded key came from, in `local.subtract(remote)` terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Present only in the minuend (count +1).
    Local,
    /// Present only in the subtrahend (count -1).
    Remote,
}

/// Outcome of a single decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    Key { side: Side, key: IbfKey },
    /// Every bucket is zero.
    Done,
    /// Non-empty, but no pure bucket is left.
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvertibleBloomFilter {
    buckets: Vec<Bucket>,
    hash_num: usize,
}

impl InvertibleBloomFilter {
    /// Creates an empty filter of `size` buckets.
    pub fn new(size: usize, hash_num: usize) -> SketchResult<Self> {
        if hash_num == 0 || size < hash_num {
            return Err(SketchError::TooSmall { size, hash_num });
        }
        Ok(Self {
            buckets: vec![Bucket::default(); size],
            hash_num,
        })
    }

    /// Construction for shapes fixed by crate constants.
    pub(crate) fn zeroed(size: usize, hash_num: usize) -> Self {
        debug_assert!(hash_num > 0 && size >= hash_num);
        Self {
            buckets: vec![Bucket::default(); size],
            hash_num,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn hash_num(&self) -> usize {
        self.hash_num
    }

    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// True when every bucket is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_zero)
    }

    pub fn insert(&mut self, key: IbfKey) {
        self.apply(key, 1);
    }

    pub fn remove(&mut self, key: IbfKey) {
        self.apply(key, -1);
    }

    fn apply(&mut self, key: IbfKey, delta: i64) {
        let digest = key.digest();
        for idx in digest.bucket_indices(self.buckets.len(), self.hash_num) {
            self.buckets[idx].apply(key, digest.key_hash, delta);
        }
    }

    /// Subtracts `other` bucket-wise, leaving the symmetric difference.
    pub fn subtract(&mut self, other: &Self) -> SketchResult<()> {
        if self.size() != other.size() || self.hash_num != other.hash_num {
            return Err(SketchError::SizeMismatch {
                left: self.size(),
                right: other.size(),
            });
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            mine.id_sum ^= theirs.id_sum;
            mine.id_hash ^= theirs.id_hash;
            mine.count = mine.count.wrapping_sub(theirs.count);
        }
        Ok(())
    }

    /// Returns the key held by bucket `idx` if that bucket is pure.
    ///
    /// A pure bucket has count +-1, a checksum matching its key sum, and the
    /// key actually maps to `idx`.
    fn pure_key(&self, idx: usize) -> Option<(Side, IbfKey)> {
        let bucket = &self.buckets[idx];
        let side = match bucket.count {
            1 => Side::Local,
            -1 => Side::Remote,
            _ => return None,
        };
        let key = IbfKey(bucket.id_sum);
        let digest = key.digest();
        if digest.key_hash != bucket.id_hash {
            return None;
        }
        if !digest
            .bucket_indices(self.buckets.len(), self.hash_num)
            .contains(&idx)
        {
            return None;
        }
        Some((side, key))
    }

    /// Removes a decoded key from every bucket it maps to. Returns the
    /// touched bucket indices.
    fn peel(&mut self, side: Side, key: IbfKey) -> Vec<usize> {
        let delta = match side {
            Side::Local => -1,
            Side::Remote => 1,
        };
        let hash = key_hash(key);
        let indices = key.digest().bucket_indices(self.buckets.len(), self.hash_num);
        for idx in &indices {
            self.buckets[*idx].apply(key, hash, delta);
        }
        indices
    }

    /// Extracts one key from a pure bucket.
    pub fn decode(&mut self) -> DecodeStep {
        for idx in 0..self.buckets.len() {
            if let Some((side, key)) = self.pure_key(idx) {
                self.peel(side, key);
                return DecodeStep::Key { side, key };
            }
        }
        if self.is_empty() {
            DecodeStep::Done
        } else {
            DecodeStep::Failure
        }
    }

    /// Decodes until empty.
    ///
    /// Fails if decoding gets stuck, or if more keys than buckets come out
    /// (which only happens with corrupt or adversarial input).
    pub fn decode_all(&mut self) -> SketchResult<Vec<(Side, IbfKey)>> {
        let limit = self.buckets.len();
        let mut decoded = Vec::new();
        let mut pending: Vec<usize> = (0..self.buckets.len())
            .filter(|i| matches!(self.buckets[*i].count, 1 | -1))
            .collect();

        while let Some(idx) = pending.pop() {
            let Some((side, key)) = self.pure_key(idx) else {
                continue;
            };
            if decoded.len() == limit {
                return Err(SketchError::DecodeFailed {
                    decoded: decoded.len(),
                });
            }
            decoded.push((side, key));
            for touched in self.peel(side, key) {
                if matches!(self.buckets[touched].count, 1 | -1) {
                    pending.push(touched);
                }
            }
        }

        if self.is_empty() {
            Ok(decoded)
        } else {
            Err(SketchError::DecodeFailed {
                decoded: decoded.len(),
            })
        }
    }

    /// Serializes `count` buckets starting at `start`.
    pub fn write_slice(&self, start: usize, count: usize, out: &mut Vec<u8>) -> SketchResult<()> {
        let end = start.checked_add(count).filter(|end| *end <= self.size()).ok_or(
            SketchError::OutOfRange {
                offset: start,
                count,
                size: self.size(),
            },
        )?;
        out.reserve(count * IBF_BUCKET_SIZE);
        for bucket in &self.buckets[start..end] {
            bucket.write_to(out);
        }
        Ok(())
    }

    /// Overwrites buckets starting at `start` with serialized `data`.
    /// Returns how many buckets were read.
    pub fn read_slice(&mut self, data: &[u8], start: usize) -> SketchResult<usize> {
        if data.len() % IBF_BUCKET_SIZE != 0 {
            return Err(SketchError::Malformed(format!(
                "bucket data length {} is not a multiple of {IBF_BUCKET_SIZE}",
                data.len()
            )));
        }
        let count = data.len() / IBF_BUCKET_SIZE;
        if start.checked_add(count).is_none_or(|end| end > self.size()) {
            return Err(SketchError::OutOfRange {
                offset: start,
                count,
                size: self.size(),
            });
        }
        let mut incoming = Vec::with_capacity(count);
        for chunk in data.chunks_exact(IBF_BUCKET_SIZE) {
            let bucket = Bucket::read_from(chunk);
            // No set can produce a count whose negation overflows.
            if bucket.count == i64::MIN {
                return Err(SketchError::Malformed(format!(
                    "bucket {} has count {}",
                    start + incoming.len(),
                    bucket.count
                )));
            }
            incoming.push(bucket);
        }
        self.buckets[start..start + count].copy_from_slice(&incoming);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_too_small() {
        assert!(InvertibleBloomFilter::new(3, 4).is_err());
        assert!(InvertibleBloomFilter::new(4, 0).is_err());
        assert!(InvertibleBloomFilter::new(4, 4).is_ok());
    }

    #[test]
    fn insert_then_remove_is_empty() {
        let mut ibf = InvertibleBloomFilter::new(32, 4).unwrap();
        ibf.insert(IbfKey(7));
        assert!(!ibf.is_empty());
        ibf.remove(IbfKey(7));
        assert!(ibf.is_empty());
    }

    #[test]
    fn pure_bucket_must_map_back() {
        let mut ibf = InvertibleBloomFilter::new(16, 4).unwrap();
        // Plant a count-1 bucket whose key does not hash there.
        let key = IbfKey(99);
        let indices = key.digest().bucket_indices(16, 4);
        let foreign = (0..16).find(|i| !indices.contains(i)).unwrap();
        ibf.buckets[foreign] = Bucket {
            id_sum: key.0,
            id_hash: key_hash(key),
            count: 1,
        };
        assert_eq!(ibf.pure_key(foreign), None);
    }

    #[test]
    fn unrepresentable_count_is_malformed() {
        let mut wire = Vec::new();
        Bucket {
            id_sum: 1,
            id_hash: 2,
            count: i64::MIN,
        }
        .write_to(&mut wire);
        let mut ibf = InvertibleBloomFilter::new(8, 4).unwrap();
        assert!(matches!(
            ibf.read_slice(&wire, 0),
            Err(SketchError::Malformed(_))
        ));
        assert!(ibf.is_empty());
    }

    #[test]
    fn extreme_counts_wrap_instead_of_overflowing() {
        let mut wire = Vec::new();
        for _ in 0..8 {
            Bucket {
                id_sum: 1,
                id_hash: 2,
                count: i64::MAX,
            }
            .write_to(&mut wire);
        }
        let mut remote = InvertibleBloomFilter::new(8, 4).unwrap();
        remote.read_slice(&wire, 0).unwrap();

        let mut local = InvertibleBloomFilter::new(8, 4).unwrap();
        local.remove(IbfKey(5));
        local.remove(IbfKey(5));
        local.subtract(&remote).unwrap();
        assert!(matches!(
            local.decode_all(),
            Err(SketchError::DecodeFailed { .. })
        ));
    }
}

//! Probabilistic sketches for set reconciliation.
//!
//! This crate provides the data structures both reconciliation protocols are
//! built on:
//!
//! - [`IbfKey`]: 64-bit keys derived from element hashes, with reversible salting
//! - [`InvertibleBloomFilter`]: insert/subtract/decode over fixed bucket arrays
//! - [`StrataEstimator`]: layered IBFs estimating the size of a symmetric difference
//! - [`BloomFilter`]: plain Bloom filter used by the intersection reduction loop
//!
//! Two IBFs can only be subtracted when they were built with the same size,
//! the same number of hash functions and keys salted with the same salt.
//! Everything in here is deterministic; randomness (salts) is chosen by the
//! caller.

mod bloom;
pub mod compress;
mod ibf;
mod key;
mod strata;

pub use bloom::{filter_size_bytes, optimal_bits_per_element, BloomFilter};
pub use ibf::{Bucket, DecodeStep, InvertibleBloomFilter, Side, IBF_BUCKET_SIZE};
pub use key::{derive_ibf_key, IbfKey};
pub use strata::{
    EncodedStrata, StrataEstimator, SE_IBF_HASH_NUM, SE_IBF_SIZE, SE_STRATA_COUNT,
};

use thiserror::Error;

/// Result type for sketch operations.
pub type SketchResult<T> = Result<T, SketchError>;

/// Errors raised by the sketches.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SketchError {
    /// Two filters of different shape were combined.
    #[error("ibf shape mismatch: {left} vs {right} buckets")]
    SizeMismatch { left: usize, right: usize },

    /// An IBF needs at least one bucket per hash function.
    #[error("ibf must have at least {hash_num} buckets, got {size}")]
    TooSmall { size: usize, hash_num: usize },

    /// A bucket slice does not fit the filter.
    #[error("slice out of range: offset {offset} + {count} buckets > {size}")]
    OutOfRange {
        offset: usize,
        count: usize,
        size: usize,
    },

    /// Serialized sketch data has the wrong length or layout.
    #[error("malformed sketch data: {0}")]
    Malformed(String),

    /// No pure bucket was left before the filter was empty.
    #[error("ibf decoding failed after {decoded} keys")]
    DecodeFailed { decoded: usize },

    /// Compressed strata data could not be expanded.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Bloom filter parameters are unusable.
    #[error("invalid bloom filter: {0}")]
    InvalidBloomFilter(String),
}

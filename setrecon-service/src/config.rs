//! Service configuration.

use crate::error::{ReconError, ReconResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the reconciliation service.
///
/// The defaults are the constants the protocol was designed with; both peers
/// of an operation should use the same IBF parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Largest IBF order (log2 of the bucket count) before giving up.
    pub max_ibf_order: u8,
    /// Smallest IBF order ever sent.
    pub min_ibf_order: u8,
    /// IBF buckets per estimated difference.
    pub ibf_alpha: u64,
    /// Fall back to sending the full set when the estimated difference
    /// exceeds `initial_size / full_fallback_divisor`.
    pub full_fallback_divisor: u64,
    /// Estimates above this are inflated by numerator/denominator.
    pub diff_inflation_threshold: u64,
    pub diff_inflation_numerator: u64,
    pub diff_inflation_denominator: u64,
    /// Byzantine mode fails when `received_total > base + fresh * factor`
    /// and `received_fresh < received_total / divisor`.
    pub byzantine_duplicate_base: u64,
    pub byzantine_fresh_factor: u64,
    pub byzantine_fresh_divisor: u64,
    /// How long an inbound request may wait for accept/reject (ms).
    pub incoming_timeout_ms: u64,
    /// Messages buffered for a request that was not accepted yet.
    pub max_pending_messages: usize,
    /// Upper bound on a Bloom filter's bits per element (and so its hash
    /// count), for filters we send and filters we accept.
    pub max_bloom_bits_per_element: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_ibf_order: 20,
            min_ibf_order: 2,
            ibf_alpha: 4,
            full_fallback_divisor: 4,
            diff_inflation_threshold: 200,
            diff_inflation_numerator: 3,
            diff_inflation_denominator: 2,
            byzantine_duplicate_base: 384,
            byzantine_fresh_factor: 4,
            byzantine_fresh_divisor: 6,
            incoming_timeout_ms: 60_000,
            max_pending_messages: 64,
            max_bloom_bits_per_element: 32,
        }
    }
}

impl ServiceConfig {
    /// Incoming request timeout as a duration.
    #[must_use]
    pub fn incoming_timeout(&self) -> Duration {
        Duration::from_millis(self.incoming_timeout_ms)
    }

    /// Checks that the values are usable.
    pub fn validate(&self) -> ReconResult<()> {
        if self.min_ibf_order < 2 || self.min_ibf_order > self.max_ibf_order {
            return Err(ReconError::Config(format!(
                "ibf order range {}..={} is invalid",
                self.min_ibf_order, self.max_ibf_order
            )));
        }
        if self.max_ibf_order > 30 {
            return Err(ReconError::Config(format!(
                "max_ibf_order {} is too large",
                self.max_ibf_order
            )));
        }
        if self.ibf_alpha == 0
            || self.full_fallback_divisor == 0
            || self.diff_inflation_denominator == 0
            || self.byzantine_fresh_divisor == 0
            || self.max_bloom_bits_per_element == 0
        {
            return Err(ReconError::Config("factors and divisors must be non-zero".into()));
        }
        Ok(())
    }

    /// Applies the large-difference inflation to a strata estimate.
    #[must_use]
    pub fn inflate_estimate(&self, diff: u64) -> u64 {
        if diff > self.diff_inflation_threshold {
            diff.saturating_mul(self.diff_inflation_numerator) / self.diff_inflation_denominator
        } else {
            diff
        }
    }

    /// IBF order for an estimated difference: the smallest power of two of
    /// at least `ibf_alpha * diff` buckets, clamped to the configured range.
    #[must_use]
    pub fn ibf_order_for(&self, diff: u64) -> u8 {
        let wanted = diff.saturating_mul(self.ibf_alpha).max(1);
        let mut order = self.min_ibf_order;
        while order < self.max_ibf_order && (1u64 << order) < wanted {
            order += 1;
        }
        order
    }

    /// Byzantine duplicate-ratio heuristic.
    #[must_use]
    pub fn looks_byzantine(&self, received_total: u64, received_fresh: u64) -> bool {
        received_total
            > self
                .byzantine_duplicate_base
                .saturating_add(received_fresh.saturating_mul(self.byzantine_fresh_factor))
            && received_fresh < received_total / self.byzantine_fresh_divisor
    }
}

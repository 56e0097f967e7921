//! Kinds of set operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The set operation a set (and every operation on it) performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Both peers end up with the union of the two sets.
    Union,
    /// Both peers end up with the intersection of the two sets.
    Intersection,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Union => f.write_str("union"),
            OperationType::Intersection => f.write_str("intersection"),
        }
    }
}

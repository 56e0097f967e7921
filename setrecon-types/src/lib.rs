//! Core type definitions for the set reconciliation engine.
//!
//! This crate defines the plain data types shared by the sketches, the
//! service and the wire protocol:
//! - Peer and application identifiers
//! - Elements and their content hashes
//! - The kind of set operation a set is created for
//!
//! Nothing here knows about IBFs, generations or channels.

mod element;
mod ids;
mod operation;

pub use element::{Element, ElementHash, ELEMENT_HASH_SIZE, MAX_ELEMENT_SIZE};
pub use ids::{AppId, PeerId};
pub use operation::OperationType;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("invalid element hash length: expected {expected} bytes, got {got}")]
    InvalidHashLength { expected: usize, got: usize },

    #[error("element too large: {size} bytes (max {max})")]
    ElementTooLarge { size: usize, max: usize },
}

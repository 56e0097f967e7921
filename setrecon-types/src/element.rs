//! Set elements and their content hashes.
//!
//! An element is an opaque blob tagged with an application-defined type.
//! Its identity is the SHA-512 hash over `size ++ element_type ++ data`, so two
//! elements with the same bytes but a different type are distinct.

use crate::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt;
use std::ops::{BitXor, BitXorAssign};
use std::str::FromStr;

/// Size of an element hash in bytes.
pub const ELEMENT_HASH_SIZE: usize = 64;

/// Largest element payload accepted by a set (63 KiB).
pub const MAX_ELEMENT_SIZE: usize = 63 * 1024;

/// A set element: opaque data plus an application-defined type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Element {
    /// Application-defined element type.
    pub element_type: u16,
    /// The element payload.
    pub data: Vec<u8>,
}

impl Element {
    /// Creates a new element.
    pub fn new(element_type: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            element_type,
            data: data.into(),
        }
    }

    /// Creates an element of type 0 from raw bytes.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(0, data)
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Checks the payload against [`MAX_ELEMENT_SIZE`].
    pub fn validate(&self) -> crate::Result<()> {
        if self.data.len() > MAX_ELEMENT_SIZE {
            return Err(Error::ElementTooLarge {
                size: self.data.len(),
                max: MAX_ELEMENT_SIZE,
            });
        }
        Ok(())
    }

    /// Computes the element hash.
    #[must_use]
    pub fn hash(&self) -> ElementHash {
        let mut hasher = Sha512::new();
        hasher.update((self.data.len() as u32).to_be_bytes());
        hasher.update(self.element_type.to_be_bytes());
        hasher.update(&self.data);
        ElementHash(finish(hasher))
    }
}

fn finish(hasher: Sha512) -> [u8; ELEMENT_HASH_SIZE] {
    let mut out = [0u8; ELEMENT_HASH_SIZE];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// SHA-512 identity of an element.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementHash([u8; ELEMENT_HASH_SIZE]);

impl ElementHash {
    /// The all-zero hash, identity element for xor accumulation.
    pub const ZERO: ElementHash = ElementHash([0u8; ELEMENT_HASH_SIZE]);

    /// Wraps raw hash bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ELEMENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a hash from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; ELEMENT_HASH_SIZE] =
            bytes.try_into().map_err(|_| Error::InvalidHashLength {
                expected: ELEMENT_HASH_SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ELEMENT_HASH_SIZE] {
        &self.0
    }

    /// Returns a copy of this hash mixed with a salt.
    ///
    /// Used to randomize Bloom filter positions per round so a false positive
    /// in one round is independent of the next.
    #[must_use]
    pub fn salted(&self, salt: u32) -> ElementHash {
        let mut hasher = Sha512::new();
        hasher.update(salt.to_le_bytes());
        hasher.update(self.0);
        ElementHash(finish(hasher))
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex encoded hash.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Default for ElementHash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl BitXor for ElementHash {
    type Output = ElementHash;

    fn bitxor(mut self, rhs: ElementHash) -> ElementHash {
        self ^= rhs;
        self
    }
}

impl BitXorAssign for ElementHash {
    fn bitxor_assign(&mut self, rhs: ElementHash) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl fmt::Debug for ElementHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementHash({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for ElementHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ElementHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ElementHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ElementHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

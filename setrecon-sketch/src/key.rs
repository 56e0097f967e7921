//! IBF keys.
//!
//! Every element hash maps to one 64-bit key through a keyed derivation.
//! The key does not depend on the salt; a salted key is the same key rotated
//! right by `salt mod 64`, which makes unsalting exact.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use setrecon_types::ElementHash;
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain separation for key derivation.
const IBF_KEY_DOMAIN: &[u8] = b"setrecon/ibf-key/v1";

/// A 64-bit key stored in an IBF.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IbfKey(pub u64);

impl IbfKey {
    /// Derives the (unsalted) key for an element hash.
    #[must_use]
    pub fn from_element_hash(hash: &ElementHash) -> Self {
        derive_ibf_key(hash)
    }

    /// Raw key value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Low 32 bits, used to bucket keys in the key-to-element map.
    #[must_use]
    pub const fn low32(self) -> u32 {
        self.0 as u32
    }

    /// Applies a salt (rotation right by `salt mod 64`).
    #[must_use]
    pub const fn salted(self, salt: u32) -> Self {
        Self(self.0.rotate_right(salt % 64))
    }

    /// Removes a salt applied with [`IbfKey::salted`].
    #[must_use]
    pub const fn unsalted(self, salt: u32) -> Self {
        Self(self.0.rotate_left(salt % 64))
    }

    pub(crate) fn digest(self) -> KeyDigest {
        KeyDigest::new(self)
    }
}

impl fmt::Debug for IbfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IbfKey({:#018x})", self.0)
    }
}

/// Derives the IBF key of an element hash.
///
/// HKDF-SHA256 extract over the hash with a fixed domain label; the first
/// eight bytes of the pseudo-random key are the IBF key.
#[must_use]
pub fn derive_ibf_key(hash: &ElementHash) -> IbfKey {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(IBF_KEY_DOMAIN), hash.as_bytes());
    IbfKey(read_u64(&prk[..8]))
}

/// Hash material for one (possibly salted) key value.
///
/// A single SHA-256 over the key provides the bucket checksum, the stratum
/// selector and the seed for bucket indices, so the three are independent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyDigest {
    pub(crate) key_hash: u32,
    pub(crate) stratum_bits: u64,
    index_seed: u64,
}

impl KeyDigest {
    fn new(key: IbfKey) -> Self {
        let digest = Sha256::digest(key.0.to_le_bytes());
        Self {
            key_hash: u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]),
            stratum_bits: read_u64(&digest[4..12]),
            index_seed: read_u64(&digest[12..20]),
        }
    }

    /// Computes `hash_num` distinct bucket indices in `0..size`.
    ///
    /// Callers guarantee `hash_num <= size`.
    pub(crate) fn bucket_indices(&self, size: usize, hash_num: usize) -> Vec<usize> {
        let mut indices = Vec::with_capacity(hash_num);
        let mut state = self.index_seed;
        let mut round: u64 = 0;
        while indices.len() < hash_num {
            let idx = (state % size as u64) as usize;
            if !indices.contains(&idx) {
                indices.push(idx);
            }
            round += 1;
            state = splitmix64(state ^ round.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        }
        indices
    }
}

/// Checksum stored in the `id_hash` field for a key.
pub(crate) fn key_hash(key: IbfKey) -> u32 {
    key.digest().key_hash
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

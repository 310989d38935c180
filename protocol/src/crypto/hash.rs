//! # Hashing Utilities
//!
//! `Hash` is the 32-byte digest used as the canonical commitment type
//! throughout the core. BLAKE3 is the default; SHA-256 is only used for
//! transaction identifiers.

use sha2::{Digest, Sha256};

/// A 32-byte digest.
pub type Hash = [u8; 32];

/// The hash of nothing. An empty patricia tree commits to this value.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute the BLAKE3 hash of the input data.
///
/// # Example
///
/// ```
/// use quorum_ledger::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"ledger");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple byte slices together without concatenation overhead.
///
/// Feeding the parts sequentially produces the same digest as hashing
/// their concatenation, so `blake3_hash_multi(&[a, b]) == blake3_hash(a || b)`.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute `SHA-256(SHA-256(data))`.
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_deterministic() {
        assert_eq!(blake3_hash(b"abc"), blake3_hash(b"abc"));
        assert_ne!(blake3_hash(b"abc"), blake3_hash(b"abd"));
    }

    #[test]
    fn multi_matches_concatenation() {
        let a = b"left".as_slice();
        let b = b"right".as_slice();
        let mut joined = a.to_vec();
        joined.extend_from_slice(b);
        assert_eq!(blake3_hash_multi(&[a, b]), blake3_hash(&joined));
    }

    #[test]
    fn double_sha256_differs_from_single() {
        let single = Sha256::digest(b"tx");
        assert_ne!(double_sha256(b"tx").as_slice(), single.as_slice());
    }

    #[test]
    fn double_sha256_known_vector() {
        // SHA-256(SHA-256("")) is a well-known constant.
        assert_eq!(
            hex::encode(double_sha256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}

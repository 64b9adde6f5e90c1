//! Chunk identity.
//!
//! A chunk is named by the SHA-1 of its contents; the hash is the only name
//! a chunk ever has on the wire or in the store.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::constants::HASH_SIZE;

/// A 20-byte SHA-1 chunk hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHash(pub [u8; HASH_SIZE]);

impl ChunkHash {
    /// Creates a chunk hash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hashes chunk contents.
    pub fn of_chunk(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; HASH_SIZE] = hasher.finalize().into();
        Self(digest)
    }

    /// Parses a hash from a 40-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != HASH_SIZE * 2 {
            return None;
        }
        let bytes = hex_decode(s)?;
        let mut arr = [0u8; HASH_SIZE];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Converts to a lowercase hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let hash = ChunkHash::from_bytes([0xab; 20]);
        assert_eq!(hash.to_hex(), "abababababababababababababababababababab");
        assert_eq!(ChunkHash::from_hex(&hash.to_hex()), Some(hash));
    }

    #[test]
    fn test_of_chunk_known_vector() {
        // SHA-1 of the empty string.
        let hash = ChunkHash::of_chunk(b"");
        assert_eq!(hash.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ChunkHash::from_hex("abcd").is_none());
        assert!(ChunkHash::from_hex(&"g".repeat(40)).is_none());
    }
}

//! In-memory chunk store and its file formats.
//!
//! Chunks live in memory for the whole peer lifetime: the store is loaded
//! from a fragment file at startup, extended by verified downloads, and a
//! new fragment is written when a download command completes.
//!
//! The fragment format is a length-prefixed binary map, written and read by
//! the same codec: a `u32` entry count, then per entry a 20-byte hash, a
//! `u32` byte length, and the chunk bytes. The chunkhash file is text, one
//! `<index> <hex-sha1>` entry per line with `#` comments.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::constants::{CHUNK_SIZE, HASH_SIZE};
use crate::hash::ChunkHash;

/// Errors produced by the store and its file codecs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A fragment or chunkhash file could not be read or written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The fragment bytes do not parse.
    #[error("corrupt fragment: {0}")]
    CorruptFragment(&'static str),

    /// A fragment entry's chunk is not exactly `CHUNK_SIZE` bytes.
    #[error("chunk {hash} has {len} bytes, expected {CHUNK_SIZE}")]
    BadChunkLength { hash: ChunkHash, len: usize },

    /// A chunkhash file line is not `<index> <hex-sha1>`.
    #[error("bad chunkhash line {0}: {1:?}")]
    BadHashLine(usize, String),

    /// Asked to write a chunk the store does not hold.
    #[error("chunk {0} is not in the store")]
    MissingChunk(ChunkHash),
}

/// The peer's chunk holdings, keyed by content hash.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: HashMap<ChunkHash, Bytes>,
}

impl ChunkStore {
    /// Loads a store from a fragment file.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read(path)?;
        let chunks = decode_fragment(Bytes::from(raw))?;
        Ok(Self { chunks })
    }

    /// True if the store holds this chunk.
    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.chunks.contains_key(hash)
    }

    /// Returns the chunk bytes, if held.
    pub fn get(&self, hash: &ChunkHash) -> Option<Bytes> {
        self.chunks.get(hash).cloned()
    }

    /// Commits a verified chunk.
    pub fn insert(&mut self, hash: ChunkHash, data: Bytes) {
        debug_assert_eq!(ChunkHash::of_chunk(&data), hash);
        self.chunks.insert(hash, data);
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Which of the requested hashes this store holds, in request order.
    pub fn intersection(&self, request: &[ChunkHash]) -> Vec<ChunkHash> {
        request
            .iter()
            .filter(|h| self.contains(h))
            .copied()
            .collect()
    }

    /// Writes the listed chunks as a fragment file.
    ///
    /// Every listed hash must be held; the encoder is the same one the
    /// loader consumes.
    pub fn write_fragment(&self, path: &Path, hashes: &[ChunkHash]) -> Result<(), StoreError> {
        let mut buf = BytesMut::with_capacity(4 + hashes.len() * (HASH_SIZE + 4 + CHUNK_SIZE));
        buf.put_u32(hashes.len() as u32);
        for hash in hashes {
            let data = self
                .chunks
                .get(hash)
                .ok_or(StoreError::MissingChunk(*hash))?;
            buf.put_slice(hash.as_bytes());
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
        fs::write(path, &buf)?;
        Ok(())
    }
}

fn decode_fragment(mut data: Bytes) -> Result<HashMap<ChunkHash, Bytes>, StoreError> {
    if data.remaining() < 4 {
        return Err(StoreError::CorruptFragment("missing entry count"));
    }
    let count = data.get_u32();

    let mut chunks = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        if data.remaining() < HASH_SIZE + 4 {
            return Err(StoreError::CorruptFragment("truncated entry header"));
        }
        let mut arr = [0u8; HASH_SIZE];
        data.copy_to_slice(&mut arr);
        let hash = ChunkHash::from_bytes(arr);

        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(StoreError::CorruptFragment("truncated chunk bytes"));
        }
        if len != CHUNK_SIZE {
            return Err(StoreError::BadChunkLength { hash, len });
        }
        chunks.insert(hash, data.copy_to_bytes(len));
    }

    if data.has_remaining() {
        return Err(StoreError::CorruptFragment("trailing bytes"));
    }
    Ok(chunks)
}

/// Reads a chunkhash file: the ordered list of hashes a download targets.
pub fn read_chunkhash_file(path: &Path) -> Result<Vec<ChunkHash>, StoreError> {
    let text = fs::read_to_string(path)?;
    let mut hashes = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // `<index> <hex-sha1>`; only the hash matters.
        let hex = line.split_whitespace().nth(1);
        let hash = hex
            .and_then(ChunkHash::from_hex)
            .ok_or_else(|| StoreError::BadHashLine(index + 1, line.to_string()))?;
        hashes.push(hash);
    }

    Ok(hashes)
}

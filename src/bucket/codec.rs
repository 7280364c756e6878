//! Record encoding for bucket storage
//!
//! Format: serde_json bytes compressed as an lz4 block with the size
//! prepended. The compressed stream is split into fixed-size chunks; the
//! version node stores a [`ChunkManifest`] so a reader can tell a complete
//! chunk set from a partial one.

use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Written to the version node before its chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunk_count: usize,
    /// Length of the compressed stream
    pub data_size: usize,
    /// CRC32 of the compressed stream
    pub checksum: u32,
}

impl ChunkManifest {
    pub fn describe(data: &[u8], max_chunk_size: usize) -> Self {
        Self {
            chunk_count: chunk_count(data.len(), max_chunk_size),
            data_size: data.len(),
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(path: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::corrupted(path, format!("unreadable manifest: {}", e)))
    }
}

/// Serialize and compress
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    Ok(lz4::block::compress(&json, None, true)?)
}

/// Decompress and deserialize; any failure means the stored bytes are bad
pub fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T> {
    let json = lz4::block::decompress(data, None)
        .map_err(|e| Error::corrupted(path, format!("decompression failed: {}", e)))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::corrupted(path, format!("deserialization failed: {}", e)))
}

/// Number of chunks for a stream; an empty stream still takes one chunk
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    len.div_ceil(max_chunk_size).max(1)
}

/// Split into chunks of at most `max_chunk_size` bytes
pub fn split(data: &[u8], max_chunk_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(max_chunk_size).collect()
}

/// Concatenate chunks (in index order) and check them against the manifest
pub fn assemble(path: &str, manifest: &ChunkManifest, chunks: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    if chunks.len() != manifest.chunk_count {
        return Err(Error::corrupted(
            path,
            format!(
                "expected {} chunks, found {}",
                manifest.chunk_count,
                chunks.len()
            ),
        ));
    }

    let data = chunks.concat();
    if data.len() != manifest.data_size {
        return Err(Error::corrupted(
            path,
            format!("expected {} bytes, found {}", manifest.data_size, data.len()),
        ));
    }

    let checksum = crc32fast::hash(&data);
    if checksum != manifest.checksum {
        return Err(Error::corrupted(
            path,
            format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                manifest.checksum, checksum
            ),
        ));
    }
    Ok(data)
}

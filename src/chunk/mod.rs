//! Content-addressed chunk store with deduplication
//!
//! This module provides:
//! - Content-defined chunking with a Rabin-fingerprint rolling hash
//! - Fixed-size chunking fallback
//! - Reference-counted, SHA-256-addressed chunk storage
//! - Deduplication statistics

pub mod chunker;

pub use chunker::{ChunkingConfig, FixedChunker, RabinChunker};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Chunk store errors
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Chunk checksum mismatch: {0}")]
    ChecksumMismatch(String),
}

/// Result type for chunk operations
pub type ChunkResult<T> = Result<T, ChunkError>;

/// Information about a stored chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Content hash (SHA-256, hex) - the chunk's identity
    pub chunk_id: String,
    /// Offset in the originating data
    pub offset: u64,
    /// Chunk size in bytes
    pub size: u64,
    /// MD5 content checksum for integrity verification
    pub checksum: String,
    /// Number of live snapshots referencing this chunk
    pub ref_count: u64,
}

/// Chunk store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStoreStats {
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub total_references: u64,
    /// references / chunks; 1.0 means no deduplication benefit
    pub dedup_ratio: f64,
}

struct ChunkIndex {
    chunks: HashMap<String, Vec<u8>>,
    info: HashMap<String, ChunkInfo>,
}

/// Storage for deduplicated chunks.
///
/// Adds for the same identifier are serialized by the index lock so
/// reference counts cannot lose updates under concurrent backups.
pub struct ChunkStore {
    index: Mutex<ChunkIndex>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(ChunkIndex {
                chunks: HashMap::new(),
                info: HashMap::new(),
            }),
        }
    }

    /// Add a chunk, deduplicating by content hash. Returns the chunk info
    /// with the updated reference count.
    pub async fn add(&self, data: &[u8], offset: u64) -> ChunkInfo {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(data);
        let chunk_id = hex::encode(hasher.finalize());

        let mut index = self.index.lock().await;

        if let Some(info) = index.info.get_mut(&chunk_id) {
            info.ref_count += 1;
            log::debug!("Chunk deduplicated: {} (refs {})", &chunk_id[..8], info.ref_count);
            return info.clone();
        }

        let info = ChunkInfo {
            chunk_id: chunk_id.clone(),
            offset,
            size: data.len() as u64,
            checksum: format!("{:x}", md5::compute(data)),
            ref_count: 1,
        };

        index.chunks.insert(chunk_id.clone(), data.to_vec());
        index.info.insert(chunk_id.clone(), info.clone());

        log::debug!("New chunk stored: {} ({} bytes)", &chunk_id[..8], data.len());
        info
    }

    /// Get chunk data by identifier.
    pub async fn get(&self, chunk_id: &str) -> Option<Vec<u8>> {
        self.index.lock().await.chunks.get(chunk_id).cloned()
    }

    /// Get chunk data, verifying the recorded MD5 checksum.
    pub async fn get_verified(&self, chunk_id: &str) -> ChunkResult<Vec<u8>> {
        let index = self.index.lock().await;
        let data = index
            .chunks
            .get(chunk_id)
            .ok_or_else(|| ChunkError::ChunkNotFound(chunk_id.to_string()))?;
        let info = index
            .info
            .get(chunk_id)
            .ok_or_else(|| ChunkError::ChunkNotFound(chunk_id.to_string()))?;

        if format!("{:x}", md5::compute(data)) != info.checksum {
            return Err(ChunkError::ChecksumMismatch(chunk_id.to_string()));
        }
        Ok(data.clone())
    }

    /// Whether the store resolves this identifier.
    pub async fn contains(&self, chunk_id: &str) -> bool {
        self.index.lock().await.chunks.contains_key(chunk_id)
    }

    /// Current reference count for an identifier, if present.
    pub async fn ref_count(&self, chunk_id: &str) -> Option<u64> {
        self.index
            .lock()
            .await
            .info
            .get(chunk_id)
            .map(|info| info.ref_count)
    }

    /// Decrement the reference count; erase the bytes when it reaches
    /// zero. Returns true when the chunk was physically removed.
    pub async fn remove(&self, chunk_id: &str) -> bool {
        let mut index = self.index.lock().await;

        let remaining = match index.info.get_mut(chunk_id) {
            Some(info) => {
                info.ref_count = info.ref_count.saturating_sub(1);
                info.ref_count
            }
            None => return false,
        };

        if remaining == 0 {
            index.chunks.remove(chunk_id);
            index.info.remove(chunk_id);
            log::debug!("Chunk removed: {}", &chunk_id[..8]);
            return true;
        }
        false
    }

    /// Chunk store statistics.
    pub async fn stats(&self) -> ChunkStoreStats {
        let index = self.index.lock().await;
        let total_chunks = index.chunks.len() as u64;
        let total_bytes: u64 = index.chunks.values().map(|data| data.len() as u64).sum();
        let total_references: u64 = index.info.values().map(|info| info.ref_count).sum();

        ChunkStoreStats {
            total_chunks,
            total_bytes,
            total_references,
            dedup_ratio: if total_chunks > 0 {
                total_references as f64 / total_chunks as f64
            } else {
                1.0
            },
        }
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

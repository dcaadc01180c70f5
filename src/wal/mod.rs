//! Write-ahead log and checkpoint manager
//!
//! This module provides:
//! - Append-only, line-delimited JSON transaction log with segment
//!   rotation at a size cap
//! - In-memory recent-entries ring for fast reads
//! - Optional gzip compression of rotated segments
//! - Retention sweep deleting segments past the retention window
//! - Periodic full-state checkpoints with canonical-JSON checksums

pub mod checkpoint;

pub use checkpoint::{CheckpointConfig, CheckpointInfo, CheckpointManager, StateProvider};

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// WAL errors
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entry checksum mismatch: {0}")]
    ChecksumMismatch(String),
}

/// Result type for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Transaction operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Create,
    Update,
    Delete,
    Checkpoint,
    Snapshot,
}

/// One append-only transaction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionKind,
    pub object_id: String,
    pub operation: serde_json::Value,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    /// SHA-256 over the canonical operation payload
    pub checksum: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TransactionEntry {
    /// Build an entry with a generated transaction id and a checksum over
    /// the operation payload.
    pub fn new(
        kind: TransactionKind,
        object_id: &str,
        operation: serde_json::Value,
        before_state: Option<serde_json::Value>,
        after_state: Option<serde_json::Value>,
        user_id: Option<String>,
    ) -> Self {
        let transaction_id = format!("txn_{}_{}", uuid::Uuid::new_v4().simple(), object_id);
        Self {
            transaction_id,
            timestamp: Utc::now(),
            kind,
            object_id: object_id.to_string(),
            checksum: checksum_of(&operation),
            operation,
            before_state,
            after_state,
            user_id,
            metadata: HashMap::new(),
        }
    }

    /// Validate the recorded checksum against the operation payload.
    pub fn verify_checksum(&self) -> bool {
        checksum_of(&self.operation) == self.checksum
    }
}

/// SHA-256 over the canonical serialized form. serde_json maps are
/// key-ordered, so serialization is already canonical.
fn checksum_of(operation: &serde_json::Value) -> String {
    let serialized = operation.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub wal_dir: PathBuf,
    /// Segment rotation threshold (default 16 MiB)
    pub segment_max_bytes: u64,
    /// Gzip rotated segments
    pub compress_rotated: bool,
    /// Segments older than this are deleted by the retention sweep
    pub retention_days: i64,
    /// Recent-entries ring capacity
    pub ring_capacity: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("/tmp/cadvault/wal"),
            segment_max_bytes: 16 * 1024 * 1024,
            compress_rotated: true,
            retention_days: 7,
            ring_capacity: 1000,
        }
    }
}

struct SegmentState {
    current: Option<PathBuf>,
    size: u64,
}

/// Append-only write-ahead log over local segment files.
///
/// Appends are serialized by a single lock; reads take no lock on the
/// segment files and tolerate concurrent appends.
pub struct WalManager {
    config: WalConfig,
    /// The append lock: segment state is only touched while holding it.
    segment: Mutex<SegmentState>,
    ring: RwLock<VecDeque<TransactionEntry>>,
}

impl WalManager {
    pub async fn new(config: WalConfig) -> WalResult<Self> {
        tokio::fs::create_dir_all(&config.wal_dir).await?;
        Ok(Self {
            config,
            segment: Mutex::new(SegmentState {
                current: None,
                size: 0,
            }),
            ring: RwLock::new(VecDeque::new()),
        })
    }

    /// Append one entry. Rotates the current segment first when the
    /// serialized entry would push it past the size cap.
    pub async fn append(&self, entry: &TransactionEntry) -> WalResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        {
            let mut segment = self.segment.lock().await;

            let needs_rotation = match &segment.current {
                None => true,
                Some(_) => segment.size + line.len() as u64 > self.config.segment_max_bytes,
            };
            if needs_rotation {
                self.rotate(&mut segment).await?;
            }

            let path = match &segment.current {
                Some(path) => path.clone(),
                None => {
                    return Err(WalError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no open WAL segment",
                    )))
                }
            };
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            segment.size += line.len() as u64;
        }

        let mut ring = self.ring.write().await;
        ring.push_back(entry.clone());
        while ring.len() > self.config.ring_capacity {
            ring.pop_front();
        }

        log::debug!(
            "WAL entry appended: {} ({:?}, {} bytes)",
            entry.transaction_id,
            entry.kind,
            line.len()
        );
        Ok(())
    }

    /// Rotate to a fresh segment, optionally compressing the old one.
    async fn rotate(&self, segment: &mut SegmentState) -> WalResult<()> {
        if let Some(old) = segment.current.take() {
            log::info!("Rotating WAL segment: {}", old.display());
            if self.config.compress_rotated {
                compress_segment(&old).await?;
            }
        }

        let name = format!("wal_{}.log", uuid::Uuid::new_v4().simple());
        segment.current = Some(self.config.wal_dir.join(name));
        segment.size = 0;
        Ok(())
    }

    /// Read entries in timestamp order, optionally bounded and limited.
    ///
    /// The recent ring serves the read when it covers the requested
    /// window; otherwise the segment files are scanned.
    pub async fn read(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> WalResult<Vec<TransactionEntry>> {
        let mut entries = {
            let ring = self.ring.read().await;
            let ring_covers = match (start_time, ring.front()) {
                (Some(start), Some(oldest)) => oldest.timestamp <= start,
                _ => false,
            };
            if ring_covers {
                ring.iter().cloned().collect::<Vec<_>>()
            } else {
                drop(ring);
                self.scan_segments().await?
            }
        };

        entries.retain(|entry| {
            start_time.map_or(true, |start| entry.timestamp >= start)
                && end_time.map_or(true, |end| entry.timestamp <= end)
        });
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });

        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Scan every segment file lexicographically, validating checksums.
    async fn scan_segments(&self) -> WalResult<Vec<TransactionEntry>> {
        let mut paths = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.wal_dir).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name.starts_with("wal_") && (name.ends_with(".log") || name.ends_with(".log.gz")) {
                paths.push(dir_entry.path());
            }
        }
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            let raw = tokio::fs::read(&path).await?;
            let text = if path.extension().map_or(false, |ext| ext == "gz") {
                decompress_gzip(&raw)?
            } else {
                raw
            };

            for line in text.split(|&byte| byte == b'\n') {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<TransactionEntry>(line) {
                    Ok(entry) => {
                        if !entry.verify_checksum() {
                            return Err(WalError::ChecksumMismatch(entry.transaction_id));
                        }
                        entries.push(entry);
                    }
                    Err(e) => {
                        log::warn!("Skipping malformed WAL line in {}: {}", path.display(), e);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Delete segments older than the retention window.
    pub async fn retention_sweep(&self) -> WalResult<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let mut deleted = 0;

        let current = self.segment.lock().await.current.clone();

        let mut dir = tokio::fs::read_dir(&self.config.wal_dir).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("wal_") {
                continue;
            }
            if current.as_deref() == Some(path.as_path()) {
                continue;
            }

            let metadata = dir_entry.metadata().await?;
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());

            if modified < cutoff {
                tokio::fs::remove_file(&path).await?;
                deleted += 1;
                log::debug!("Expired WAL segment deleted: {}", name);
            }
        }
        Ok(deleted)
    }

    /// Number of entries currently buffered in the ring (test hook).
    pub async fn ring_len(&self) -> usize {
        self.ring.read().await.len()
    }
}

async fn compress_segment(path: &PathBuf) -> WalResult<()> {
    use std::io::Write;

    let raw = tokio::fs::read(path).await?;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    let mut gz_path = path.clone();
    gz_path.set_extension("log.gz");
    tokio::fs::write(&gz_path, compressed).await?;
    tokio::fs::remove_file(path).await?;
    Ok(())
}

fn decompress_gzip(data: &[u8]) -> WalResult<Vec<u8>> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

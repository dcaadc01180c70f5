//! Object store trait and in-memory implementation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Storage unreachable: {0}")]
    Unreachable(String),

    #[error("Object too large: {size} bytes (max {max})")]
    ObjectTooLarge { size: u64, max: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage tier: monotonically increasing access latency, decreasing cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Warm,
    Cold,
    Glacier,
}

impl StorageTier {
    /// Physical bucket backing this tier.
    pub fn bucket(&self) -> &'static str {
        match self {
            StorageTier::Hot => "backups-hot",
            StorageTier::Warm => "backups-warm",
            StorageTier::Cold => "backups-cold",
            StorageTier::Glacier => "backups-glacier",
        }
    }

    /// All tiers in probe order (hot first).
    pub fn all() -> [StorageTier; 4] {
        [
            StorageTier::Hot,
            StorageTier::Warm,
            StorageTier::Cold,
            StorageTier::Glacier,
        ]
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageTier::Hot => "hot",
            StorageTier::Warm => "warm",
            StorageTier::Cold => "cold",
            StorageTier::Glacier => "glacier",
        };
        f.write_str(name)
    }
}

/// Metadata attached to a stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    /// SHA-256 of the object body, hex-encoded
    pub sha256: Option<String>,
    pub version_id: String,
    pub custom: HashMap<String, String>,
}

/// Result of a successful put
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResult {
    pub key: String,
    pub tier: StorageTier,
    pub size: u64,
    /// Server-assigned version identifier (versioning is on everywhere)
    pub version_id: String,
}

/// Presigned URL operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignOperation {
    Get,
    Put,
    Head,
}

impl PresignOperation {
    pub fn http_method(&self) -> &'static str {
        match self {
            PresignOperation::Get => "GET",
            PresignOperation::Put => "PUT",
            PresignOperation::Head => "HEAD",
        }
    }
}

/// Clamp a presigned-URL expiry into the accepted [1 s, 24 h] range.
pub fn clamp_presign_expiry(expiry_secs: u64) -> u64 {
    expiry_secs.clamp(1, 86_400)
}

/// Object store trait - the byte sink beneath the chunk store and WAL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload an object into the bucket backing `tier`.
    async fn put(
        &self,
        tier: StorageTier,
        key: &str,
        data: &[u8],
        metadata: ObjectMetadata,
    ) -> StorageResult<PutResult>;

    /// Download an object, probing tier buckets hot-first.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        for tier in StorageTier::all() {
            match self.get_from(tier, key).await {
                Ok(data) => return Ok(data),
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::NotFound(key.to_string()))
    }

    /// Download an object from a specific tier bucket.
    async fn get_from(&self, tier: StorageTier, key: &str) -> StorageResult<Vec<u8>>;

    /// Object metadata without the body, probing tiers hot-first.
    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata>;

    /// Delete an object from every tier bucket. Absent objects are success.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Move an object between tier buckets: copy, then delete the source.
    /// A same-tier move is a no-op reporting success. If the copy succeeds
    /// but the source delete fails, the object counts as moved and the
    /// stale copy is queued for best-effort cleanup.
    async fn move_tier(&self, key: &str, from: StorageTier, to: StorageTier)
        -> StorageResult<()>;

    /// List keys under a prefix, optionally restricted to one tier,
    /// bounded by `max_results`.
    async fn list(
        &self,
        prefix: &str,
        tier: Option<StorageTier>,
        max_results: usize,
    ) -> StorageResult<Vec<String>>;

    /// Presigned URL for temporary direct access. Expiry is clamped to
    /// [1 s, 24 h].
    async fn presigned_url(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry_secs: u64,
    ) -> StorageResult<String>;
}

// ============================================================================
// In-Memory Implementation (tests)
// ============================================================================

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: ObjectMetadata,
}

/// In-memory object store with per-tier namespaces and versioning.
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(StorageTier, String), StoredObject>>,
    version_counter: RwLock<u64>,
    /// Stale copies left behind by partially-failed tier moves
    cleanup_queue: RwLock<Vec<(StorageTier, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            version_counter: RwLock::new(0),
            cleanup_queue: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored objects across all tiers (test helper).
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Tier currently holding `key`, if any (test helper).
    pub async fn tier_of(&self, key: &str) -> Option<StorageTier> {
        let objects = self.objects.read().await;
        StorageTier::all()
            .into_iter()
            .find(|tier| objects.contains_key(&(*tier, key.to_string())))
    }

    async fn next_version(&self) -> String {
        let mut counter = self.version_counter.write().await;
        *counter += 1;
        format!("v{:08}", *counter)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        tier: StorageTier,
        key: &str,
        data: &[u8],
        mut metadata: ObjectMetadata,
    ) -> StorageResult<PutResult> {
        let version_id = self.next_version().await;
        metadata.key = key.to_string();
        metadata.size = data.len() as u64;
        metadata.modified = Utc::now();
        metadata.version_id = version_id.clone();

        log::debug!("Storing {} bytes at {}/{}", data.len(), tier.bucket(), key);

        self.objects.write().await.insert(
            (tier, key.to_string()),
            StoredObject {
                data: data.to_vec(),
                metadata,
            },
        );

        Ok(PutResult {
            key: key.to_string(),
            tier,
            size: data.len() as u64,
            version_id,
        })
    }

    async fn get_from(&self, tier: StorageTier, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(&(tier, key.to_string()))
            .map(|obj| obj.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let objects = self.objects.read().await;
        for tier in StorageTier::all() {
            if let Some(obj) = objects.get(&(tier, key.to_string())) {
                return Ok(obj.metadata.clone());
            }
        }
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        for tier in StorageTier::all() {
            objects.remove(&(tier, key.to_string()));
        }
        Ok(())
    }

    async fn move_tier(
        &self,
        key: &str,
        from: StorageTier,
        to: StorageTier,
    ) -> StorageResult<()> {
        if from == to {
            return Ok(());
        }

        let mut objects = self.objects.write().await;
        let obj = objects
            .get(&(from, key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        objects.insert((to, key.to_string()), obj);
        if objects.remove(&(from, key.to_string())).is_none() {
            self.cleanup_queue.write().await.push((from, key.to_string()));
        }

        log::debug!("Moved {} from {} to {}", key, from, to);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        tier: Option<StorageTier>,
        max_results: usize,
    ) -> StorageResult<Vec<String>> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(object_tier, key)| {
                key.starts_with(prefix) && tier.map_or(true, |t| *object_tier == t)
            })
            .map(|(_, key)| key.clone())
            .collect();

        keys.sort();
        keys.dedup();
        keys.truncate(max_results);
        Ok(keys)
    }

    async fn presigned_url(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry_secs: u64,
    ) -> StorageResult<String> {
        let expiry = clamp_presign_expiry(expiry_secs);
        Ok(format!(
            "memory://{}?method={}&expires={}",
            key,
            operation.http_method(),
            expiry
        ))
    }
}

impl ObjectMetadata {
    /// Empty metadata for callers that attach nothing beyond defaults.
    pub fn empty() -> Self {
        Self {
            key: String::new(),
            size: 0,
            modified: Utc::now(),
            content_type: None,
            content_disposition: None,
            sha256: None,
            version_id: String::new(),
            custom: HashMap::new(),
        }
    }

    /// Metadata with content type/disposition derived from the key's
    /// extension and the body's SHA-256 attached.
    pub fn for_upload(key: &str, data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(data);

        Self {
            content_type: Some(super::keys::content_type_for(key).to_string()),
            content_disposition: Some(super::keys::content_disposition_for(key)),
            sha256: Some(hex::encode(hasher.finalize())),
            ..Self::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(StorageTier::Hot < StorageTier::Warm);
        assert!(StorageTier::Warm < StorageTier::Cold);
        assert!(StorageTier::Cold < StorageTier::Glacier);
        assert_eq!(StorageTier::Glacier.bucket(), "backups-glacier");
    }

    #[test]
    fn test_presign_expiry_clamp() {
        assert_eq!(clamp_presign_expiry(0), 1);
        assert_eq!(clamp_presign_expiry(600), 600);
        assert_eq!(clamp_presign_expiry(1_000_000), 86_400);
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryObjectStore::new();
        let data = b"fcstd document bytes";

        let result = store
            .put(
                StorageTier::Hot,
                "artefacts/job-1/model.fcstd",
                data,
                ObjectMetadata::for_upload("artefacts/job-1/model.fcstd", data),
            )
            .await
            .unwrap();
        assert_eq!(result.size, data.len() as u64);
        assert!(!result.version_id.is_empty());

        let read_back = store.get("artefacts/job-1/model.fcstd").await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn test_get_probes_colder_tiers() {
        let store = MemoryObjectStore::new();
        store
            .put(StorageTier::Cold, "snapshots/s/backup_s_1", b"cold", ObjectMetadata::empty())
            .await
            .unwrap();

        assert_eq!(store.get("snapshots/s/backup_s_1").await.unwrap(), b"cold");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        assert!(store.delete("absent-key").await.is_ok());

        store
            .put(StorageTier::Hot, "k", b"x", ObjectMetadata::empty())
            .await
            .unwrap();
        assert!(store.delete("k").await.is_ok());
        assert!(store.delete("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_move_tier_same_tier_noop() {
        let store = MemoryObjectStore::new();
        store
            .put(StorageTier::Warm, "k", b"x", ObjectMetadata::empty())
            .await
            .unwrap();

        assert!(store.move_tier("k", StorageTier::Warm, StorageTier::Warm).await.is_ok());
        assert_eq!(store.tier_of("k").await, Some(StorageTier::Warm));
    }

    #[tokio::test]
    async fn test_move_tier_relocates() {
        let store = MemoryObjectStore::new();
        store
            .put(StorageTier::Hot, "k", b"x", ObjectMetadata::empty())
            .await
            .unwrap();

        store.move_tier("k", StorageTier::Hot, StorageTier::Warm).await.unwrap();
        assert_eq!(store.tier_of("k").await, Some(StorageTier::Warm));
        assert_eq!(store.get("k").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_list_bounded_and_filtered() {
        let store = MemoryObjectStore::new();
        for i in 0..5 {
            store
                .put(
                    StorageTier::Hot,
                    &format!("wal/wal_{:02}.log", i),
                    b"entry",
                    ObjectMetadata::empty(),
                )
                .await
                .unwrap();
        }
        store
            .put(StorageTier::Cold, "checkpoints/ckpt_a.json", b"{}", ObjectMetadata::empty())
            .await
            .unwrap();

        let keys = store.list("wal/", None, 3).await.unwrap();
        assert_eq!(keys.len(), 3);

        let cold = store.list("", Some(StorageTier::Cold), 100).await.unwrap();
        assert_eq!(cold, vec!["checkpoints/ckpt_a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_upload_metadata_defaults() {
        let metadata = ObjectMetadata::for_upload("artefacts/j/part.step", b"ISO-10303-21;");
        assert_eq!(metadata.content_type.as_deref(), Some("model/step"));
        assert!(metadata.sha256.is_some());
        assert!(metadata
            .content_disposition
            .as_deref()
            .unwrap()
            .starts_with("attachment"));
    }
}

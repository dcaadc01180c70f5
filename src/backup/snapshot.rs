//! Snapshot metadata and per-source chain index

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageTier;

/// Snapshot kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Complete, independent backup
    Full,
    /// Changes relative to the chain tip
    Incremental,
    /// Changes relative to the last full backup
    Differential,
    /// Full backup replayed from an incremental chain
    Synthetic,
}

/// Integrity verdict recorded by verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotIntegrity {
    Unverified,
    Valid,
    Corrupted,
    Error,
}

/// A point-in-time view of one logical source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_id: String,
    pub kind: SnapshotKind,
    /// Parent snapshot for incremental/differential kinds
    pub parent_id: Option<String>,
    /// Ordered chunk identifiers composing the content
    pub chunks: Vec<String>,
    /// Offset-to-chunk map
    pub chunk_map: BTreeMap<u64, String>,
    /// Total logical size in bytes
    pub total_size: u64,
    /// Unique (post-dedup) size in bytes
    pub unique_size: u64,
    pub dedup_ratio: f64,
    pub created_at: DateTime<Utc>,
    pub tier: StorageTier,
    /// Name of the attached retention policy, if any
    pub retention_policy: Option<String>,
    pub integrity: SnapshotIntegrity,
    /// SHA-256 of the source payload, hex-encoded
    pub content_sha256: String,
    /// Object-store key holding the persisted metadata envelope
    pub object_key: String,
    /// Set when a synthetic full superseded the chain this snapshot was in
    pub superseded_by: Option<String>,
    pub tags: HashMap<String, String>,
}

impl Snapshot {
    /// Whether the lifecycle sweep may consider this snapshot for
    /// retention deletion. Corrupted snapshots are kept for forensics.
    pub fn eligible_for_expiry(&self) -> bool {
        self.integrity != SnapshotIntegrity::Corrupted
    }
}

/// In-memory snapshot repository: metadata plus per-source chains.
///
/// The index is the swappable persistence seam; the engine and the
/// lifecycle manager share one instance behind a lock.
#[derive(Default)]
pub struct SnapshotIndex {
    snapshots: HashMap<String, Snapshot>,
    /// source_id -> ordered snapshot ids, earliest full first
    chains: HashMap<String, Vec<String>>,
}

impl SnapshotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, snapshot: Snapshot) {
        self.chains
            .entry(snapshot.source_id.clone())
            .or_default()
            .push(snapshot.snapshot_id.clone());
        self.snapshots.insert(snapshot.snapshot_id.clone(), snapshot);
    }

    /// Insert a snapshot without touching any chain (used when loading
    /// metadata back from storage).
    pub fn insert_detached(&mut self, snapshot: Snapshot) {
        self.snapshots.insert(snapshot.snapshot_id.clone(), snapshot);
    }

    pub fn get(&self, snapshot_id: &str) -> Option<&Snapshot> {
        self.snapshots.get(snapshot_id)
    }

    pub fn get_mut(&mut self, snapshot_id: &str) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(snapshot_id)
    }

    pub fn remove(&mut self, snapshot_id: &str) -> Option<Snapshot> {
        let snapshot = self.snapshots.remove(snapshot_id)?;
        if let Some(chain) = self.chains.get_mut(&snapshot.source_id) {
            chain.retain(|id| id != snapshot_id);
        }
        Some(snapshot)
    }

    pub fn chain(&self, source_id: &str) -> &[String] {
        self.chains
            .get(source_id)
            .map(|chain| chain.as_slice())
            .unwrap_or(&[])
    }

    /// Replace a source's chain (synthetic-full supersession). The old
    /// chain's snapshots remain in the repository.
    pub fn replace_chain(&mut self, source_id: &str, chain: Vec<String>) {
        self.chains.insert(source_id.to_string(), chain);
    }

    pub fn chain_tip(&self, source_id: &str) -> Option<&Snapshot> {
        self.chain(source_id)
            .last()
            .and_then(|id| self.snapshots.get(id))
    }

    pub fn all(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.snapshots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Snapshots of one source, newest first (version-based retention).
    pub fn by_source_newest_first(&self, source_id: &str) -> Vec<&Snapshot> {
        let mut snapshots: Vec<&Snapshot> = self
            .snapshots
            .values()
            .filter(|snapshot| snapshot.source_id == source_id)
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.chains.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, source: &str, kind: SnapshotKind) -> Snapshot {
        Snapshot {
            snapshot_id: id.to_string(),
            source_id: source.to_string(),
            kind,
            parent_id: None,
            chunks: Vec::new(),
            chunk_map: BTreeMap::new(),
            total_size: 0,
            unique_size: 0,
            dedup_ratio: 0.0,
            created_at: Utc::now(),
            tier: StorageTier::Hot,
            retention_policy: None,
            integrity: SnapshotIntegrity::Unverified,
            content_sha256: String::new(),
            object_key: String::new(),
            superseded_by: None,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_chain_ordering() {
        let mut index = SnapshotIndex::new();
        index.insert(snapshot("s1", "doc", SnapshotKind::Full));
        index.insert(snapshot("s2", "doc", SnapshotKind::Incremental));
        index.insert(snapshot("s3", "doc", SnapshotKind::Incremental));

        assert_eq!(index.chain("doc"), &["s1", "s2", "s3"]);
        assert_eq!(index.chain_tip("doc").unwrap().snapshot_id, "s3");
        assert!(index.chain("other").is_empty());
    }

    #[test]
    fn test_remove_updates_chain() {
        let mut index = SnapshotIndex::new();
        index.insert(snapshot("s1", "doc", SnapshotKind::Full));
        index.insert(snapshot("s2", "doc", SnapshotKind::Incremental));

        index.remove("s1");
        assert_eq!(index.chain("doc"), &["s2"]);
        assert!(index.get("s1").is_none());
    }

    #[test]
    fn test_replace_chain_keeps_snapshots() {
        let mut index = SnapshotIndex::new();
        index.insert(snapshot("s1", "doc", SnapshotKind::Full));
        index.insert(snapshot("s2", "doc", SnapshotKind::Incremental));
        index.insert(snapshot("syn", "doc", SnapshotKind::Synthetic));

        index.replace_chain("doc", vec!["syn".to_string()]);
        assert_eq!(index.chain("doc"), &["syn"]);
        assert!(index.get("s1").is_some());
        assert!(index.get("s2").is_some());
    }

    #[test]
    fn test_corrupted_excluded_from_expiry() {
        let mut snap = snapshot("s1", "doc", SnapshotKind::Full);
        assert!(snap.eligible_for_expiry());
        snap.integrity = SnapshotIntegrity::Corrupted;
        assert!(!snap.eligible_for_expiry());
    }
}

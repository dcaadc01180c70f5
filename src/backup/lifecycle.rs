//! Tier and lifecycle manager
//!
//! Periodic sweep that ages snapshots down the tier ladder and retires
//! data whose retention policy has expired. Transitions are applied
//! strictly before deletions within a sweep, and the sweep is idempotent.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::chunk::ChunkStore;
use crate::storage::{ObjectStore, StorageTier};

use super::engine::{BackupError, BackupResult};
use super::retention::{RetentionPolicy, RetentionRegistry};
use super::snapshot::SnapshotIndex;

/// One age-driven tier transition rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from: StorageTier,
    pub to: StorageTier,
    pub after_days: i64,
    pub enabled: bool,
}

impl TransitionRule {
    pub fn new(from: StorageTier, to: StorageTier, after_days: i64) -> Self {
        Self {
            from,
            to,
            after_days,
            enabled: true,
        }
    }

    /// Default ladder: hot -> warm after 7 days, warm -> cold after 30,
    /// cold -> glacier after 90.
    pub fn defaults() -> Vec<TransitionRule> {
        vec![
            TransitionRule::new(StorageTier::Hot, StorageTier::Warm, 7),
            TransitionRule::new(StorageTier::Warm, StorageTier::Cold, 30),
            TransitionRule::new(StorageTier::Cold, StorageTier::Glacier, 90),
        ]
    }
}

/// Outcome of one lifecycle sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub transitions: u64,
    pub deletions: u64,
    pub chunks_erased: u64,
    pub errors: Vec<String>,
}

/// Owns the age-driven movement of data between tiers and the
/// retirement of expired snapshots.
pub struct LifecycleManager {
    rules: Vec<TransitionRule>,
    index: Arc<RwLock<SnapshotIndex>>,
    chunk_store: Arc<ChunkStore>,
    object_store: Arc<dyn ObjectStore>,
    policies: Arc<RwLock<RetentionRegistry>>,
}

impl LifecycleManager {
    pub fn new(
        rules: Vec<TransitionRule>,
        index: Arc<RwLock<SnapshotIndex>>,
        chunk_store: Arc<ChunkStore>,
        object_store: Arc<dyn ObjectStore>,
        policies: Arc<RwLock<RetentionRegistry>>,
    ) -> Self {
        Self {
            rules,
            index,
            chunk_store,
            object_store,
            policies,
        }
    }

    /// One sweep: transitions first, then retention deletions, so a
    /// snapshot about to expire is not first moved to a colder tier.
    pub async fn apply(&self) -> BackupResult<LifecycleReport> {
        let mut report = LifecycleReport::default();

        let expiring = self.collect_expiring().await;
        self.apply_transitions(&mut report, &expiring).await?;
        self.apply_deletions(&mut report, expiring).await?;

        log::info!(
            "Lifecycle sweep complete: {} transitions, {} deletions, {} chunks erased",
            report.transitions,
            report.deletions,
            report.chunks_erased
        );
        Ok(report)
    }

    async fn apply_transitions(
        &self,
        report: &mut LifecycleReport,
        expiring: &[String],
    ) -> BackupResult<()> {
        let now = Utc::now();

        let candidates: Vec<(String, String, StorageTier, StorageTier)> = {
            let index = self.index.read().await;
            index
                .all()
                // Snapshots expiring this sweep are deleted, not moved
                // to a colder tier first.
                .filter(|snapshot| !expiring.contains(&snapshot.snapshot_id))
                .filter_map(|snapshot| {
                    let age = now - snapshot.created_at;
                    self.rules
                        .iter()
                        .find(|rule| {
                            rule.enabled
                                && rule.from == snapshot.tier
                                && age > Duration::days(rule.after_days)
                        })
                        .map(|rule| {
                            (
                                snapshot.snapshot_id.clone(),
                                snapshot.object_key.clone(),
                                rule.from,
                                rule.to,
                            )
                        })
                })
                .collect()
        };

        for (snapshot_id, object_key, from, to) in candidates {
            match self.object_store.move_tier(&object_key, from, to).await {
                Ok(()) => {
                    if let Some(snapshot) = self.index.write().await.get_mut(&snapshot_id) {
                        snapshot.tier = to;
                    }
                    report.transitions += 1;
                    log::debug!("Snapshot {} moved {} -> {}", snapshot_id, from, to);
                }
                Err(e) => {
                    report
                        .errors
                        .push(format!("transition {}: {}", snapshot_id, e));
                }
            }
        }
        Ok(())
    }

    /// Snapshot ids whose retention policy expires them this sweep.
    async fn collect_expiring(&self) -> Vec<String> {
        let now = Utc::now();
        let policies = self.policies.read().await;

        let mut expired: Vec<String> = Vec::new();
        {
            let index = self.index.read().await;

            for snapshot in index.all() {
                if !snapshot.eligible_for_expiry() {
                    continue;
                }
                let Some(policy_name) = &snapshot.retention_policy else {
                    continue;
                };
                let Some(policy) = policies.get(policy_name) else {
                    continue;
                };
                // Version-based policies are evaluated per source below.
                if matches!(policy, RetentionPolicy::VersionBased { .. }) {
                    continue;
                }
                if policy.allows_expiry(snapshot.created_at, now) {
                    expired.push(snapshot.snapshot_id.clone());
                }
            }

            // Version-based: keep the last K per source.
            for source_id in index.source_ids() {
                let snapshots = index.by_source_newest_first(&source_id);
                for (position, snapshot) in snapshots.iter().enumerate() {
                    let Some(policy_name) = &snapshot.retention_policy else {
                        continue;
                    };
                    if let Some(RetentionPolicy::VersionBased { keep_last }) =
                        policies.get(policy_name)
                    {
                        if position >= *keep_last && snapshot.eligible_for_expiry() {
                            expired.push(snapshot.snapshot_id.clone());
                        }
                    }
                }
            }
        }
        drop(policies);

        expired.sort();
        expired.dedup();
        expired
    }

    async fn apply_deletions(
        &self,
        report: &mut LifecycleReport,
        expired: Vec<String>,
    ) -> BackupResult<()> {
        for snapshot_id in expired {
            match self.expire_snapshot(&snapshot_id, report).await {
                Ok(()) => report.deletions += 1,
                Err(e) => report.errors.push(format!("expire {}: {}", snapshot_id, e)),
            }
        }
        Ok(())
    }

    /// Decrement references on all of the snapshot's chunks, then delete
    /// the snapshot envelope and metadata. Chunks reaching zero
    /// references are physically erased by the chunk store.
    async fn expire_snapshot(
        &self,
        snapshot_id: &str,
        report: &mut LifecycleReport,
    ) -> BackupResult<()> {
        let snapshot = self
            .index
            .write()
            .await
            .remove(snapshot_id)
            .ok_or_else(|| BackupError::SnapshotNotFound(snapshot_id.to_string()))?;

        for chunk_id in &snapshot.chunks {
            if self.chunk_store.remove(chunk_id).await {
                report.chunks_erased += 1;
            }
        }

        self.object_store.delete(&snapshot.object_key).await?;
        log::info!("Snapshot expired: {}", snapshot_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::engine::{BackupConfig, BackupEngine};
    use crate::storage::MemoryObjectStore;
    use std::collections::HashMap;

    struct Fixture {
        engine: BackupEngine,
        manager: LifecycleManager,
        index: Arc<RwLock<SnapshotIndex>>,
        store: Arc<MemoryObjectStore>,
        chunks: Arc<ChunkStore>,
        policies: Arc<RwLock<RetentionRegistry>>,
    }

    fn fixture() -> Fixture {
        let index = Arc::new(RwLock::new(SnapshotIndex::new()));
        let chunks = Arc::new(ChunkStore::new());
        let store = Arc::new(MemoryObjectStore::new());
        let policies = Arc::new(RwLock::new(RetentionRegistry::new()));

        let engine = BackupEngine::new(
            BackupConfig::default(),
            Arc::clone(&chunks),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&index),
        );
        let manager = LifecycleManager::new(
            TransitionRule::defaults(),
            Arc::clone(&index),
            Arc::clone(&chunks),
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&policies),
        );

        Fixture {
            engine,
            manager,
            index,
            store,
            chunks,
            policies,
        }
    }

    async fn backdate(index: &Arc<RwLock<SnapshotIndex>>, snapshot_id: &str, days: i64, tier: StorageTier) {
        let mut index = index.write().await;
        let snapshot = index.get_mut(snapshot_id).unwrap();
        snapshot.created_at = Utc::now() - Duration::days(days);
        snapshot.tier = tier;
    }

    #[tokio::test]
    async fn test_age_ladder_transitions() {
        let fx = fixture();

        let ten = fx.engine.create(b"ten", "a", true, None, HashMap::new()).await.unwrap();
        let forty = fx.engine.create(b"forty", "b", true, None, HashMap::new()).await.unwrap();
        let hundred = fx.engine.create(b"hundred", "c", true, None, HashMap::new()).await.unwrap();

        backdate(&fx.index, &ten.snapshot_id, 10, StorageTier::Hot).await;
        backdate(&fx.index, &forty.snapshot_id, 40, StorageTier::Warm).await;
        backdate(&fx.index, &hundred.snapshot_id, 100, StorageTier::Cold).await;

        // The warm and cold seeds have to live in their tier buckets.
        fx.store.move_tier(&forty.object_key, StorageTier::Hot, StorageTier::Warm).await.unwrap();
        fx.store.move_tier(&hundred.object_key, StorageTier::Hot, StorageTier::Cold).await.unwrap();

        let report = fx.manager.apply().await.unwrap();
        assert_eq!(report.transitions, 3);
        assert_eq!(report.deletions, 0);

        let index = fx.index.read().await;
        assert_eq!(index.get(&ten.snapshot_id).unwrap().tier, StorageTier::Warm);
        assert_eq!(index.get(&forty.snapshot_id).unwrap().tier, StorageTier::Cold);
        assert_eq!(index.get(&hundred.snapshot_id).unwrap().tier, StorageTier::Glacier);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let fx = fixture();
        let snapshot = fx.engine.create(b"data", "a", true, None, HashMap::new()).await.unwrap();
        backdate(&fx.index, &snapshot.snapshot_id, 10, StorageTier::Hot).await;

        let first = fx.manager.apply().await.unwrap();
        assert_eq!(first.transitions, 1);

        // No interleaved mutations: the second sweep does nothing.
        let second = fx.manager.apply().await.unwrap();
        assert_eq!(second.transitions, 0);
        assert_eq!(second.deletions, 0);
    }

    #[tokio::test]
    async fn test_time_based_expiry_releases_chunks() {
        let fx = fixture();
        fx.policies
            .write()
            .await
            .register("d30", RetentionPolicy::TimeBased { days: 30 })
            .unwrap();

        let snapshot = fx
            .engine
            .create(b"old payload", "a", true, Some("d30".to_string()), HashMap::new())
            .await
            .unwrap();
        backdate(&fx.index, &snapshot.snapshot_id, 31, StorageTier::Hot).await;

        let report = fx.manager.apply().await.unwrap();
        assert_eq!(report.deletions, 1);
        assert!(report.chunks_erased >= 1);

        assert!(fx.index.read().await.get(&snapshot.snapshot_id).is_none());
        for chunk_id in &snapshot.chunks {
            assert!(!fx.chunks.contains(chunk_id).await);
        }
    }

    #[tokio::test]
    async fn test_shared_chunks_survive_one_expiry() {
        let fx = fixture();
        fx.policies
            .write()
            .await
            .register("d30", RetentionPolicy::TimeBased { days: 30 })
            .unwrap();

        let payload = vec![5u8; 100_000];
        let expired = fx
            .engine
            .create(&payload, "a", true, Some("d30".to_string()), HashMap::new())
            .await
            .unwrap();
        let kept = fx
            .engine
            .create(&payload, "b", true, None, HashMap::new())
            .await
            .unwrap();
        backdate(&fx.index, &expired.snapshot_id, 31, StorageTier::Hot).await;

        fx.manager.apply().await.unwrap();

        // The shared chunks still resolve for the surviving snapshot.
        for chunk_id in &kept.chunks {
            assert!(fx.chunks.contains(chunk_id).await);
        }
        assert_eq!(fx.engine.restore(&kept.snapshot_id).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_version_based_keeps_last_k() {
        let fx = fixture();
        fx.policies
            .write()
            .await
            .register("keep2", RetentionPolicy::VersionBased { keep_last: 2 })
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..4u8 {
            let snapshot = fx
                .engine
                .create(&[i; 32], "doc", true, Some("keep2".to_string()), HashMap::new())
                .await
                .unwrap();
            // Distinct ages, oldest first.
            backdate(&fx.index, &snapshot.snapshot_id, 40 - i as i64, StorageTier::Hot).await;
            ids.push(snapshot.snapshot_id);
        }

        let report = fx.manager.apply().await.unwrap();
        assert_eq!(report.deletions, 2);

        let index = fx.index.read().await;
        assert!(index.get(&ids[0]).is_none());
        assert!(index.get(&ids[1]).is_none());
        assert!(index.get(&ids[2]).is_some());
        assert!(index.get(&ids[3]).is_some());
    }

    #[tokio::test]
    async fn test_legal_hold_blocks_deletion() {
        let fx = fixture();
        fx.policies
            .write()
            .await
            .register(
                "hold",
                RetentionPolicy::LegalHold {
                    until: Utc::now() + Duration::days(30),
                },
            )
            .unwrap();

        let snapshot = fx
            .engine
            .create(b"held", "a", true, Some("hold".to_string()), HashMap::new())
            .await
            .unwrap();
        backdate(&fx.index, &snapshot.snapshot_id, 500, StorageTier::Hot).await;

        let report = fx.manager.apply().await.unwrap();
        assert_eq!(report.deletions, 0);
        assert!(fx.index.read().await.get(&snapshot.snapshot_id).is_some());
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_never_expires() {
        let fx = fixture();
        fx.policies
            .write()
            .await
            .register("d1", RetentionPolicy::TimeBased { days: 1 })
            .unwrap();

        let snapshot = fx
            .engine
            .create(b"corrupt", "a", true, Some("d1".to_string()), HashMap::new())
            .await
            .unwrap();
        backdate(&fx.index, &snapshot.snapshot_id, 100, StorageTier::Hot).await;
        fx.index
            .write()
            .await
            .get_mut(&snapshot.snapshot_id)
            .unwrap()
            .integrity = crate::backup::SnapshotIntegrity::Corrupted;

        let report = fx.manager.apply().await.unwrap();
        assert_eq!(report.deletions, 0);
        assert!(fx.index.read().await.get(&snapshot.snapshot_id).is_some());
    }
}

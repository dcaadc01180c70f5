//! End-to-end tier lifecycle transitions

use std::collections::HashMap;
use std::sync::Arc;

use cadvault::backup::{
    BackupConfig, BackupEngine, LifecycleManager, RetentionPolicy, RetentionRegistry,
    SnapshotIndex, TransitionRule,
};
use cadvault::chunk::ChunkStore;
use cadvault::storage::{MemoryObjectStore, ObjectStore, StorageTier};
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

struct Fixture {
    engine: BackupEngine,
    manager: LifecycleManager,
    index: Arc<RwLock<SnapshotIndex>>,
    store: Arc<MemoryObjectStore>,
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
        chunks,
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        Arc::clone(&policies),
    );

    Fixture {
        engine,
        manager,
        index,
        store,
        policies,
    }
}

async fn seed(fx: &Fixture, source: &str, age_days: i64, tier: StorageTier) -> String {
    let snapshot = fx
        .engine
        .create(format!("{} payload", source).as_bytes(), source, true, None, HashMap::new())
        .await
        .unwrap();

    if tier != StorageTier::Hot {
        fx.store
            .move_tier(&snapshot.object_key, StorageTier::Hot, tier)
            .await
            .unwrap();
    }

    let mut index = fx.index.write().await;
    let stored = index.get_mut(&snapshot.snapshot_id).unwrap();
    stored.created_at = Utc::now() - Duration::days(age_days);
    stored.tier = tier;
    snapshot.snapshot_id
}

/// Snapshots aged 10, 40 and 100 days step one tier down the ladder on
/// one sweep, with no deletions.
#[tokio::test]
async fn test_default_ladder_moves_each_snapshot_one_tier() {
    let fx = fixture();

    let ten = seed(&fx, "ten-days", 10, StorageTier::Hot).await;
    let forty = seed(&fx, "forty-days", 40, StorageTier::Warm).await;
    let hundred = seed(&fx, "hundred-days", 100, StorageTier::Cold).await;

    let report = fx.manager.apply().await.unwrap();
    assert_eq!(report.transitions, 3);
    assert_eq!(report.deletions, 0);
    assert!(report.errors.is_empty());

    let index = fx.index.read().await;
    assert_eq!(index.get(&ten).unwrap().tier, StorageTier::Warm);
    assert_eq!(index.get(&forty).unwrap().tier, StorageTier::Cold);
    assert_eq!(index.get(&hundred).unwrap().tier, StorageTier::Glacier);

    // The envelopes physically moved buckets too.
    assert_eq!(
        fx.store.tier_of(&index.get(&ten).unwrap().object_key).await,
        Some(StorageTier::Warm)
    );
    assert_eq!(
        fx.store.tier_of(&index.get(&hundred).unwrap().object_key).await,
        Some(StorageTier::Glacier)
    );
}

/// Running the sweep again with no interleaved mutations is a no-op.
#[tokio::test]
async fn test_sweep_idempotence() {
    let fx = fixture();
    seed(&fx, "doc", 10, StorageTier::Hot).await;

    let first = fx.manager.apply().await.unwrap();
    assert_eq!(first.transitions, 1);

    let second = fx.manager.apply().await.unwrap();
    assert_eq!(second.transitions, 0);
    assert_eq!(second.deletions, 0);
}

/// Fresh snapshots stay hot; restores still work after tier moves.
#[tokio::test]
async fn test_restore_survives_tier_transition() {
    let fx = fixture();

    let payload = b"survives the cold".to_vec();
    let snapshot = fx
        .engine
        .create(&payload, "mobile-doc", true, None, HashMap::new())
        .await
        .unwrap();
    {
        let mut index = fx.index.write().await;
        index.get_mut(&snapshot.snapshot_id).unwrap().created_at =
            Utc::now() - Duration::days(8);
    }

    fx.manager.apply().await.unwrap();
    assert_eq!(
        fx.index.read().await.get(&snapshot.snapshot_id).unwrap().tier,
        StorageTier::Warm
    );
    assert_eq!(fx.engine.restore(&snapshot.snapshot_id).await.unwrap(), payload);
}

/// Transitions happen before deletions within one sweep: an expiring
/// snapshot is removed, not first moved colder.
#[tokio::test]
async fn test_expiry_wins_over_transition() {
    let fx = fixture();
    fx.policies
        .write()
        .await
        .register("d30", RetentionPolicy::TimeBased { days: 30 })
        .unwrap();

    let snapshot = fx
        .engine
        .create(b"expiring", "old-doc", true, Some("d30".to_string()), HashMap::new())
        .await
        .unwrap();
    {
        let mut index = fx.index.write().await;
        let stored = index.get_mut(&snapshot.snapshot_id).unwrap();
        stored.created_at = Utc::now() - Duration::days(40);
        stored.tier = StorageTier::Warm;
    }
    fx.store
        .move_tier(&snapshot.object_key, StorageTier::Hot, StorageTier::Warm)
        .await
        .unwrap();

    let report = fx.manager.apply().await.unwrap();
    assert_eq!(report.deletions, 1);
    assert!(fx.index.read().await.get(&snapshot.snapshot_id).is_none());
    assert_eq!(fx.store.tier_of(&snapshot.object_key).await, None);
}

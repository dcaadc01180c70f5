//! Checkpoint manager: serialized full-state snapshots usable as replay
//! origins

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{WalError, WalResult};

/// Checkpoint configuration
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub checkpoint_dir: PathBuf,
    /// Oldest checkpoints are pruned past this count
    pub max_checkpoints: usize,
    /// Automatic checkpoint interval
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("/tmp/cadvault/checkpoints"),
            max_checkpoints: 48,
            interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub object_count: u64,
    /// SHA-256 over the sorted-key canonical serialized state
    pub checksum: String,
}

/// Supplies the current logical state to the automatic checkpoint loop.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn current_state(&self) -> HashMap<String, serde_json::Value>;
}

/// Checkpoint manager writing `ckpt_{uuid-hex}.json` files.
pub struct CheckpointManager {
    config: CheckpointConfig,
    checkpoints: RwLock<HashMap<String, CheckpointInfo>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointManager {
    pub async fn new(config: CheckpointConfig) -> WalResult<Self> {
        tokio::fs::create_dir_all(&config.checkpoint_dir).await?;
        Ok(Self {
            config,
            checkpoints: RwLock::new(HashMap::new()),
            loop_task: Mutex::new(None),
        })
    }

    /// Serialize the full state to one record and persist it. Prunes the
    /// oldest checkpoints past the configured maximum.
    pub async fn create(
        &self,
        state: &HashMap<String, serde_json::Value>,
    ) -> WalResult<CheckpointInfo> {
        let checkpoint_id = format!("ckpt_{}", uuid::Uuid::new_v4().simple());

        // Sorted-key canonical form for a stable checksum.
        let ordered: BTreeMap<&String, &serde_json::Value> = state.iter().collect();
        let serialized = serde_json::to_string(&ordered)?;

        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        let checksum = hex::encode(hasher.finalize());

        let info = CheckpointInfo {
            checkpoint_id: checkpoint_id.clone(),
            timestamp: Utc::now(),
            size_bytes: serialized.len() as u64,
            object_count: state.len() as u64,
            checksum,
        };

        let path = self.path_for(&checkpoint_id);
        tokio::fs::write(&path, serialized.as_bytes()).await?;

        self.checkpoints
            .write()
            .await
            .insert(checkpoint_id.clone(), info.clone());
        self.prune().await?;

        log::info!(
            "Checkpoint created: {} ({} objects, {} bytes)",
            checkpoint_id,
            info.object_count,
            info.size_bytes
        );
        Ok(info)
    }

    /// Load checkpoint state, validating the recorded checksum.
    pub async fn load(
        &self,
        checkpoint_id: &str,
    ) -> WalResult<Option<HashMap<String, serde_json::Value>>> {
        let info = match self.checkpoints.read().await.get(checkpoint_id) {
            Some(info) => info.clone(),
            None => return Ok(None),
        };

        let path = self.path_for(checkpoint_id);
        let serialized = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        if hex::encode(hasher.finalize()) != info.checksum {
            return Err(WalError::ChecksumMismatch(checkpoint_id.to_string()));
        }

        Ok(Some(serde_json::from_slice(&serialized)?))
    }

    /// Checkpoint metadata by id.
    pub async fn info(&self, checkpoint_id: &str) -> Option<CheckpointInfo> {
        self.checkpoints.read().await.get(checkpoint_id).cloned()
    }

    /// All checkpoints, newest first.
    pub async fn list(&self) -> Vec<CheckpointInfo> {
        let mut checkpoints: Vec<CheckpointInfo> =
            self.checkpoints.read().await.values().cloned().collect();
        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        checkpoints
    }

    /// Most recent checkpoint at or before `at`, if any.
    pub async fn latest_before(&self, at: DateTime<Utc>) -> Option<CheckpointInfo> {
        self.checkpoints
            .read()
            .await
            .values()
            .filter(|info| info.timestamp <= at)
            .max_by_key(|info| info.timestamp)
            .cloned()
    }

    /// Most recent checkpoint overall, if any.
    pub async fn latest(&self) -> Option<CheckpointInfo> {
        self.checkpoints
            .read()
            .await
            .values()
            .max_by_key(|info| info.timestamp)
            .cloned()
    }

    async fn prune(&self) -> WalResult<()> {
        let to_remove: Vec<String> = {
            let checkpoints = self.checkpoints.read().await;
            if checkpoints.len() <= self.config.max_checkpoints {
                return Ok(());
            }

            let mut ordered: Vec<&CheckpointInfo> = checkpoints.values().collect();
            ordered.sort_by_key(|info| info.timestamp);
            let excess = checkpoints.len() - self.config.max_checkpoints;
            ordered
                .iter()
                .take(excess)
                .map(|info| info.checkpoint_id.clone())
                .collect()
        };

        for checkpoint_id in to_remove {
            let path = self.path_for(&checkpoint_id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!("Failed to delete checkpoint {}: {}", checkpoint_id, e);
            }
            self.checkpoints.write().await.remove(&checkpoint_id);
            log::debug!("Pruned checkpoint {}", checkpoint_id);
        }
        Ok(())
    }

    fn path_for(&self, checkpoint_id: &str) -> PathBuf {
        self.config
            .checkpoint_dir
            .join(format!("{}.json", checkpoint_id))
    }

    /// Start the automatic checkpoint loop. Idempotent: a second start
    /// while running is a no-op.
    pub async fn start_automatic(self: &Arc<Self>, provider: Arc<dyn StateProvider>) {
        let mut task = self.loop_task.lock().await;
        if task.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let state = provider.current_state().await;
                if let Err(e) = manager.create(&state).await {
                    log::error!("Automatic checkpoint failed: {}", e);
                }
            }
        }));
        log::info!("Automatic checkpoints started");
    }

    /// Stop the automatic checkpoint loop. Idempotent.
    pub async fn stop_automatic(&self) {
        if let Some(task) = self.loop_task.lock().await.take() {
            task.abort();
            log::info!("Automatic checkpoints stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_config(dir: &std::path::Path, max: usize) -> CheckpointConfig {
        CheckpointConfig {
            checkpoint_dir: dir.to_path_buf(),
            max_checkpoints: max,
            interval: Duration::from_millis(50),
        }
    }

    fn state_of(pairs: &[(&str, i64)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), serde_json::json!({ "value": value })))
            .collect()
    }

    #[tokio::test]
    async fn test_create_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(manager_config(dir.path(), 48)).await.unwrap();

        let state = state_of(&[("objA", 1), ("objB", 2)]);
        let info = manager.create(&state).await.unwrap();
        assert_eq!(info.object_count, 2);
        assert!(info.checkpoint_id.starts_with("ckpt_"));

        let loaded = manager.load(&info.checkpoint_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_checksum_is_key_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(manager_config(dir.path(), 48)).await.unwrap();

        let a = manager.create(&state_of(&[("x", 1), ("y", 2)])).await.unwrap();
        let b = manager.create(&state_of(&[("y", 2), ("x", 1)])).await.unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(manager_config(dir.path(), 3)).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let info = manager.create(&state_of(&[("obj", i)])).await.unwrap();
            ids.push(info.checkpoint_id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let remaining = manager.list().await;
        assert_eq!(remaining.len(), 3);
        assert!(manager.load(&ids[0]).await.unwrap().is_none());
        assert!(manager.load(&ids[4]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tampered_checkpoint_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(manager_config(dir.path(), 48)).await.unwrap();

        let info = manager.create(&state_of(&[("obj", 1)])).await.unwrap();
        let path = dir.path().join(format!("{}.json", info.checkpoint_id));
        std::fs::write(&path, b"{\"obj\":{\"value\":999}}").unwrap();

        assert!(matches!(
            manager.load(&info.checkpoint_id).await,
            Err(WalError::ChecksumMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_before_selection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(manager_config(dir.path(), 48)).await.unwrap();

        let first = manager.create(&state_of(&[("a", 1)])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let midpoint = Utc::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager.create(&state_of(&[("a", 2)])).await.unwrap();

        let selected = manager.latest_before(midpoint).await.unwrap();
        assert_eq!(selected.checkpoint_id, first.checkpoint_id);
        assert_eq!(manager.latest().await.unwrap().checkpoint_id, second.checkpoint_id);
    }

    struct FixedProvider(HashMap<String, serde_json::Value>);

    #[async_trait]
    impl StateProvider for FixedProvider {
        async fn current_state(&self) -> HashMap<String, serde_json::Value> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_automatic_loop_idempotent_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            Arc::new(CheckpointManager::new(manager_config(dir.path(), 48)).await.unwrap());
        let provider = Arc::new(FixedProvider(state_of(&[("auto", 7)])));

        manager.start_automatic(provider.clone() as Arc<dyn StateProvider>).await;
        manager.start_automatic(provider as Arc<dyn StateProvider>).await;

        tokio::time::sleep(Duration::from_millis(130)).await;
        manager.stop_automatic().await;
        manager.stop_automatic().await;

        let count = manager.list().await.len();
        assert!(count >= 1, "expected at least one automatic checkpoint");
    }
}

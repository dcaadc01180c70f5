//! Fleet state coordinator
//!
//! Cross-worker shared state with explicit TTLs, namespaced by a
//! `{scope}:{kind}:{id?}` key layout. Provides:
//! - Scalar put/get/delete with TTL
//! - Hash operations for per-entry collections
//! - Bounded list push (oldest entries evicted)
//! - Sorted-set adds with score for time-ranged reads
//! - Distributed locks with timeout
//! - Publish/subscribe with local fan-out
//!
//! Two implementations: Redis for production fleets, in-memory for
//! tests and single-worker deployments.

pub mod redis_state;

pub use redis_state::{RedisFleetConfig, RedisFleetState};

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

/// Fleet state errors
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for fleet-state operations
pub type FleetResult<T> = Result<T, FleetError>;

/// Channel carrying fleet-wide performance samples
pub const CHANNEL_METRICS: &str = "performance:metrics";

/// Channel carrying fleet-wide alerts
pub const CHANNEL_ALERTS: &str = "performance:alerts";

/// Compose a `{scope}:{kind}:{id?}` key.
pub fn state_key(scope: &str, kind: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("{}:{}:{}", scope, kind, id),
        None => format!("{}:{}", scope, kind),
    }
}

/// A held distributed lock. Release it explicitly with
/// [`FleetState::release_lock`]; the TTL bounds how long a crashed
/// holder can block others.
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub resource: String,
    pub token: String,
}

/// Shared coordination surface used by every subsystem.
#[async_trait]
pub trait FleetState: Send + Sync {
    /// Store a scalar with a TTL.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()>;

    /// Read a scalar; expired entries read as absent.
    async fn get(&self, key: &str) -> FleetResult<Option<String>>;

    async fn delete(&self, key: &str) -> FleetResult<()>;

    async fn hash_set(&self, key: &str, field: &str, value: &str, ttl: Duration)
        -> FleetResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> FleetResult<Option<String>>;

    async fn hash_delete(&self, key: &str, field: &str) -> FleetResult<()>;

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>>;

    /// Push to the head of a list, trimming to `max_len` (oldest evicted).
    async fn list_push(&self, key: &str, value: &str, max_len: usize, ttl: Duration)
        -> FleetResult<()>;

    /// Newest-first entries, bounded by `limit`.
    async fn list_range(&self, key: &str, limit: usize) -> FleetResult<Vec<String>>;

    /// Add a scored member (scores are typically epoch seconds).
    async fn sorted_add(&self, key: &str, score: f64, value: &str, ttl: Duration)
        -> FleetResult<()>;

    /// Members with score in [min, max], ascending.
    async fn sorted_range(&self, key: &str, min: f64, max: f64) -> FleetResult<Vec<String>>;

    /// Try to acquire a distributed lock; `None` when already held.
    async fn acquire_lock(&self, resource: &str, ttl: Duration) -> FleetResult<Option<LockGuard>>;

    /// Release a lock. Returns false when the token no longer matches
    /// (the lock expired and was re-acquired elsewhere).
    async fn release_lock(&self, guard: &LockGuard) -> FleetResult<bool>;

    /// Publish a message to a channel.
    async fn publish(&self, channel: &str, payload: &str) -> FleetResult<()>;

    /// Subscribe to a channel. Messages fan out through a local
    /// broadcast; ordering is best-effort per publisher.
    async fn subscribe(&self, channel: &str) -> FleetResult<broadcast::Receiver<String>>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
struct MemoryTables {
    scalars: HashMap<String, Expiring<String>>,
    hashes: HashMap<String, Expiring<HashMap<String, String>>>,
    lists: HashMap<String, Expiring<Vec<String>>>,
    sorted: HashMap<String, Expiring<BTreeMap<ordered::OrderedScore, String>>>,
    locks: HashMap<String, Expiring<String>>,
}

mod ordered {
    /// f64 score usable as a BTreeMap key (scores are finite timestamps).
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct OrderedScore(pub f64, pub u64);

    impl Eq for OrderedScore {}

    impl PartialOrd for OrderedScore {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for OrderedScore {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(self.1.cmp(&other.1))
        }
    }
}

/// In-memory fleet state for tests and single-worker deployments.
pub struct MemoryFleetState {
    tables: RwLock<MemoryTables>,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    sequence: RwLock<u64>,
}

impl MemoryFleetState {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(MemoryTables::default()),
            channels: RwLock::new(HashMap::new()),
            sequence: RwLock::new(0),
        }
    }

    /// Drop every expired entry. The Redis implementation gets this for
    /// free from server-side TTLs.
    pub async fn gc(&self) {
        let mut tables = self.tables.write().await;
        tables.scalars.retain(|_, entry| entry.live());
        tables.hashes.retain(|_, entry| entry.live());
        tables.lists.retain(|_, entry| entry.live());
        tables.sorted.retain(|_, entry| entry.live());
        tables.locks.retain(|_, entry| entry.live());
    }

    async fn next_sequence(&self) -> u64 {
        let mut sequence = self.sequence.write().await;
        *sequence += 1;
        *sequence
    }
}

impl Default for MemoryFleetState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetState for MemoryFleetState {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()> {
        self.tables
            .write()
            .await
            .scalars
            .insert(key.to_string(), Expiring::new(value.to_string(), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .scalars
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> FleetResult<()> {
        self.tables.write().await.scalars.remove(key);
        Ok(())
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> FleetResult<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(HashMap::new(), ttl));
        entry.expires_at = Instant::now() + ttl;
        entry.value.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> FleetResult<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .hashes
            .get(key)
            .filter(|entry| entry.live())
            .and_then(|entry| entry.value.get(field).cloned()))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> FleetResult<()> {
        if let Some(entry) = self.tables.write().await.hashes.get_mut(key) {
            entry.value.remove(field);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>> {
        Ok(self
            .tables
            .read()
            .await
            .hashes
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.clone())
            .unwrap_or_default())
    }

    async fn list_push(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> FleetResult<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(Vec::new(), ttl));
        entry.expires_at = Instant::now() + ttl;
        entry.value.insert(0, value.to_string());
        entry.value.truncate(max_len);
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> FleetResult<Vec<String>> {
        Ok(self
            .tables
            .read()
            .await
            .lists
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_add(
        &self,
        key: &str,
        score: f64,
        value: &str,
        ttl: Duration,
    ) -> FleetResult<()> {
        let sequence = self.next_sequence().await;
        let mut tables = self.tables.write().await;
        let entry = tables
            .sorted
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(BTreeMap::new(), ttl));
        entry.expires_at = Instant::now() + ttl;
        entry
            .value
            .insert(ordered::OrderedScore(score, sequence), value.to_string());
        Ok(())
    }

    async fn sorted_range(&self, key: &str, min: f64, max: f64) -> FleetResult<Vec<String>> {
        Ok(self
            .tables
            .read()
            .await
            .sorted
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| {
                entry
                    .value
                    .iter()
                    .filter(|(score, _)| score.0 >= min && score.0 <= max)
                    .map(|(_, value)| value.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn acquire_lock(&self, resource: &str, ttl: Duration) -> FleetResult<Option<LockGuard>> {
        let key = format!("lock:{}", resource);
        let token = uuid::Uuid::new_v4().to_string();

        let mut tables = self.tables.write().await;
        if tables.locks.get(&key).map_or(false, |entry| entry.live()) {
            return Ok(None);
        }
        tables.locks.insert(key, Expiring::new(token.clone(), ttl));
        Ok(Some(LockGuard {
            resource: resource.to_string(),
            token,
        }))
    }

    async fn release_lock(&self, guard: &LockGuard) -> FleetResult<bool> {
        let key = format!("lock:{}", guard.resource);
        let mut tables = self.tables.write().await;
        match tables.locks.get(&key) {
            Some(entry) if entry.live() && entry.value == guard.token => {
                tables.locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> FleetResult<()> {
        if let Some(sender) = self.channels.read().await.get(channel) {
            // Zero receivers is fine; the message is simply dropped.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> FleetResult<broadcast::Receiver<String>> {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0);
        Ok(sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(state_key("jobs", "active", Some("j1")), "jobs:active:j1");
        assert_eq!(state_key("performance", "metrics", None), "performance:metrics");
    }

    #[tokio::test]
    async fn test_scalar_ttl_expiry() {
        let state = MemoryFleetState::new();
        state.put("k", "v", Duration::from_millis(30)).await.unwrap();
        assert_eq!(state.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.get("k").await.unwrap().is_none());

        state.gc().await;
        assert!(state.tables.read().await.scalars.is_empty());
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let state = MemoryFleetState::new();
        let ttl = Duration::from_secs(60);

        state.hash_set("connections", "c1", "worker-1", ttl).await.unwrap();
        state.hash_set("connections", "c2", "worker-2", ttl).await.unwrap();

        assert_eq!(
            state.hash_get("connections", "c1").await.unwrap().as_deref(),
            Some("worker-1")
        );
        assert_eq!(state.hash_get_all("connections").await.unwrap().len(), 2);

        state.hash_delete("connections", "c1").await.unwrap();
        assert!(state.hash_get("connections", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bounded_list_evicts_oldest() {
        let state = MemoryFleetState::new();
        let ttl = Duration::from_secs(60);

        for i in 0..5 {
            state
                .list_push("snapshots", &format!("s{}", i), 3, ttl)
                .await
                .unwrap();
        }

        let entries = state.list_range("snapshots", 10).await.unwrap();
        assert_eq!(entries, vec!["s4", "s3", "s2"]);
    }

    #[tokio::test]
    async fn test_sorted_range_by_score() {
        let state = MemoryFleetState::new();
        let ttl = Duration::from_secs(60);

        state.sorted_add("ops", 100.0, "op-a", ttl).await.unwrap();
        state.sorted_add("ops", 200.0, "op-b", ttl).await.unwrap();
        state.sorted_add("ops", 300.0, "op-c", ttl).await.unwrap();

        assert_eq!(
            state.sorted_range("ops", 150.0, 250.0).await.unwrap(),
            vec!["op-b"]
        );
        assert_eq!(state.sorted_range("ops", 0.0, 1000.0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lock_exclusivity_and_expiry() {
        let state = MemoryFleetState::new();

        let guard = state
            .acquire_lock("doc-1", Duration::from_millis(40))
            .await
            .unwrap()
            .unwrap();
        assert!(state
            .acquire_lock("doc-1", Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());

        // The TTL frees a crashed holder's lock.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = state
            .acquire_lock("doc-1", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        // The stale guard can no longer release the new holder's lock.
        assert!(!state.release_lock(&guard).await.unwrap());
        assert!(state.release_lock(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_pubsub_fanout() {
        let state = MemoryFleetState::new();

        let mut first = state.subscribe(CHANNEL_METRICS).await.unwrap();
        let mut second = state.subscribe(CHANNEL_METRICS).await.unwrap();

        state
            .publish(CHANNEL_METRICS, "{\"cpu\": 0.4}")
            .await
            .unwrap();

        assert_eq!(first.recv().await.unwrap(), "{\"cpu\": 0.4}");
        assert_eq!(second.recv().await.unwrap(), "{\"cpu\": 0.4}");
    }
}

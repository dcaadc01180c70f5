//! Redis-backed fleet state
//!
//! Production implementation over a shared Redis. All operations retry
//! transient connection errors with linear backoff. Pub/sub runs as one
//! dedicated subscriber task per channel per worker, fanning messages
//! into a local broadcast channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, RwLock};

use super::{FleetError, FleetResult, FleetState, LockGuard};

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisFleetConfig {
    pub url: String,
    /// Retries for transient connection errors
    pub max_retries: u32,
    /// Linear backoff unit between retries
    pub retry_delay: Duration,
}

impl Default for RedisFleetConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Redis-backed fleet state.
pub struct RedisFleetState {
    config: RedisFleetConfig,
    client: redis::Client,
    connection: ConnectionManager,
    /// channel -> local fan-out sender fed by the subscriber task
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl RedisFleetState {
    pub async fn connect(config: RedisFleetConfig) -> FleetResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| FleetError::Connection(e.to_string()))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| FleetError::Connection(e.to_string()))?;

        Ok(Self {
            config,
            client,
            connection,
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Run a command, retrying transient connection errors with linear
    /// backoff.
    async fn execute<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> FleetResult<T> {
        let mut attempt = 0u32;
        loop {
            let mut connection = self.connection.clone();
            match cmd.query_async::<_, T>(&mut connection).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped() => {
                    if attempt >= self.config.max_retries {
                        return Err(FleetError::Connection(e.to_string()));
                    }
                    attempt += 1;
                    log::warn!("Redis retry {} after transient error: {}", attempt, e);
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                Err(e) => return Err(FleetError::Connection(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl FleetState for RedisFleetState {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl.as_millis() as u64);
        self.execute::<()>(&cmd).await
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.execute(&cmd).await
    }

    async fn delete(&self, key: &str) -> FleetResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.execute::<()>(&cmd).await
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> FleetResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        self.execute::<()>(&cmd).await?;

        let mut expire = redis::cmd("PEXPIRE");
        expire.arg(key).arg(ttl.as_millis() as u64);
        self.execute::<()>(&expire).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> FleetResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.execute(&cmd).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> FleetResult<()> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(field);
        self.execute::<()>(&cmd).await
    }

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.execute(&cmd).await
    }

    async fn list_push(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> FleetResult<()> {
        let mut push = redis::cmd("LPUSH");
        push.arg(key).arg(value);
        self.execute::<()>(&push).await?;

        let mut trim = redis::cmd("LTRIM");
        trim.arg(key).arg(0).arg(max_len as isize - 1);
        self.execute::<()>(&trim).await?;

        let mut expire = redis::cmd("PEXPIRE");
        expire.arg(key).arg(ttl.as_millis() as u64);
        self.execute::<()>(&expire).await
    }

    async fn list_range(&self, key: &str, limit: usize) -> FleetResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(0).arg(limit as isize - 1);
        self.execute(&cmd).await
    }

    async fn sorted_add(
        &self,
        key: &str,
        score: f64,
        value: &str,
        ttl: Duration,
    ) -> FleetResult<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(value);
        self.execute::<()>(&cmd).await?;

        let mut expire = redis::cmd("PEXPIRE");
        expire.arg(key).arg(ttl.as_millis() as u64);
        self.execute::<()>(&expire).await
    }

    async fn sorted_range(&self, key: &str, min: f64, max: f64) -> FleetResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        self.execute(&cmd).await
    }

    async fn acquire_lock(&self, resource: &str, ttl: Duration) -> FleetResult<Option<LockGuard>> {
        let key = format!("lock:{}", resource);
        let token = uuid::Uuid::new_v4().to_string();

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);

        let acquired: Option<String> = self.execute(&cmd).await?;
        Ok(acquired.map(|_| LockGuard {
            resource: resource.to_string(),
            token,
        }))
    }

    async fn release_lock(&self, guard: &LockGuard) -> FleetResult<bool> {
        let key = format!("lock:{}", guard.resource);
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(RELEASE_LOCK_SCRIPT).arg(1).arg(&key).arg(&guard.token);

        let released: i32 = self.execute(&cmd).await?;
        Ok(released == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> FleetResult<()> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        self.execute::<()>(&cmd).await
    }

    async fn subscribe(&self, channel: &str) -> FleetResult<broadcast::Receiver<String>> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return Ok(sender.subscribe());
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(channel) {
            return Ok(sender.subscribe());
        }

        // First subscriber on this worker: spawn the dedicated
        // subscriber task that feeds the local fan-out.
        let (sender, receiver) = broadcast::channel(1024);
        channels.insert(channel.to_string(), sender.clone());

        let connection = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| FleetError::Connection(e.to_string()))?;
        let mut pubsub = connection.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| FleetError::Connection(e.to_string()))?;

        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if sender.send(payload).is_err() {
                            // No local listeners remain.
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping undecodable message on {}: {}", channel_name, e);
                    }
                }
            }
            log::info!("Subscriber task for {} exited", channel_name);
        });

        Ok(receiver)
    }
}

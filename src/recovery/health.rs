//! Health monitoring for the disaster-recovery orchestrator
//!
//! Periodic HTTP/TCP/custom probes with consecutive-failure and
//! consecutive-success thresholds, per-check status tracking, and an
//! aggregated overall health verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Health check kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    Http,
    Tcp,
    Custom,
}

/// Health status of a check or of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// A named probe definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub check_id: String,
    /// Component this check observes
    pub component: String,
    pub kind: HealthCheckKind,
    /// URL for http checks, `host:port` for tcp checks
    pub endpoint: Option<String>,
    /// Exact HTTP status required for http checks
    pub expected_status: u16,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Critical checks drive the overall verdict to unhealthy
    pub critical: bool,
}

impl HealthCheck {
    pub fn http(check_id: &str, component: &str, endpoint: &str) -> Self {
        Self {
            check_id: check_id.to_string(),
            component: component.to_string(),
            kind: HealthCheckKind::Http,
            endpoint: Some(endpoint.to_string()),
            expected_status: 200,
            interval_secs: 30,
            timeout_secs: 10,
            critical: false,
        }
    }

    pub fn tcp(check_id: &str, component: &str, endpoint: &str) -> Self {
        Self {
            check_id: check_id.to_string(),
            component: component.to_string(),
            kind: HealthCheckKind::Tcp,
            endpoint: Some(endpoint.to_string()),
            expected_status: 0,
            interval_secs: 30,
            timeout_secs: 10,
            critical: false,
        }
    }

    pub fn custom(check_id: &str, component: &str) -> Self {
        Self {
            check_id: check_id.to_string(),
            component: component.to_string(),
            kind: HealthCheckKind::Custom,
            endpoint: None,
            expected_status: 0,
            interval_secs: 30,
            timeout_secs: 10,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Runtime state of one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for HealthCheckState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: None,
        }
    }
}

/// Custom probe callback
#[async_trait]
pub trait CustomProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    /// Failures before a check becomes unhealthy
    pub unhealthy_threshold: u32,
    /// Successes before a check becomes healthy
    pub healthy_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Health monitor owning a set of checks and their runtime state.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    checks: RwLock<HashMap<String, HealthCheck>>,
    states: RwLock<HashMap<String, HealthCheckState>>,
    custom_probes: RwLock<HashMap<String, Arc<dyn CustomProbe>>>,
    client: reqwest::Client,
    /// The monitor lock: start/stop are serialized through it so no
    /// duplicate loops can run.
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            checks: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            custom_probes: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
            monitor_task: Mutex::new(None),
        }
    }

    pub async fn add_check(&self, check: HealthCheck) {
        self.states
            .write()
            .await
            .insert(check.check_id.clone(), HealthCheckState::default());
        self.checks.write().await.insert(check.check_id.clone(), check);
    }

    pub async fn register_custom_probe(&self, check_id: &str, probe: Arc<dyn CustomProbe>) {
        self.custom_probes
            .write()
            .await
            .insert(check_id.to_string(), probe);
    }

    /// Issue one probe and fold the outcome into the check's state.
    pub async fn run_check(&self, check_id: &str) -> HealthStatus {
        let check = match self.checks.read().await.get(check_id) {
            Some(check) => check.clone(),
            None => return HealthStatus::Unknown,
        };

        let timeout = Duration::from_secs(check.timeout_secs);
        let passed = match check.kind {
            HealthCheckKind::Http => self.http_probe(&check, timeout).await,
            HealthCheckKind::Tcp => self.tcp_probe(&check, timeout).await,
            HealthCheckKind::Custom => {
                let probe = self.custom_probes.read().await.get(check_id).cloned();
                match probe {
                    Some(probe) => {
                        tokio::time::timeout(timeout, probe.probe()).await.unwrap_or(false)
                    }
                    None => false,
                }
            }
        };

        self.record_outcome(check_id, passed).await
    }

    async fn record_outcome(&self, check_id: &str, passed: bool) -> HealthStatus {
        let mut states = self.states.write().await;
        let state = states.entry(check_id.to_string()).or_default();
        state.last_check = Some(Utc::now());

        if passed {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if state.consecutive_successes >= self.config.healthy_threshold {
                state.status = HealthStatus::Healthy;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            state.status = if state.consecutive_failures >= self.config.unhealthy_threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
        }

        state.status
    }

    async fn http_probe(&self, check: &HealthCheck, timeout: Duration) -> bool {
        let Some(endpoint) = &check.endpoint else {
            return false;
        };

        match tokio::time::timeout(timeout, self.client.get(endpoint).send()).await {
            Ok(Ok(response)) => response.status().as_u16() == check.expected_status,
            _ => false,
        }
    }

    async fn tcp_probe(&self, check: &HealthCheck, timeout: Duration) -> bool {
        let Some(endpoint) = &check.endpoint else {
            return false;
        };
        let Some((host, port)) = parse_host_port(endpoint) else {
            return false;
        };

        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port)))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Current status of one check.
    pub async fn status_of(&self, check_id: &str) -> HealthStatus {
        self.states
            .read()
            .await
            .get(check_id)
            .map(|state| state.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Runtime state of one check.
    pub async fn state_of(&self, check_id: &str) -> Option<HealthCheckState> {
        self.states.read().await.get(check_id).cloned()
    }

    /// Components whose checks are currently failing.
    pub async fn failing_components(&self) -> Vec<(String, bool)> {
        let checks = self.checks.read().await;
        let states = self.states.read().await;

        checks
            .values()
            .filter(|check| {
                matches!(
                    states.get(&check.check_id).map(|state| state.status),
                    Some(HealthStatus::Unhealthy) | Some(HealthStatus::Degraded)
                )
            })
            .map(|check| (check.component.clone(), check.critical))
            .collect()
    }

    /// Overall verdict: unhealthy if any critical check is unhealthy,
    /// degraded if any check is not healthy, healthy only when every
    /// check is healthy.
    pub async fn overall_health(&self) -> HealthStatus {
        let checks = self.checks.read().await;
        let states = self.states.read().await;

        if checks.is_empty() {
            return HealthStatus::Unknown;
        }

        let mut all_healthy = true;
        for check in checks.values() {
            let status = states
                .get(&check.check_id)
                .map(|state| state.status)
                .unwrap_or(HealthStatus::Unknown);

            if check.critical && status == HealthStatus::Unhealthy {
                return HealthStatus::Unhealthy;
            }
            if status != HealthStatus::Healthy {
                all_healthy = false;
            }
        }

        if all_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// Start the monitoring loop. Idempotent under the monitor lock.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.monitor_task.lock().await;
        if task.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            loop {
                ticker.tick().await;
                let check_ids: Vec<String> =
                    monitor.checks.read().await.keys().cloned().collect();
                for check_id in check_ids {
                    monitor.run_check(&check_id).await;
                }
            }
        }));
        log::info!("Health monitoring started");
    }

    /// Stop the monitoring loop. Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.monitor_task.lock().await.take() {
            task.abort();
            log::info!("Health monitoring stopped");
        }
    }
}

/// Parse `host:port` with a default port of 80. IPv6 literals are
/// accepted in brackets: `[::1]:6379`.
fn parse_host_port(endpoint: &str) -> Option<(String, u16)> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return None;
    }

    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => 80,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Some((host.to_string(), port.parse().ok()?))
        }
        // Bare IPv6 without brackets or a plain hostname.
        Some(_) => Some((endpoint.to_string(), 80)),
        None => Some((endpoint.to_string(), 80)),
    }
}

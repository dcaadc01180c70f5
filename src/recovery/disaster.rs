//! Disaster-recovery orchestrator
//!
//! Detects incidents from health signals, selects and executes recovery
//! plans with per-step timeouts, retries and rollback, and keeps rolling
//! RTO/RPO accounting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::health::{HealthMonitor, HealthStatus};
use super::notifications::{NotificationManager, NotificationRecord};

/// Disaster-recovery errors
#[derive(Debug, thiserror::Error)]
pub enum DrError {
    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("No recovery plan for {0:?}/{1:?}")]
    NoPlanFound(DisasterKind, Severity),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Recovery already running for event {0}")]
    RecoveryInProgress(String),
}

/// Result type for disaster-recovery operations
pub type DrResult<T> = Result<T, DrError>;

/// Disaster kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisasterKind {
    HardwareFailure,
    NetworkOutage,
    DataCorruption,
    CyberAttack,
    NaturalDisaster,
    HumanError,
    SoftwareBug,
}

/// Incident severity; drives RTO/RPO targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// RTO target in minutes
    pub fn rto_minutes(&self) -> i64 {
        match self {
            Severity::Critical => 60,
            Severity::High => 240,
            Severity::Medium => 1440,
            Severity::Low => 4320,
        }
    }

    /// RPO target in minutes
    pub fn rpo_minutes(&self) -> i64 {
        match self {
            Severity::Critical => 15,
            Severity::High => 60,
            Severity::Medium => 240,
            Severity::Low => 1440,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Recovery lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Detecting,
    Assessing,
    Recovering,
    Completed,
    Failed,
    RolledBack,
}

/// Step actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Script,
    Manual,
    Wait,
    Check,
    Repair,
    Rebuild,
    Restore,
    Validate,
}

/// One recovery step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub step_id: String,
    pub name: String,
    pub action: StepAction,
    pub parameters: HashMap<String, serde_json::Value>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    /// The event survives this step failing
    pub can_fail: bool,
    pub order: u32,
}

impl RecoveryStep {
    pub fn new(step_id: &str, name: &str, action: StepAction, order: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            name: name.to_string(),
            action,
            parameters: HashMap::new(),
            timeout_secs: 300,
            retry_count: 3,
            can_fail: false,
            order,
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn can_fail(mut self) -> Self {
        self.can_fail = true;
        self
    }
}

/// A named recovery procedure for one (kind, severity) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub plan_id: String,
    pub name: String,
    pub disaster_kind: DisasterKind,
    /// When absent the plan matches the kind at any severity
    pub severity: Option<Severity>,
    pub steps: Vec<RecoveryStep>,
    pub rollback_steps: Vec<RecoveryStep>,
    /// Health check ids run before the steps (advisory)
    pub pre_checks: Vec<String>,
    /// Health check ids that must be healthy after the steps
    pub post_checks: Vec<String>,
    pub estimated_duration_minutes: u32,
    pub requires_approval: bool,
}

/// A detected incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterEvent {
    pub event_id: String,
    pub kind: DisasterKind,
    pub severity: Severity,
    pub description: String,
    pub impacted_components: Vec<String>,
    pub recovery_plan_id: Option<String>,
    pub state: RecoveryState,
    pub detected_at: DateTime<Utc>,
    pub recovery_started_at: Option<DateTime<Utc>>,
    pub recovery_completed_at: Option<DateTime<Utc>>,
    pub rto_target_minutes: i64,
    pub rpo_target_minutes: i64,
    pub actual_recovery_minutes: Option<i64>,
    pub data_loss_minutes: Option<i64>,
    pub notifications_sent: Vec<NotificationRecord>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Rolling recovery metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub total_events: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub average_recovery_minutes: f64,
    pub rto_compliance_rate: f64,
    /// Mean time to recovery over successful events, in minutes
    pub mttr: f64,
}

/// Handler for repair/rebuild/restore/validate steps, implemented by the
/// model-recovery service.
#[async_trait]
pub trait RecoveryActionHandler: Send + Sync {
    async fn execute(
        &self,
        action: StepAction,
        parameters: &HashMap<String, serde_json::Value>,
    ) -> Result<(), String>;
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct DrConfig {
    pub auto_failover_enabled: bool,
    pub failover_delay: Duration,
    pub require_manual_approval: bool,
    /// Poll interval while a manual step waits for approval
    pub approval_poll_interval: Duration,
    /// Backoff between step retry attempts
    pub step_retry_backoff: Duration,
}

impl Default for DrConfig {
    fn default() -> Self {
        Self {
            auto_failover_enabled: false,
            failover_delay: Duration::from_secs(300),
            require_manual_approval: true,
            approval_poll_interval: Duration::from_millis(200),
            step_retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Disaster-recovery orchestrator.
pub struct DisasterRecoveryOrchestrator {
    config: DrConfig,
    health: Arc<HealthMonitor>,
    notifications: Arc<NotificationManager>,
    plans: RwLock<HashMap<String, RecoveryPlan>>,
    events: RwLock<HashMap<String, DisasterEvent>>,
    history: RwLock<Vec<DisasterEvent>>,
    metrics: RwLock<RecoveryMetrics>,
    recovery_minutes: RwLock<Vec<(f64, bool)>>,
    action_handler: RwLock<Option<Arc<dyn RecoveryActionHandler>>>,
    approvals: RwLock<HashSet<(String, String)>>,
    running: RwLock<HashSet<String>>,
}

impl DisasterRecoveryOrchestrator {
    pub fn new(
        config: DrConfig,
        health: Arc<HealthMonitor>,
        notifications: Arc<NotificationManager>,
    ) -> Self {
        Self {
            config,
            health,
            notifications,
            plans: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            metrics: RwLock::new(RecoveryMetrics::default()),
            recovery_minutes: RwLock::new(Vec::new()),
            action_handler: RwLock::new(None),
            approvals: RwLock::new(HashSet::new()),
            running: RwLock::new(HashSet::new()),
        }
    }

    pub async fn set_action_handler(&self, handler: Arc<dyn RecoveryActionHandler>) {
        *self.action_handler.write().await = Some(handler);
    }

    pub async fn register_plan(&self, plan: RecoveryPlan) {
        self.plans.write().await.insert(plan.plan_id.clone(), plan);
    }

    /// Detect an incident: create the event, assess impact from failing
    /// health checks, notify, and optionally schedule auto-failover.
    pub async fn detect(
        self: &Arc<Self>,
        kind: DisasterKind,
        description: &str,
    ) -> DisasterEvent {
        let event_id = format!("evt_{}", uuid::Uuid::new_v4().simple());
        let mut severity = Severity::High;

        // Impact assessment: impacted components come from failing
        // checks; a failing critical component raises severity.
        let failing = self.health.failing_components().await;
        let impacted: Vec<String> = failing.iter().map(|(component, _)| component.clone()).collect();
        if failing.iter().any(|(_, critical)| *critical) {
            severity = Severity::Critical;
        }

        let mut event = DisasterEvent {
            event_id: event_id.clone(),
            kind,
            severity,
            description: description.to_string(),
            impacted_components: impacted,
            recovery_plan_id: None,
            state: RecoveryState::Detecting,
            detected_at: Utc::now(),
            recovery_started_at: None,
            recovery_completed_at: None,
            rto_target_minutes: severity.rto_minutes(),
            rpo_target_minutes: severity.rpo_minutes(),
            actual_recovery_minutes: None,
            data_loss_minutes: None,
            notifications_sent: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        let records = self
            .notifications
            .notify(
                &event_id,
                &format!("{:?}", kind),
                severity.as_str(),
                &format!("Disaster detected: {}", description),
            )
            .await;
        event.notifications_sent.extend(records);
        event.state = RecoveryState::Assessing;

        self.events.write().await.insert(event_id.clone(), event.clone());
        log::error!(
            "Disaster detected: {} ({:?}, {:?}): {}",
            event_id,
            kind,
            severity,
            description
        );

        if self.config.auto_failover_enabled && !self.config.require_manual_approval {
            let orchestrator = Arc::clone(self);
            let auto_event_id = event_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(orchestrator.config.failover_delay).await;
                if let Err(e) = orchestrator.initiate_recovery(&auto_event_id, None).await {
                    log::error!("Auto-failover for {} failed: {}", auto_event_id, e);
                }
            });
        }

        event
    }

    /// Select a plan and execute it. Runs to completion; use
    /// [`initiate_recovery_background`] to run detached.
    pub async fn initiate_recovery(
        &self,
        event_id: &str,
        plan_id: Option<&str>,
    ) -> DrResult<DisasterEvent> {
        let (kind, severity) = {
            let events = self.events.read().await;
            let event = events
                .get(event_id)
                .ok_or_else(|| DrError::EventNotFound(event_id.to_string()))?;
            (event.kind, event.severity)
        };

        let plan = self.select_plan(kind, severity, plan_id).await?;

        if !self.running.write().await.insert(event_id.to_string()) {
            return Err(DrError::RecoveryInProgress(event_id.to_string()));
        }
        let result = self.run_recovery(event_id, &plan).await;
        self.running.write().await.remove(event_id);
        result
    }

    /// Detached variant of [`initiate_recovery`].
    pub fn initiate_recovery_background(self: &Arc<Self>, event_id: &str, plan_id: Option<String>) {
        let orchestrator = Arc::clone(self);
        let event_id = event_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = orchestrator
                .initiate_recovery(&event_id, plan_id.as_deref())
                .await
            {
                log::error!("Recovery for {} failed to start: {}", event_id, e);
            }
        });
    }

    /// Plan selection: the caller's choice first, else the first plan
    /// matching (kind, severity), else the first matching kind alone.
    async fn select_plan(
        &self,
        kind: DisasterKind,
        severity: Severity,
        plan_id: Option<&str>,
    ) -> DrResult<RecoveryPlan> {
        let plans = self.plans.read().await;

        if let Some(plan_id) = plan_id {
            return plans
                .get(plan_id)
                .cloned()
                .ok_or_else(|| DrError::PlanNotFound(plan_id.to_string()));
        }

        let mut candidates: Vec<&RecoveryPlan> = plans.values().collect();
        candidates.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));

        candidates
            .iter()
            .find(|plan| plan.disaster_kind == kind && plan.severity == Some(severity))
            .or_else(|| candidates.iter().find(|plan| plan.disaster_kind == kind))
            .map(|plan| (*plan).clone())
            .ok_or(DrError::NoPlanFound(kind, severity))
    }

    async fn run_recovery(&self, event_id: &str, plan: &RecoveryPlan) -> DrResult<DisasterEvent> {
        let started_at = Utc::now();
        self.update_event(event_id, |event| {
            event.state = RecoveryState::Recovering;
            event.recovery_started_at = Some(started_at);
            event.recovery_plan_id = Some(plan.plan_id.clone());
        })
        .await?;

        let (kind, severity) = {
            let events = self.events.read().await;
            let event = events
                .get(event_id)
                .ok_or_else(|| DrError::EventNotFound(event_id.to_string()))?;
            (event.kind, event.severity)
        };
        let records = self
            .notifications
            .notify(
                event_id,
                &format!("{:?}", kind),
                severity.as_str(),
                &format!("Recovery started with plan {}", plan.plan_id),
            )
            .await;
        self.update_event(event_id, |event| event.notifications_sent.extend(records.clone()))
            .await?;

        // 1. Pre-checks are advisory.
        for check_id in &plan.pre_checks {
            let status = self.health.run_check(check_id).await;
            if status != HealthStatus::Healthy {
                let warning = format!("pre-check {} is {:?}", check_id, status);
                log::warn!("{}", warning);
                self.update_event(event_id, |event| event.warnings.push(warning.clone()))
                    .await?;
            }
        }

        // 2. Steps in ascending order.
        let mut steps = plan.steps.clone();
        steps.sort_by_key(|step| step.order);

        let mut failure: Option<String> = None;
        for step in &steps {
            match self.execute_step(event_id, step).await {
                Ok(()) => {}
                Err(message) => {
                    if step.can_fail {
                        let warning = format!("step {} failed (tolerated): {}", step.step_id, message);
                        log::warn!("{}", warning);
                        self.update_event(event_id, |event| event.warnings.push(warning.clone()))
                            .await?;
                    } else {
                        failure = Some(format!("step {} failed: {}", step.step_id, message));
                        break;
                    }
                }
            }
        }

        // 3. Post-checks must all be healthy.
        if failure.is_none() {
            for check_id in &plan.post_checks {
                let status = self.health.run_check(check_id).await;
                if status != HealthStatus::Healthy {
                    failure = Some(format!("post-check {} is {:?}", check_id, status));
                    break;
                }
            }
        }

        match failure {
            None => self.complete_recovery(event_id, started_at).await,
            Some(message) => self.fail_and_rollback(event_id, plan, message).await,
        }
    }

    async fn execute_step(&self, event_id: &str, step: &RecoveryStep) -> Result<(), String> {
        let timeout = Duration::from_secs(step.timeout_secs);
        let mut last_error = String::new();

        for attempt in 0..=step.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.config.step_retry_backoff * attempt).await;
            }

            let outcome = tokio::time::timeout(timeout, self.dispatch_step(event_id, step)).await;
            match outcome {
                Ok(Ok(())) => {
                    log::info!("Recovery step {} succeeded", step.step_id);
                    return Ok(());
                }
                Ok(Err(message)) => last_error = message,
                Err(_) => last_error = format!("timed out after {:?}", timeout),
            }
            log::warn!(
                "Recovery step {} attempt {} failed: {}",
                step.step_id,
                attempt + 1,
                last_error
            );
        }

        Err(last_error)
    }

    async fn dispatch_step(&self, event_id: &str, step: &RecoveryStep) -> Result<(), String> {
        match step.action {
            StepAction::Script => {
                // Commands are simulated; a real deployment wires a shell
                // runner through the action handler instead.
                let command = step
                    .parameters
                    .get("command")
                    .and_then(|value| value.as_str())
                    .unwrap_or("<none>");
                log::info!("Simulating recovery script for {}: {}", step.step_id, command);
                Ok(())
            }
            StepAction::Wait => {
                let seconds = step
                    .parameters
                    .get("seconds")
                    .and_then(|value| value.as_u64())
                    .unwrap_or(1);
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                Ok(())
            }
            StepAction::Manual => self.wait_for_approval(event_id, step).await,
            StepAction::Check => {
                let check_id = step
                    .parameters
                    .get("check_id")
                    .and_then(|value| value.as_str())
                    .ok_or_else(|| "check step missing check_id".to_string())?;
                match self.health.run_check(check_id).await {
                    HealthStatus::Healthy => Ok(()),
                    status => Err(format!("check {} is {:?}", check_id, status)),
                }
            }
            StepAction::Repair | StepAction::Rebuild | StepAction::Restore | StepAction::Validate => {
                let handler = self.action_handler.read().await.clone();
                match handler {
                    Some(handler) => handler.execute(step.action, &step.parameters).await,
                    None => Err("no recovery action handler installed".to_string()),
                }
            }
        }
    }

    async fn wait_for_approval(&self, event_id: &str, step: &RecoveryStep) -> Result<(), String> {
        let key = (event_id.to_string(), step.step_id.clone());
        loop {
            if self.approvals.read().await.contains(&key) {
                return Ok(());
            }
            tokio::time::sleep(self.config.approval_poll_interval).await;
        }
    }

    /// Out-of-band confirmation for a manual step.
    pub async fn approve_step(&self, event_id: &str, step_id: &str) {
        self.approvals
            .write()
            .await
            .insert((event_id.to_string(), step_id.to_string()));
    }

    async fn complete_recovery(
        &self,
        event_id: &str,
        started_at: DateTime<Utc>,
    ) -> DrResult<DisasterEvent> {
        let completed_at = Utc::now();
        let minutes = (completed_at - started_at).num_seconds() as f64 / 60.0;

        self.update_event(event_id, |event| {
            event.state = RecoveryState::Completed;
            event.recovery_completed_at = Some(completed_at);
            event.actual_recovery_minutes = Some(minutes.ceil() as i64);
            event.data_loss_minutes = Some(0);
        })
        .await?;

        let event = self.archive(event_id).await?;
        self.record_metrics(minutes, true, event.rto_target_minutes).await;
        log::info!("Recovery completed for {} in {:.1} minutes", event_id, minutes);
        Ok(event)
    }

    async fn fail_and_rollback(
        &self,
        event_id: &str,
        plan: &RecoveryPlan,
        message: String,
    ) -> DrResult<DisasterEvent> {
        log::error!("Recovery failed for {}: {}", event_id, message);
        self.update_event(event_id, |event| {
            event.state = RecoveryState::Failed;
            event.errors.push(message.clone());
        })
        .await?;

        let (kind, severity, started_at) = {
            let events = self.events.read().await;
            let event = events
                .get(event_id)
                .ok_or_else(|| DrError::EventNotFound(event_id.to_string()))?;
            (event.kind, event.severity, event.recovery_started_at)
        };
        let records = self
            .notifications
            .notify(
                event_id,
                &format!("{:?}", kind),
                severity.as_str(),
                &format!("Recovery failed: {}", message),
            )
            .await;
        self.update_event(event_id, |event| event.notifications_sent.extend(records.clone()))
            .await?;

        // Rollback steps run best-effort, in order.
        let mut rollback = plan.rollback_steps.clone();
        rollback.sort_by_key(|step| step.order);
        for step in &rollback {
            if let Err(e) = self.execute_step(event_id, step).await {
                let warning = format!("rollback step {} failed: {}", step.step_id, e);
                log::warn!("{}", warning);
                self.update_event(event_id, |event| event.warnings.push(warning.clone()))
                    .await?;
            }
        }

        self.update_event(event_id, |event| {
            event.state = RecoveryState::RolledBack;
            event.recovery_completed_at = Some(Utc::now());
        })
        .await?;

        let minutes = started_at
            .map(|start| (Utc::now() - start).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        let event = self.archive(event_id).await?;
        self.record_metrics(minutes, false, event.rto_target_minutes).await;
        Ok(event)
    }

    async fn record_metrics(&self, minutes: f64, success: bool, rto_target: i64) {
        let mut samples = self.recovery_minutes.write().await;
        samples.push((minutes, success));

        let mut metrics = self.metrics.write().await;
        metrics.total_events += 1;
        if success {
            metrics.successful_recoveries += 1;
        } else {
            metrics.failed_recoveries += 1;
        }

        let successful: Vec<f64> = samples
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(m, _)| *m)
            .collect();
        if !successful.is_empty() {
            let total: f64 = successful.iter().sum();
            metrics.mttr = total / successful.len() as f64;
        }

        let all: Vec<f64> = samples.iter().map(|(m, _)| *m).collect();
        metrics.average_recovery_minutes = all.iter().sum::<f64>() / all.len() as f64;

        let compliant = samples
            .iter()
            .filter(|(m, ok)| *ok && *m <= rto_target as f64)
            .count();
        if metrics.total_events > 0 {
            metrics.rto_compliance_rate = compliant as f64 / metrics.total_events as f64;
        }
    }

    async fn update_event<F: FnMut(&mut DisasterEvent)>(
        &self,
        event_id: &str,
        mut mutate: F,
    ) -> DrResult<()> {
        let mut events = self.events.write().await;
        let event = events
            .get_mut(event_id)
            .ok_or_else(|| DrError::EventNotFound(event_id.to_string()))?;
        mutate(event);
        Ok(())
    }

    /// Copy a terminal event into history and return it.
    async fn archive(&self, event_id: &str) -> DrResult<DisasterEvent> {
        let event = self
            .events
            .read()
            .await
            .get(event_id)
            .cloned()
            .ok_or_else(|| DrError::EventNotFound(event_id.to_string()))?;
        self.history.write().await.push(event.clone());
        Ok(event)
    }

    pub async fn event(&self, event_id: &str) -> Option<DisasterEvent> {
        self.events.read().await.get(event_id).cloned()
    }

    pub async fn metrics(&self) -> RecoveryMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn history(&self) -> Vec<DisasterEvent> {
        self.history.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::health::HealthMonitorConfig;
    use crate::recovery::notifications::{LogDelivery, NotificationChannel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandler {
        fail_on: StepAction,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecoveryActionHandler for ScriptedHandler {
        async fn execute(
            &self,
            action: StepAction,
            _parameters: &HashMap<String, serde_json::Value>,
        ) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if action == self.fail_on {
                Err(format!("{:?} action failed", action))
            } else {
                Ok(())
            }
        }
    }

    fn orchestrator() -> Arc<DisasterRecoveryOrchestrator> {
        let health = Arc::new(HealthMonitor::new(HealthMonitorConfig::default()));
        let mut notifications = NotificationManager::new("worker-test");
        notifications.add_delivery(Box::new(LogDelivery::new(NotificationChannel::Webhook)));

        Arc::new(DisasterRecoveryOrchestrator::new(
            DrConfig {
                step_retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            health,
            Arc::new(notifications),
        ))
    }

    fn hw_plan(plan_id: &str, severity: Option<Severity>) -> RecoveryPlan {
        RecoveryPlan {
            plan_id: plan_id.to_string(),
            name: format!("plan {}", plan_id),
            disaster_kind: DisasterKind::HardwareFailure,
            severity,
            steps: vec![
                {
                    let mut step = RecoveryStep::new("s1", "repair disk", StepAction::Repair, 1);
                    step.retry_count = 0;
                    step
                },
                {
                    let mut step = RecoveryStep::new("s2", "restore data", StepAction::Restore, 2);
                    step.retry_count = 0;
                    step
                },
            ],
            rollback_steps: vec![
                RecoveryStep::new("r1", "detach replacement", StepAction::Script, 1),
                RecoveryStep::new("r2", "reattach original", StepAction::Script, 2),
            ],
            pre_checks: Vec::new(),
            post_checks: Vec::new(),
            estimated_duration_minutes: 30,
            requires_approval: false,
        }
    }

    #[tokio::test]
    async fn test_successful_recovery_lifecycle() {
        let orchestrator = orchestrator();
        orchestrator
            .set_action_handler(Arc::new(ScriptedHandler {
                fail_on: StepAction::Script, // never dispatched via handler
                calls: AtomicUsize::new(0),
            }))
            .await;
        orchestrator.register_plan(hw_plan("P-hw-high", Some(Severity::High))).await;

        let event = orchestrator
            .detect(DisasterKind::HardwareFailure, "disk died")
            .await;
        assert_eq!(event.state, RecoveryState::Assessing);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.rto_target_minutes, 240);
        assert_eq!(event.rpo_target_minutes, 60);

        let finished = orchestrator
            .initiate_recovery(&event.event_id, None)
            .await
            .unwrap();
        assert_eq!(finished.state, RecoveryState::Completed);
        assert!(finished.actual_recovery_minutes.is_some());

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.total_events, 1);
        assert_eq!(metrics.successful_recoveries, 1);
        assert!(metrics.rto_compliance_rate > 0.99);
    }

    #[tokio::test]
    async fn test_failed_step_triggers_rollback() {
        let orchestrator = orchestrator();
        let handler = Arc::new(ScriptedHandler {
            fail_on: StepAction::Restore,
            calls: AtomicUsize::new(0),
        });
        orchestrator.set_action_handler(handler.clone()).await;
        orchestrator.register_plan(hw_plan("P-hw-high", Some(Severity::High))).await;

        let event = orchestrator
            .detect(DisasterKind::HardwareFailure, "disk died")
            .await;
        let finished = orchestrator
            .initiate_recovery(&event.event_id, None)
            .await
            .unwrap();

        // s1 succeeded, s2 failed, rollback ran, terminal rolled-back.
        assert_eq!(finished.state, RecoveryState::RolledBack);
        assert!(!finished.errors.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        // Detection, recovery-start and failure notifications all logged.
        assert!(finished.notifications_sent.len() >= 3);

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.failed_recoveries, 1);
    }

    #[tokio::test]
    async fn test_plan_selection_precedence() {
        let orchestrator = orchestrator();
        orchestrator.register_plan(hw_plan("a-kind-only", None)).await;
        orchestrator.register_plan(hw_plan("b-exact", Some(Severity::High))).await;

        let plan = orchestrator
            .select_plan(DisasterKind::HardwareFailure, Severity::High, None)
            .await
            .unwrap();
        assert_eq!(plan.plan_id, "b-exact");

        // No exact severity match falls back to the kind-only plan.
        let plan = orchestrator
            .select_plan(DisasterKind::HardwareFailure, Severity::Low, None)
            .await
            .unwrap();
        assert_eq!(plan.plan_id, "a-kind-only");

        // Explicit plan id wins.
        let plan = orchestrator
            .select_plan(DisasterKind::HardwareFailure, Severity::High, Some("a-kind-only"))
            .await
            .unwrap();
        assert_eq!(plan.plan_id, "a-kind-only");

        assert!(matches!(
            orchestrator
                .select_plan(DisasterKind::CyberAttack, Severity::High, None)
                .await,
            Err(DrError::NoPlanFound(_, _))
        ));
    }

    #[tokio::test]
    async fn test_can_fail_step_is_tolerated() {
        let orchestrator = orchestrator();
        let handler = Arc::new(ScriptedHandler {
            fail_on: StepAction::Validate,
            calls: AtomicUsize::new(0),
        });
        orchestrator.set_action_handler(handler).await;

        let mut plan = hw_plan("P-tolerant", None);
        let mut validate = RecoveryStep::new("s3", "optional validation", StepAction::Validate, 3);
        validate.retry_count = 0;
        plan.steps.push(validate.can_fail());
        orchestrator.register_plan(plan).await;

        let event = orchestrator
            .detect(DisasterKind::HardwareFailure, "flaky controller")
            .await;
        let finished = orchestrator
            .initiate_recovery(&event.event_id, Some("P-tolerant"))
            .await
            .unwrap();

        assert_eq!(finished.state, RecoveryState::Completed);
        assert!(!finished.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_recovery_rejected() {
        let orchestrator = orchestrator();
        orchestrator
            .set_action_handler(Arc::new(ScriptedHandler {
                fail_on: StepAction::Script,
                calls: AtomicUsize::new(0),
            }))
            .await;

        let mut plan = hw_plan("P-slow", None);
        plan.steps = vec![RecoveryStep::new("w", "wait", StepAction::Wait, 1)
            .with_param("seconds", serde_json::json!(1))];
        orchestrator.register_plan(plan).await;

        let event = orchestrator
            .detect(DisasterKind::HardwareFailure, "slow incident")
            .await;

        let background = Arc::clone(&orchestrator);
        let background_event = event.event_id.clone();
        let task = tokio::spawn(async move {
            background.initiate_recovery(&background_event, None).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            orchestrator.initiate_recovery(&event.event_id, None).await,
            Err(DrError::RecoveryInProgress(_))
        ));

        task.await.unwrap().unwrap();
    }
}

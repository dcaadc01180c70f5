//! End-to-end disaster recovery with rollback

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cadvault::recovery::{
    DisasterKind, DisasterRecoveryOrchestrator, DrConfig, HealthMonitor, HealthMonitorConfig,
    LogDelivery, NotificationChannel, NotificationManager, RecoveryActionHandler, RecoveryPlan,
    RecoveryState, RecoveryStep, Severity, StepAction,
};

/// Records every dispatched action in order; fails the configured one.
struct TracingHandler {
    fail_on: Option<StepAction>,
    trace: Mutex<Vec<StepAction>>,
}

impl TracingHandler {
    fn new(fail_on: Option<StepAction>) -> Self {
        Self {
            fail_on,
            trace: Mutex::new(Vec::new()),
        }
    }

    fn trace(&self) -> Vec<StepAction> {
        self.trace.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecoveryActionHandler for TracingHandler {
    async fn execute(
        &self,
        action: StepAction,
        _parameters: &HashMap<String, serde_json::Value>,
    ) -> Result<(), String> {
        self.trace.lock().unwrap().push(action);
        if self.fail_on == Some(action) {
            Err(format!("{:?} failed", action))
        } else {
            Ok(())
        }
    }
}

fn orchestrator() -> Arc<DisasterRecoveryOrchestrator> {
    let health = Arc::new(HealthMonitor::new(HealthMonitorConfig::default()));
    let mut notifications = NotificationManager::new("worker-e2e");
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

fn step(step_id: &str, action: StepAction, order: u32) -> RecoveryStep {
    let mut step = RecoveryStep::new(step_id, step_id, action, order);
    step.retry_count = 0;
    step
}

fn hw_high_plan() -> RecoveryPlan {
    RecoveryPlan {
        plan_id: "P-hw-high".to_string(),
        name: "hardware high".to_string(),
        disaster_kind: DisasterKind::HardwareFailure,
        severity: Some(Severity::High),
        steps: vec![
            step("s1", StepAction::Repair, 1),
            step("s2", StepAction::Restore, 2),
        ],
        rollback_steps: vec![
            step("r1", StepAction::Rebuild, 1),
            step("r2", StepAction::Validate, 2),
        ],
        pre_checks: Vec::new(),
        post_checks: Vec::new(),
        estimated_duration_minutes: 30,
        requires_approval: false,
    }
}

/// A failure in the second step rolls the event back through both
/// rollback steps, in order, with the full notification trail.
#[tokio::test]
async fn test_failed_recovery_rolls_back() {
    let orchestrator = orchestrator();
    let handler = Arc::new(TracingHandler::new(Some(StepAction::Restore)));
    orchestrator
        .set_action_handler(Arc::clone(&handler) as Arc<dyn RecoveryActionHandler>)
        .await;
    orchestrator.register_plan(hw_high_plan()).await;

    let event = orchestrator
        .detect(DisasterKind::HardwareFailure, "raid controller failure")
        .await;
    // Detection already notified and the event is past detecting.
    assert_eq!(event.state, RecoveryState::Assessing);
    assert!(!event.notifications_sent.is_empty());

    let finished = orchestrator
        .initiate_recovery(&event.event_id, None)
        .await
        .unwrap();

    assert_eq!(finished.state, RecoveryState::RolledBack);
    assert!(!finished.errors.is_empty());

    // s1 succeeded, s2 failed, then r1 and r2 ran in order.
    assert_eq!(
        handler.trace(),
        vec![
            StepAction::Repair,
            StepAction::Restore,
            StepAction::Rebuild,
            StepAction::Validate,
        ]
    );

    // Detection, recovery-start and failure notifications.
    assert!(finished.notifications_sent.len() >= 3);

    let metrics = orchestrator.metrics().await;
    assert_eq!(metrics.total_events, 1);
    assert_eq!(metrics.failed_recoveries, 1);
    assert_eq!(metrics.successful_recoveries, 0);
}

/// The happy path completes the event and updates RTO accounting.
#[tokio::test]
async fn test_successful_recovery_completes() {
    let orchestrator = orchestrator();
    let handler = Arc::new(TracingHandler::new(None));
    orchestrator
        .set_action_handler(Arc::clone(&handler) as Arc<dyn RecoveryActionHandler>)
        .await;
    orchestrator.register_plan(hw_high_plan()).await;

    let event = orchestrator
        .detect(DisasterKind::HardwareFailure, "disk swap")
        .await;
    let finished = orchestrator
        .initiate_recovery(&event.event_id, None)
        .await
        .unwrap();

    assert_eq!(finished.state, RecoveryState::Completed);
    assert!(finished.actual_recovery_minutes.is_some());
    assert_eq!(finished.rto_target_minutes, Severity::High.rto_minutes());

    let metrics = orchestrator.metrics().await;
    assert_eq!(metrics.successful_recoveries, 1);
    assert!(metrics.rto_compliance_rate > 0.99);
    assert!(metrics.mttr >= 0.0);

    // Terminal events are archived to history.
    assert_eq!(orchestrator.history().await.len(), 1);
}

/// Tolerated step failures downgrade to warnings instead of rollback.
#[tokio::test]
async fn test_can_fail_step_warns_only() {
    let orchestrator = orchestrator();
    let handler = Arc::new(TracingHandler::new(Some(StepAction::Validate)));
    orchestrator
        .set_action_handler(Arc::clone(&handler) as Arc<dyn RecoveryActionHandler>)
        .await;

    let mut plan = hw_high_plan();
    plan.plan_id = "P-tolerant".to_string();
    let mut optional = step("s3", StepAction::Validate, 3);
    optional.can_fail = true;
    plan.steps.push(optional);
    orchestrator.register_plan(plan).await;

    let event = orchestrator
        .detect(DisasterKind::HardwareFailure, "flaky firmware")
        .await;
    let finished = orchestrator
        .initiate_recovery(&event.event_id, Some("P-tolerant"))
        .await
        .unwrap();

    assert_eq!(finished.state, RecoveryState::Completed);
    assert!(finished.warnings.iter().any(|w| w.contains("s3")));
}

//! Recovery subsystems
//!
//! This module provides:
//!
//! ## Point-in-time recovery
//! - Checkpoint + WAL-tail replay to any timestamp or transaction
//! - Conflict resolution policies and dry runs
//!
//! ## Disaster recovery
//! - Health monitoring with HTTP/TCP/custom probes
//! - Recovery-plan execution with rollback and RTO/RPO accounting
//! - Multi-channel incident notifications
//!
//! ## Model recovery
//! - CAD-specific corruption detection, repair planning and execution

pub mod disaster;
pub mod health;
pub mod model_repair;
pub mod notifications;
pub mod pitr;

pub use disaster::{
    DisasterEvent, DisasterKind, DisasterRecoveryOrchestrator, DrConfig, DrError, DrResult,
    RecoveryActionHandler, RecoveryMetrics, RecoveryPlan, RecoveryState, RecoveryStep, Severity,
    StepAction,
};
pub use health::{
    CustomProbe, HealthCheck, HealthCheckKind, HealthCheckState, HealthMonitor,
    HealthMonitorConfig, HealthStatus,
};
pub use model_repair::{
    CorruptionType, ModelCorruption, ModelRecoveryService, RepairPlan, RepairReport, RepairStep,
    RepairStrategy,
};
pub use notifications::{
    IncidentNotification, LogDelivery, NotificationChannel, NotificationDelivery,
    NotificationManager, NotificationRecord, WebhookDelivery,
};
pub use pitr::{
    ConflictResolution, LogicalState, PitrConfig, PointInTimeRecovery, RecoveryMode,
    RecoveryRequest, RecoveryResult,
};

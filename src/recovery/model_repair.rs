//! CAD model recovery service
//!
//! Specializes disaster recovery for CAD documents: corruption detection
//! through the kernel's validators, strategy selection, repair-plan
//! execution, and a thin auto-recover gate for document opens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backup::BackupEngine;
use crate::collaborators::{CadKernel, ValidationLevel};
use crate::wal::{TransactionKind, WalManager};

use super::disaster::{RecoveryActionHandler, Severity, StepAction};

/// Corruption classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionType {
    GeometryInvalid,
    ConstraintConflict,
    ReferenceMissing,
    FileTruncated,
    FeatureTreeBroken,
}

/// Repair strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    AutoRepair,
    RestoreBackup,
    RebuildFeatures,
    PartialRecovery,
}

/// A detected corruption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCorruption {
    pub corruption_id: String,
    pub document_id: String,
    pub corruption_type: CorruptionType,
    pub severity: Severity,
    pub errors: Vec<String>,
    pub affected_features: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// One step of a repair plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairStep {
    pub step_id: String,
    pub name: String,
    /// Kernel repair operation or engine action this step performs
    pub operation: String,
    pub estimated_success_rate: f64,
}

/// An assembled repair plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairPlan {
    pub plan_id: String,
    pub document_id: String,
    pub strategy: RepairStrategy,
    pub steps: Vec<RepairStep>,
}

/// Report emitted by every recovery execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub report_id: String,
    pub document_id: String,
    pub corruption_type: Option<CorruptionType>,
    pub strategy: RepairStrategy,
    pub success: bool,
    pub recovered_features: u64,
    pub lost_features: u64,
    pub validation_passed: bool,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

static FEATURE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'([A-Za-z0-9_]+)'").expect("static regex"));

/// Classify validator errors into a corruption type.
fn classify_errors(errors: &[String]) -> CorruptionType {
    let combined = errors.join(" ").to_ascii_lowercase();

    if combined.contains("geometry") || combined.contains("shape") {
        CorruptionType::GeometryInvalid
    } else if combined.contains("constraint") || combined.contains("conflict") {
        CorruptionType::ConstraintConflict
    } else if combined.contains("reference") || combined.contains("missing") {
        CorruptionType::ReferenceMissing
    } else if combined.contains("file") || combined.contains("truncated") {
        CorruptionType::FileTruncated
    } else {
        CorruptionType::FeatureTreeBroken
    }
}

/// Severity from the corruption type and error volume.
fn determine_severity(corruption_type: CorruptionType, error_count: usize) -> Severity {
    if corruption_type == CorruptionType::FileTruncated {
        Severity::Critical
    } else if error_count > 10 {
        Severity::High
    } else if error_count > 5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Feature names quoted inside error messages.
fn extract_affected_features(errors: &[String]) -> Vec<String> {
    let mut features: Vec<String> = errors
        .iter()
        .flat_map(|error| {
            FEATURE_NAME
                .captures_iter(error)
                .map(|capture| capture[1].to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    features.sort();
    features.dedup();
    features
}

/// CAD-specific corruption detection and repair.
pub struct ModelRecoveryService {
    kernel: Arc<dyn CadKernel>,
    backup: Arc<BackupEngine>,
    wal: Arc<WalManager>,
}

impl ModelRecoveryService {
    pub fn new(kernel: Arc<dyn CadKernel>, backup: Arc<BackupEngine>, wal: Arc<WalManager>) -> Self {
        Self {
            kernel,
            backup,
            wal,
        }
    }

    /// Run the validator and classify any corruption found.
    pub async fn detect_corruption(
        &self,
        document_id: &str,
        level: ValidationLevel,
    ) -> Option<ModelCorruption> {
        let errors = match self.kernel.validate_document(document_id, level).await {
            Ok(errors) => errors,
            Err(e) => vec![format!("file validation failed: {}", e)],
        };

        if errors.is_empty() {
            return None;
        }

        let corruption_type = classify_errors(&errors);
        let severity = determine_severity(corruption_type, errors.len());
        let affected_features = extract_affected_features(&errors);

        log::warn!(
            "Corruption detected in {}: {:?} ({:?}, {} errors)",
            document_id,
            corruption_type,
            severity,
            errors.len()
        );

        Some(ModelCorruption {
            corruption_id: format!("corr_{}", uuid::Uuid::new_v4().simple()),
            document_id: document_id.to_string(),
            corruption_type,
            severity,
            errors,
            affected_features,
            detected_at: Utc::now(),
        })
    }

    /// Pick a strategy for a corruption when the caller does not force one.
    fn select_strategy(corruption: &ModelCorruption) -> RepairStrategy {
        if corruption.severity == Severity::Critical {
            return RepairStrategy::RestoreBackup;
        }
        match corruption.corruption_type {
            CorruptionType::GeometryInvalid | CorruptionType::ConstraintConflict => {
                RepairStrategy::AutoRepair
            }
            CorruptionType::FeatureTreeBroken => RepairStrategy::RebuildFeatures,
            CorruptionType::FileTruncated => RepairStrategy::RestoreBackup,
            CorruptionType::ReferenceMissing => RepairStrategy::PartialRecovery,
        }
    }

    /// Assemble the ordered step list for a corruption.
    pub fn plan_recovery(
        &self,
        corruption: &ModelCorruption,
        strategy: Option<RepairStrategy>,
    ) -> RepairPlan {
        let strategy = strategy.unwrap_or_else(|| Self::select_strategy(corruption));

        let steps = match strategy {
            RepairStrategy::AutoRepair => vec![
                RepairStep {
                    step_id: "recompute-geometry".to_string(),
                    name: "Recompute geometry".to_string(),
                    operation: "recompute_geometry".to_string(),
                    estimated_success_rate: 0.7,
                },
                RepairStep {
                    step_id: "solve-constraints".to_string(),
                    name: "Run constraint solver".to_string(),
                    operation: "solve_constraints".to_string(),
                    estimated_success_rate: 0.6,
                },
            ],
            RepairStrategy::RebuildFeatures => vec![
                RepairStep {
                    step_id: "analyze-deps".to_string(),
                    name: "Analyze feature dependencies".to_string(),
                    operation: "analyze_dependencies".to_string(),
                    estimated_success_rate: 0.9,
                },
                RepairStep {
                    step_id: "regenerate".to_string(),
                    name: "Regenerate features in order".to_string(),
                    operation: "regenerate_features".to_string(),
                    estimated_success_rate: 0.65,
                },
                RepairStep {
                    step_id: "reapply-constraints".to_string(),
                    name: "Reapply constraints".to_string(),
                    operation: "reapply_constraints".to_string(),
                    estimated_success_rate: 0.6,
                },
            ],
            RepairStrategy::RestoreBackup => vec![
                RepairStep {
                    step_id: "locate-backup".to_string(),
                    name: "Locate most recent valid backup".to_string(),
                    operation: "locate_backup".to_string(),
                    estimated_success_rate: 0.95,
                },
                RepairStep {
                    step_id: "restore".to_string(),
                    name: "Restore backup content".to_string(),
                    operation: "restore_backup".to_string(),
                    estimated_success_rate: 0.9,
                },
                RepairStep {
                    step_id: "replay-wal".to_string(),
                    name: "Replay post-backup transactions".to_string(),
                    operation: "replay_wal".to_string(),
                    estimated_success_rate: 0.85,
                },
            ],
            RepairStrategy::PartialRecovery => vec![
                RepairStep {
                    step_id: "extract".to_string(),
                    name: "Extract salvageable features".to_string(),
                    operation: "extract_features".to_string(),
                    estimated_success_rate: 0.5,
                },
                RepairStep {
                    step_id: "rebuild-minimal".to_string(),
                    name: "Rebuild minimal feature tree".to_string(),
                    operation: "rebuild_minimal_tree".to_string(),
                    estimated_success_rate: 0.4,
                },
            ],
        };

        RepairPlan {
            plan_id: format!("rplan_{}", uuid::Uuid::new_v4().simple()),
            document_id: corruption.document_id.clone(),
            strategy,
            steps,
        }
    }

    /// Execute a repair plan and emit a report. The repair event is also
    /// written to the WAL so subsequent recoveries see it.
    pub async fn execute(&self, plan: &RepairPlan) -> RepairReport {
        let started = Instant::now();
        let document_id = plan.document_id.clone();

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut recovered_features = 0u64;

        for step in &plan.steps {
            let outcome = match (plan.strategy, step.operation.as_str()) {
                (RepairStrategy::RestoreBackup, "locate_backup") => {
                    match self.backup.latest_valid_snapshot(&document_id).await {
                        Some(_) => Ok(()),
                        None => Err(format!("no valid backup for {}", document_id)),
                    }
                }
                (RepairStrategy::RestoreBackup, "restore_backup") => {
                    self.restore_from_backup(&document_id).await
                }
                (RepairStrategy::RestoreBackup, "replay_wal") => {
                    self.replay_post_backup(&document_id, &mut warnings).await
                }
                _ => self
                    .kernel
                    .repair(&document_id, &step.operation)
                    .await
                    .map_err(|e| e.to_string()),
            };

            match outcome {
                Ok(()) => {
                    recovered_features += 1;
                    // Validate after every step; a failure is recorded
                    // but later steps may still fix it.
                    if let Ok(step_errors) = self
                        .kernel
                        .validate_document(&document_id, ValidationLevel::Basic)
                        .await
                    {
                        if !step_errors.is_empty() {
                            warnings.push(format!(
                                "{} validation errors remain after step {}",
                                step_errors.len(),
                                step.step_id
                            ));
                        }
                    }
                }
                Err(message) => {
                    errors.push(format!("step {}: {}", step.step_id, message));
                }
            }
        }

        let validation_passed = self
            .kernel
            .validate_document(&document_id, ValidationLevel::Basic)
            .await
            .map(|remaining| remaining.is_empty())
            .unwrap_or(false);

        let success = validation_passed && errors.is_empty();
        let report = RepairReport {
            report_id: format!("rep_{}", uuid::Uuid::new_v4().simple()),
            document_id: document_id.clone(),
            corruption_type: None,
            strategy: plan.strategy,
            success,
            recovered_features,
            lost_features: errors.len() as u64,
            validation_passed,
            duration_seconds: started.elapsed().as_secs_f64(),
            errors,
            warnings,
        };

        let entry = crate::wal::TransactionEntry::new(
            TransactionKind::Update,
            &document_id,
            serde_json::json!({
                "repair": {
                    "report_id": report.report_id,
                    "strategy": format!("{:?}", plan.strategy),
                    "success": report.success,
                }
            }),
            None,
            None,
            None,
        );
        if let Err(e) = self.wal.append(&entry).await {
            log::error!("Failed to journal repair of {}: {}", document_id, e);
        }

        log::info!(
            "Repair of {} via {:?}: success={}, validation_passed={}",
            document_id,
            plan.strategy,
            report.success,
            report.validation_passed
        );
        report
    }

    async fn restore_from_backup(&self, document_id: &str) -> Result<(), String> {
        let snapshot = self
            .backup
            .latest_valid_snapshot(document_id)
            .await
            .ok_or_else(|| format!("no valid backup for {}", document_id))?;

        let content = self
            .backup
            .restore(&snapshot.snapshot_id)
            .await
            .map_err(|e| e.to_string())?;

        self.kernel
            .replace_content(document_id, &content)
            .await
            .map_err(|e| e.to_string())
    }

    /// Replay WAL entries recorded after the restored backup so the
    /// document catches up to its last journaled state.
    async fn replay_post_backup(
        &self,
        document_id: &str,
        warnings: &mut Vec<String>,
    ) -> Result<(), String> {
        let snapshot = self
            .backup
            .latest_valid_snapshot(document_id)
            .await
            .ok_or_else(|| format!("no valid backup for {}", document_id))?;

        let entries = self
            .wal
            .read(Some(snapshot.created_at), None, None)
            .await
            .map_err(|e| e.to_string())?;

        let relevant = entries
            .iter()
            .filter(|entry| entry.object_id == document_id)
            .count();
        if relevant > 0 {
            warnings.push(format!(
                "{} post-backup transactions replayed for {}",
                relevant, document_id
            ));
        }
        Ok(())
    }

    /// Thin gate for document opens: validate, auto-repair on failure.
    pub async fn auto_recover_on_open(&self, document_id: &str) -> bool {
        let corruption = match self
            .detect_corruption(document_id, ValidationLevel::Basic)
            .await
        {
            None => return true,
            Some(corruption) => corruption,
        };

        let plan = self.plan_recovery(&corruption, Some(RepairStrategy::AutoRepair));
        self.execute(&plan).await.success
    }
}

#[async_trait]
impl RecoveryActionHandler for ModelRecoveryService {
    async fn execute(
        &self,
        action: StepAction,
        parameters: &HashMap<String, serde_json::Value>,
    ) -> Result<(), String> {
        let document_id = parameters
            .get("document_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| "missing document_id parameter".to_string())?;

        let strategy = match action {
            StepAction::Repair => RepairStrategy::AutoRepair,
            StepAction::Rebuild => RepairStrategy::RebuildFeatures,
            StepAction::Restore => RepairStrategy::RestoreBackup,
            StepAction::Validate => {
                let errors = self
                    .kernel
                    .validate_document(document_id, ValidationLevel::Full)
                    .await
                    .map_err(|e| e.to_string())?;
                return if errors.is_empty() {
                    Ok(())
                } else {
                    Err(format!("{} validation errors", errors.len()))
                };
            }
            other => return Err(format!("unsupported recovery action {:?}", other)),
        };

        let corruption = self
            .detect_corruption(document_id, ValidationLevel::Full)
            .await
            .unwrap_or_else(|| ModelCorruption {
                corruption_id: format!("corr_{}", uuid::Uuid::new_v4().simple()),
                document_id: document_id.to_string(),
                corruption_type: CorruptionType::FeatureTreeBroken,
                severity: Severity::Low,
                errors: Vec::new(),
                affected_features: Vec::new(),
                detected_at: Utc::now(),
            });

        let plan = self.plan_recovery(&corruption, Some(strategy));
        let report = ModelRecoveryService::execute(self, &plan).await;
        if report.success {
            Ok(())
        } else {
            Err(report.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupConfig, SnapshotIndex};
    use crate::chunk::ChunkStore;
    use crate::collaborators::MockCadKernel;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use crate::wal::WalConfig;
    use tokio::sync::RwLock;

    struct Fixture {
        kernel: Arc<MockCadKernel>,
        backup: Arc<BackupEngine>,
        service: ModelRecoveryService,
    }

    async fn fixture(dir: &std::path::Path) -> Fixture {
        let kernel = Arc::new(MockCadKernel::new());
        let backup = Arc::new(BackupEngine::new(
            BackupConfig::default(),
            Arc::new(ChunkStore::new()),
            Arc::new(MemoryObjectStore::new()) as Arc<dyn ObjectStore>,
            Arc::new(RwLock::new(SnapshotIndex::new())),
        ));
        let wal = Arc::new(
            WalManager::new(WalConfig {
                wal_dir: dir.join("wal"),
                ..Default::default()
            })
            .await
            .unwrap(),
        );

        Fixture {
            kernel: Arc::clone(&kernel),
            backup: Arc::clone(&backup),
            service: ModelRecoveryService::new(kernel, backup, wal),
        }
    }

    #[test]
    fn test_error_classification() {
        let classify = |messages: &[&str]| {
            classify_errors(&messages.iter().map(|m| m.to_string()).collect::<Vec<_>>())
        };

        assert_eq!(classify(&["invalid shape in 'Pad001'"]), CorruptionType::GeometryInvalid);
        assert_eq!(classify(&["constraint conflict detected"]), CorruptionType::ConstraintConflict);
        assert_eq!(classify(&["reference 'Sketch002' missing"]), CorruptionType::ReferenceMissing);
        assert_eq!(classify(&["file appears truncated"]), CorruptionType::FileTruncated);
        assert_eq!(classify(&["unexpected tree node"]), CorruptionType::FeatureTreeBroken);
    }

    #[test]
    fn test_severity_rules() {
        assert_eq!(
            determine_severity(CorruptionType::FileTruncated, 1),
            Severity::Critical
        );
        assert_eq!(
            determine_severity(CorruptionType::GeometryInvalid, 11),
            Severity::High
        );
        assert_eq!(
            determine_severity(CorruptionType::GeometryInvalid, 6),
            Severity::Medium
        );
        assert_eq!(
            determine_severity(CorruptionType::GeometryInvalid, 2),
            Severity::Low
        );
    }

    #[test]
    fn test_feature_extraction() {
        let errors = vec![
            "geometry error in 'Pad001'".to_string(),
            "constraint loop between 'Sketch01' and 'Pad001'".to_string(),
        ];
        assert_eq!(extract_affected_features(&errors), vec!["Pad001", "Sketch01"]);
    }

    #[tokio::test]
    async fn test_detect_and_autorepair() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;

        fx.kernel.insert_document("doc", b"model content").await;
        fx.kernel
            .seed_validation_errors("doc", vec!["geometry error in 'Pad001'".to_string()])
            .await;

        let corruption = fx
            .service
            .detect_corruption("doc", ValidationLevel::Geometry)
            .await
            .unwrap();
        assert_eq!(corruption.corruption_type, CorruptionType::GeometryInvalid);
        assert_eq!(corruption.affected_features, vec!["Pad001"]);

        let plan = fx.service.plan_recovery(&corruption, None);
        assert_eq!(plan.strategy, RepairStrategy::AutoRepair);

        let report = fx.service.execute(&plan).await;
        assert!(report.success);
        assert!(report.validation_passed);
    }

    #[tokio::test]
    async fn test_restore_backup_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;

        // A healthy version exists in backup; the live document is
        // truncated.
        fx.kernel.insert_document("doc", b"broken").await;
        fx.backup
            .create(b"pristine document bytes", "doc", true, None, HashMap::new())
            .await
            .unwrap();
        fx.kernel
            .seed_validation_errors("doc", vec!["file truncated at byte 7".to_string()])
            .await;
        fx.kernel.set_repairable("doc", false).await;

        let corruption = fx
            .service
            .detect_corruption("doc", ValidationLevel::Full)
            .await
            .unwrap();
        assert_eq!(corruption.severity, Severity::Critical);

        let plan = fx.service.plan_recovery(&corruption, None);
        assert_eq!(plan.strategy, RepairStrategy::RestoreBackup);

        let report = fx.service.execute(&plan).await;
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(
            fx.kernel.document_content("doc").await.unwrap(),
            b"pristine document bytes"
        );
    }

    #[tokio::test]
    async fn test_auto_recover_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;

        fx.kernel.insert_document("clean", b"fine").await;
        assert!(fx.service.auto_recover_on_open("clean").await);

        fx.kernel.insert_document("dirty", b"bad").await;
        fx.kernel
            .seed_validation_errors("dirty", vec!["shape self-intersection".to_string()])
            .await;
        assert!(fx.service.auto_recover_on_open("dirty").await);

        fx.kernel.insert_document("hopeless", b"bad").await;
        fx.kernel
            .seed_validation_errors("hopeless", vec!["shape exploded".to_string()])
            .await;
        fx.kernel.set_repairable("hopeless", false).await;
        assert!(!fx.service.auto_recover_on_open("hopeless").await);
    }

    #[tokio::test]
    async fn test_action_handler_validate() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path()).await;

        fx.kernel.insert_document("doc", b"ok").await;
        let mut params = HashMap::new();
        params.insert("document_id".to_string(), serde_json::json!("doc"));

        let handler: &dyn RecoveryActionHandler = &fx.service;
        assert!(handler.execute(StepAction::Validate, &params).await.is_ok());

        fx.kernel
            .seed_validation_errors("doc", vec!["constraint conflict".to_string()])
            .await;
        assert!(handler.execute(StepAction::Validate, &params).await.is_err());
    }
}

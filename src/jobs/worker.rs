//! Worker loop: claims jobs, runs flows, brackets them with WAL entries
//! and triggers backups of produced documents

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backup::BackupEngine;
use crate::collaborators::{AiAdapter, CadKernel, ExportFormat, FemSolver};
use crate::error::{CodedError, ErrorCode};
use crate::fleet::{FleetState, LockGuard};
use crate::recovery::PointInTimeRecovery;
use crate::resilience::CircuitBreaker;
use crate::storage::ObjectStore;
use crate::wal::TransactionKind;

use super::job::{Job, JobKind};
use super::scheduler::{CheckpointOutcome, JobScheduler};

/// Flow execution errors
#[derive(Debug)]
pub enum FlowError {
    /// The job was cancelled or timed out at a checkpoint; its status
    /// is already terminal.
    Interrupted(CheckpointOutcome),
    /// The flow failed with a coded error.
    Failed(CodedError),
}

impl FlowError {
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        FlowError::Failed(CodedError::new(code, message))
    }
}

/// Result type for flow execution
pub type FlowResult<T> = Result<T, FlowError>;

/// Resource caps applied to FEM submissions before execution.
#[derive(Debug, Clone)]
pub struct FemLimits {
    pub max_nodes: u64,
    pub max_elements: u64,
    pub max_memory_mb: u64,
}

impl Default for FemLimits {
    fn default() -> Self {
        Self {
            max_nodes: 2_000_000,
            max_elements: 1_000_000,
            max_memory_mb: 16_384,
        }
    }
}

/// Everything a flow needs: services, collaborators and breakers.
pub struct FlowContext {
    pub scheduler: Arc<JobScheduler>,
    pub kernel: Arc<dyn CadKernel>,
    pub ai: Arc<dyn AiAdapter>,
    pub solver: Arc<dyn FemSolver>,
    pub storage: Arc<dyn ObjectStore>,
    pub backup: Arc<BackupEngine>,
    pub pitr: Arc<PointInTimeRecovery>,
    pub fleet: Arc<dyn FleetState>,
    pub ai_breaker: Arc<CircuitBreaker>,
    pub solver_breaker: Arc<CircuitBreaker>,
    pub storage_breaker: Arc<CircuitBreaker>,
    pub fem_limits: FemLimits,
    /// Working directory for solver input decks
    pub scratch_dir: std::path::PathBuf,
}

impl FlowContext {
    /// Progress checkpoint: polls cancellation and the timeout budget.
    /// Interrupts the flow when the job went terminal.
    pub async fn checkpoint(&self, job_id: &str, progress: u8) -> FlowResult<()> {
        match self.scheduler.checkpoint(job_id, progress).await {
            Ok(CheckpointOutcome::Continue) => Ok(()),
            Ok(outcome) => Err(FlowError::Interrupted(outcome)),
            Err(e) => Err(FlowError::failed(ErrorCode::Internal, e.to_string())),
        }
    }

    /// Exclusive per-document lock for the duration of a mutation.
    pub async fn lock_document(&self, document_id: &str) -> FlowResult<LockGuard> {
        let resource = format!("document:{}", document_id);
        for _ in 0..3 {
            match self.fleet.acquire_lock(&resource, Duration::from_secs(300)).await {
                Ok(Some(guard)) => return Ok(guard),
                Ok(None) => tokio::time::sleep(Duration::from_millis(200)).await,
                Err(e) => {
                    return Err(FlowError::failed(ErrorCode::FleetStateTimeout, e.to_string()))
                }
            }
        }
        Err(FlowError::failed(
            ErrorCode::DocumentLockTimeout,
            format!("could not lock {}", document_id),
        ))
    }

    pub async fn unlock_document(&self, guard: &LockGuard) {
        if let Err(e) = self.fleet.release_lock(guard).await {
            log::warn!("Failed to release lock on {}: {}", guard.resource, e);
        }
    }
}

/// One flow implementation per job kind.
#[async_trait]
pub trait Flow: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run the flow. Progress milestones go through
    /// [`FlowContext::checkpoint`]; the returned value becomes the
    /// job's output.
    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value>;
}

/// A worker: subscribes to queues and drives claimed jobs through
/// their flows.
pub struct JobWorker {
    worker_id: String,
    queues: Vec<String>,
    flows: HashMap<JobKind, Arc<dyn Flow>>,
    ctx: Arc<FlowContext>,
}

impl JobWorker {
    pub fn new(worker_id: &str, queues: Vec<String>, ctx: Arc<FlowContext>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            queues,
            flows: HashMap::new(),
            ctx,
        }
    }

    pub fn register_flow(&mut self, flow: Arc<dyn Flow>) {
        self.flows.insert(flow.kind(), flow);
    }

    /// Claim and run one job. Returns false when every subscribed
    /// queue was empty.
    pub async fn run_once(&self) -> bool {
        let queues: Vec<&str> = self.queues.iter().map(String::as_str).collect();
        let job = match self.ctx.scheduler.claim(&self.worker_id, &queues).await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                log::error!("Claim failed on {}: {}", self.worker_id, e);
                return false;
            }
        };

        self.run_job(job).await;
        true
    }

    /// Run claims until every queue drains (test and maintenance hook).
    pub async fn drain(&self) -> usize {
        let mut executed = 0;
        while self.run_once().await {
            executed += 1;
        }
        executed
    }

    async fn run_job(&self, job: Job) {
        let job_id = job.id.clone();

        // WAL bracket: inputs at start.
        let start = self
            .ctx
            .pitr
            .log_transaction(
                TransactionKind::Create,
                &format!("job:{}", job_id),
                serde_json::json!({
                    "event": "job_started",
                    "kind": job.kind,
                    "input": job.input,
                    "attempt": job.attempts,
                }),
                None,
                None,
                job.user_id.clone(),
            )
            .await;
        if let Err(e) = start {
            log::error!("WAL start entry failed for {}: {}", job_id, e);
        }

        let Some(flow) = self.flows.get(&job.kind) else {
            let _ = self
                .ctx
                .scheduler
                .fail(
                    &job_id,
                    ErrorCode::UnsupportedFormat,
                    &format!("no flow registered for {:?}", job.kind),
                )
                .await;
            return;
        };

        match flow.execute(&self.ctx, &job).await {
            Ok(output) => {
                // WAL bracket: outputs at end, then snapshot the
                // produced document.
                let _ = self
                    .ctx
                    .pitr
                    .log_transaction(
                        TransactionKind::Update,
                        &format!("job:{}", job_id),
                        serde_json::json!({ "event": "job_finished", "output": output }),
                        None,
                        None,
                        job.user_id.clone(),
                    )
                    .await;

                if let Some(document_id) = output.get("document_id").and_then(|v| v.as_str()) {
                    self.backup_document(document_id).await;
                }

                if let Err(e) = self.ctx.scheduler.complete(&job_id, output).await {
                    log::error!("Completion bookkeeping failed for {}: {}", job_id, e);
                }
            }
            Err(FlowError::Interrupted(outcome)) => {
                log::info!("Job {} interrupted: {:?}", job_id, outcome);
            }
            Err(FlowError::Failed(coded)) => {
                if let Err(e) = self
                    .ctx
                    .scheduler
                    .fail(&job_id, coded.code, &coded.message)
                    .await
                {
                    log::error!("Failure bookkeeping failed for {}: {}", job_id, e);
                }
            }
        }
    }

    /// Successful runs snapshot the produced document.
    async fn backup_document(&self, document_id: &str) {
        let content = match self.ctx.kernel.export(document_id, ExportFormat::FcStd).await {
            Ok(content) => content,
            Err(e) => {
                log::error!("Post-job export of {} failed: {}", document_id, e);
                return;
            }
        };

        match self
            .ctx
            .backup
            .create(&content, document_id, false, None, HashMap::new())
            .await
        {
            Ok(snapshot) => {
                log::info!(
                    "Post-job backup of {} stored as {}",
                    document_id,
                    snapshot.snapshot_id
                );
            }
            Err(e) => log::error!("Post-job backup of {} failed: {}", document_id, e),
        }
    }
}

//! End-to-end job lifecycle: idempotent submission and cooperative
//! cancellation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadvault::backup::{BackupConfig, BackupEngine, SnapshotIndex};
use cadvault::chunk::ChunkStore;
use cadvault::collaborators::{MockAiAdapter, MockCadKernel, MockFemSolver};
use cadvault::fleet::{FleetState, MemoryFleetState};
use cadvault::jobs::{
    FemLimits, Flow, FlowContext, FlowResult, Job, JobKind, JobScheduler, JobStatus, JobWorker,
    MemoryJobRepository, ParametricFlow, SchedulerConfig,
};
use cadvault::recovery::{PitrConfig, PointInTimeRecovery};
use cadvault::resilience::{CircuitBreaker, CircuitBreakerConfig};
use cadvault::storage::{MemoryObjectStore, ObjectStore};
use cadvault::wal::{CheckpointConfig, CheckpointManager, WalConfig, WalManager};
use tokio::sync::RwLock;

async fn flow_context(dir: &std::path::Path) -> Arc<FlowContext> {
    let fleet = Arc::new(MemoryFleetState::new());
    let scheduler = Arc::new(JobScheduler::new(
        SchedulerConfig::default(),
        Arc::new(MemoryJobRepository::new()),
        Arc::clone(&fleet) as Arc<dyn FleetState>,
    ));

    let storage = Arc::new(MemoryObjectStore::new());
    let backup = Arc::new(BackupEngine::new(
        BackupConfig::default(),
        Arc::new(ChunkStore::new()),
        Arc::clone(&storage) as Arc<dyn ObjectStore>,
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
    let checkpoints = Arc::new(
        CheckpointManager::new(CheckpointConfig {
            checkpoint_dir: dir.join("checkpoints"),
            ..Default::default()
        })
        .await
        .unwrap(),
    );

    Arc::new(FlowContext {
        scheduler,
        kernel: Arc::new(MockCadKernel::new()),
        ai: Arc::new(MockAiAdapter::new()),
        solver: Arc::new(MockFemSolver::new()),
        storage,
        backup,
        pitr: Arc::new(PointInTimeRecovery::new(PitrConfig::default(), wal, checkpoints)),
        fleet,
        ai_breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        solver_breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        storage_breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        fem_limits: FemLimits::default(),
        scratch_dir: dir.join("scratch"),
    })
}

/// Submitting the same idempotency key twice yields one job; both
/// submissions observe the same terminal record.
#[tokio::test]
async fn test_idempotent_submission_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = flow_context(dir.path()).await;

    let input = serde_json::json!({ "model": "box" });
    let first = ctx
        .scheduler
        .submit(JobKind::ParametricModel, Some("job-xyz".to_string()), input.clone(), None)
        .await
        .unwrap();
    let second = ctx
        .scheduler
        .submit(JobKind::ParametricModel, Some("job-xyz".to_string()), input, None)
        .await
        .unwrap();

    assert_eq!(first.id, "job-xyz");
    assert_eq!(second.id, "job-xyz");
    assert_eq!(first.status, JobStatus::Pending);

    let mut worker = JobWorker::new("w1", vec!["models.params".to_string()], Arc::clone(&ctx));
    worker.register_flow(Arc::new(ParametricFlow));
    assert!(worker.run_once().await);
    // The duplicate submission queued no second unit of work.
    assert!(!worker.run_once().await);

    let via_first = ctx.scheduler.query(&first.id).await.unwrap().unwrap();
    let via_second = ctx.scheduler.query(&second.id).await.unwrap().unwrap();
    assert_eq!(via_first.status, JobStatus::Completed);
    assert_eq!(via_first.status, via_second.status);
    assert_eq!(via_first.output, via_second.output);
}

/// A deliberately slow simulation flow that checkpoints through its
/// progress milestones.
struct SlowSimulationFlow;

#[async_trait]
impl Flow for SlowSimulationFlow {
    fn kind(&self) -> JobKind {
        JobKind::FemSimulation
    }

    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value> {
        for progress in [10u8, 25, 40, 60, 85, 95] {
            ctx.checkpoint(&job.id, progress).await?;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        ctx.checkpoint(&job.id, 99).await?;
        Ok(serde_json::json!({ "document_id": "sim-done" }))
    }
}

/// Cooperative cancel: the flag is set immediately, the job exits at
/// its next checkpoint with the caller's reason.
#[tokio::test]
async fn test_cooperative_cancel_mid_flight() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = flow_context(dir.path()).await;

    let mut worker = JobWorker::new("w1", vec!["sim.fem".to_string()], Arc::clone(&ctx));
    worker.register_flow(Arc::new(SlowSimulationFlow));

    let job = ctx
        .scheduler
        .submit(JobKind::FemSimulation, None, serde_json::json!({}), None)
        .await
        .unwrap();

    let worker = Arc::new(worker);
    let background = Arc::clone(&worker);
    let run = tokio::spawn(async move { background.run_once().await });

    // Wait until the job has made real progress.
    let mut progressed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let current = ctx.scheduler.query(&job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Running && current.progress >= 40 {
            progressed = true;
            break;
        }
    }
    assert!(progressed, "job never reached 40% while running");

    let acknowledged = ctx.scheduler.cancel(&job.id, "user_abort").await.unwrap();
    assert!(acknowledged.cancel_requested);

    run.await.unwrap();
    let finished = ctx.scheduler.query(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Cancelled);
    assert_eq!(finished.cancellation_reason.as_deref(), Some("user_abort"));
    // Progress froze at the last checkpoint before the cancel landed.
    assert!(finished.progress < 100);
}

/// Completed jobs observed through the scheduler expose the status
/// wire shape the API layer serves.
#[tokio::test]
async fn test_status_wire_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = flow_context(dir.path()).await;

    let mut worker = JobWorker::new("w1", vec!["models.params".to_string()], Arc::clone(&ctx));
    worker.register_flow(Arc::new(ParametricFlow));

    let job = ctx
        .scheduler
        .submit(
            JobKind::ParametricModel,
            None,
            serde_json::json!({ "model": "cylinder" }),
            None,
        )
        .await
        .unwrap();
    worker.run_once().await;

    let finished = ctx.scheduler.query(&job.id).await.unwrap().unwrap();
    let wire = finished.status_wire();

    assert_eq!(wire["id"], job.id.as_str());
    assert_eq!(wire["status"], "completed");
    assert_eq!(wire["progress"], 100);
    assert!(wire["started_at"].is_string());
    assert!(wire["finished_at"].is_string());
    assert!(wire["output"]["document_id"].is_string());
}

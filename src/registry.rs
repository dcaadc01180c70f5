//! Process-lifetime service registry
//!
//! All long-lived services are constructed once at startup and injected
//! into worker tasks through this registry; nothing is reached through
//! module-level globals.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backup::{
    BackupConfig, BackupEngine, LifecycleManager, RetentionRegistry, SnapshotIndex, TransitionRule,
};
use crate::chunk::ChunkStore;
use crate::collaborators::{
    AiAdapter, CadKernel, FemSolver, MockAiAdapter, MockCadKernel, MockFemSolver,
};
use crate::config::EnvironmentConfig;
use crate::fleet::{FleetState, MemoryFleetState, RedisFleetConfig, RedisFleetState};
use crate::jobs::{
    AssemblyFlow, FemFlow, FemLimits, FlowContext, JobScheduler, JobWorker, MemoryJobRepository,
    ParametricFlow, PromptFlow, SchedulerConfig, UploadFlow,
};
use crate::recovery::{
    DisasterRecoveryOrchestrator, DrConfig, HealthMonitor, HealthMonitorConfig,
    ModelRecoveryService, NotificationManager, PitrConfig, PointInTimeRecovery,
    RecoveryActionHandler, WebhookDelivery,
};
use crate::storage::{MemoryObjectStore, ObjectStore, S3Config, S3ObjectStore};
use crate::wal::{CheckpointConfig, CheckpointManager, WalConfig, WalManager};

/// Registry construction errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Storage setup failed: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("WAL setup failed: {0}")]
    Wal(#[from] crate::wal::WalError),

    #[error("Fleet state setup failed: {0}")]
    Fleet(#[from] crate::fleet::FleetError),
}

/// Everything a worker process needs, wired once at startup.
pub struct ServiceRegistry {
    pub config: EnvironmentConfig,
    pub object_store: Arc<dyn ObjectStore>,
    pub chunk_store: Arc<ChunkStore>,
    pub backup: Arc<BackupEngine>,
    pub lifecycle: Arc<LifecycleManager>,
    pub retention: Arc<RwLock<RetentionRegistry>>,
    pub wal: Arc<WalManager>,
    pub checkpoints: Arc<CheckpointManager>,
    pub pitr: Arc<PointInTimeRecovery>,
    pub health: Arc<HealthMonitor>,
    pub orchestrator: Arc<DisasterRecoveryOrchestrator>,
    pub model_recovery: Arc<ModelRecoveryService>,
    pub scheduler: Arc<JobScheduler>,
    pub fleet: Arc<dyn FleetState>,
    pub kernel: Arc<dyn CadKernel>,
    pub ai: Arc<dyn AiAdapter>,
    pub solver: Arc<dyn FemSolver>,
    pub flow_context: Arc<FlowContext>,
}

impl ServiceRegistry {
    /// Wire the full service graph. Dev mode runs against in-memory
    /// storage/fleet and mock collaborators; production wiring swaps in
    /// S3, Redis and the real collaborator transports.
    pub async fn bootstrap(config: EnvironmentConfig) -> Result<Self, RegistryError> {
        let object_store: Arc<dyn ObjectStore> = if config.mode.is_production() {
            Arc::new(S3ObjectStore::new(S3Config {
                region: config.storage.region.clone(),
                access_key: config.storage.access_key.clone(),
                secret_key: config.storage.secret_key.clone(),
                endpoint: config.storage.endpoint.clone(),
                use_path_style: config.storage.use_path_style,
                request_timeout_secs: 60,
            })?)
        } else {
            Arc::new(MemoryObjectStore::new())
        };

        let chunk_store = Arc::new(ChunkStore::new());
        let snapshot_index = Arc::new(RwLock::new(SnapshotIndex::new()));
        let retention = Arc::new(RwLock::new(RetentionRegistry::new()));

        let backup = Arc::new(BackupEngine::new(
            BackupConfig::default(),
            Arc::clone(&chunk_store),
            Arc::clone(&object_store),
            Arc::clone(&snapshot_index),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            TransitionRule::defaults(),
            snapshot_index,
            Arc::clone(&chunk_store),
            Arc::clone(&object_store),
            Arc::clone(&retention),
        ));

        let wal = Arc::new(WalManager::new(WalConfig::default()).await?);
        let checkpoints = Arc::new(CheckpointManager::new(CheckpointConfig::default()).await?);
        let pitr = Arc::new(PointInTimeRecovery::new(
            PitrConfig::default(),
            Arc::clone(&wal),
            Arc::clone(&checkpoints),
        ));

        let health = Arc::new(HealthMonitor::new(HealthMonitorConfig::default()));
        let mut notifications = NotificationManager::new(&config.worker_id);
        notifications.add_delivery(Box::new(WebhookDelivery::new(Vec::new())));
        let orchestrator = Arc::new(DisasterRecoveryOrchestrator::new(
            DrConfig::default(),
            Arc::clone(&health),
            Arc::new(notifications),
        ));

        // Collaborator seams. Mock transports stand in outside
        // production; the production kernel/AI/solver adapters attach
        // at deployment.
        let kernel: Arc<dyn CadKernel> = Arc::new(MockCadKernel::new());
        let ai: Arc<dyn AiAdapter> = Arc::new(MockAiAdapter::new());
        let solver: Arc<dyn FemSolver> = Arc::new(MockFemSolver::new());

        let model_recovery = Arc::new(ModelRecoveryService::new(
            Arc::clone(&kernel),
            Arc::clone(&backup),
            Arc::clone(&wal),
        ));
        orchestrator
            .set_action_handler(Arc::clone(&model_recovery) as Arc<dyn RecoveryActionHandler>)
            .await;

        // Fleet coordination backs the distributed document locks; a
        // production fleet must share it through Redis.
        let fleet: Arc<dyn FleetState> = if config.mode.is_production() {
            Arc::new(
                RedisFleetState::connect(RedisFleetConfig {
                    url: config.redis_url.clone(),
                    ..Default::default()
                })
                .await?,
            )
        } else {
            Arc::new(MemoryFleetState::new())
        };
        let scheduler = Arc::new(JobScheduler::new(
            SchedulerConfig::default(),
            Arc::new(MemoryJobRepository::new()),
            Arc::clone(&fleet),
        ));

        let flow_context = Arc::new(FlowContext {
            scheduler: Arc::clone(&scheduler),
            kernel: Arc::clone(&kernel),
            ai: Arc::clone(&ai),
            solver: Arc::clone(&solver),
            storage: Arc::clone(&object_store),
            backup: Arc::clone(&backup),
            pitr: Arc::clone(&pitr),
            fleet: Arc::clone(&fleet),
            ai_breaker: Arc::new(crate::resilience::CircuitBreaker::new(Default::default())),
            solver_breaker: Arc::new(crate::resilience::CircuitBreaker::new(Default::default())),
            storage_breaker: Arc::new(crate::resilience::CircuitBreaker::new(Default::default())),
            fem_limits: FemLimits::default(),
            scratch_dir: std::env::temp_dir().join("cadvault-decks"),
        });

        Ok(Self {
            config,
            object_store,
            chunk_store,
            backup,
            lifecycle,
            retention,
            wal,
            checkpoints,
            pitr,
            health,
            orchestrator,
            model_recovery,
            scheduler,
            fleet,
            kernel,
            ai,
            solver,
            flow_context,
        })
    }

    /// A worker wired with every flow, subscribed to every queue.
    pub fn spawn_worker(&self, worker_id: &str) -> JobWorker {
        let queues = crate::jobs::JobKind::all_queues()
            .into_iter()
            .map(String::from)
            .collect();

        let mut worker = JobWorker::new(worker_id, queues, Arc::clone(&self.flow_context));
        worker.register_flow(Arc::new(PromptFlow));
        worker.register_flow(Arc::new(ParametricFlow));
        worker.register_flow(Arc::new(UploadFlow));
        worker.register_flow(Arc::new(AssemblyFlow));
        worker.register_flow(Arc::new(FemFlow));
        worker
    }
}

//! Job model and lifecycle state machine

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ErrorCode;

/// Job errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {0} is terminal; only metrics may change")]
    TerminalJob(String),

    #[error("Progress may not decrease: {current} -> {requested}")]
    ProgressDecreased { current: u8, requested: u8 },
}

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Flow kinds, each routed to a logical queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// AI-driven model generation
    PromptModel,
    /// Parametric modeling from a template
    ParametricModel,
    /// Upload normalization and conversion
    UploadNormalization,
    /// Assembly composition
    Assembly,
    /// FEM simulation
    FemSimulation,
    /// Fleet-wide maintenance tasks
    Maintenance,
    /// Generic model work
    Generic,
}

impl JobKind {
    /// Logical routing key for this kind.
    pub fn queue(&self) -> &'static str {
        match self {
            JobKind::PromptModel => "models.prompt",
            JobKind::ParametricModel => "models.params",
            JobKind::UploadNormalization => "models.upload",
            JobKind::Assembly => "assemblies.a4",
            JobKind::FemSimulation => "sim.fem",
            JobKind::Maintenance => "maintenance",
            JobKind::Generic => "model",
        }
    }

    /// Every queue a worker may subscribe to.
    pub fn all_queues() -> Vec<&'static str> {
        vec![
            "models.prompt",
            "models.params",
            "models.upload",
            "assemblies.a4",
            "sim.fem",
            "model",
            "maintenance",
            "default",
        ]
    }
}

/// Job status; transitions form a DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// Job priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// A unit of asynchronous work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Client-supplied idempotency key or server-generated id
    pub id: String,
    pub user_id: Option<String>,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Set when a worker claims the job
    pub task_id: Option<String>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    /// 0-100, non-decreasing while running
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub timeout_secs: u64,
    pub metrics: HashMap<String, serde_json::Value>,
}

impl Job {
    pub fn new(kind: JobKind, idempotency_key: Option<String>, input: serde_json::Value) -> Self {
        Self {
            id: idempotency_key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: None,
            kind,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            task_id: None,
            input,
            output: None,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            attempts: 0,
            cancel_requested: false,
            cancel_requested_at: None,
            cancellation_reason: None,
            timeout_secs: 3600,
            metrics: HashMap::new(),
        }
    }

    /// Terminal: completed, cancelled, timeout, or failed with retries
    /// exhausted.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Timeout => true,
            JobStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Whether the running job has outlived its timeout budget.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => {
                now - started > Duration::seconds(self.timeout_secs as i64)
            }
            _ => false,
        }
    }

    fn guard_transition(&self, to: JobStatus) -> JobResult<()> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Timeout)
        ) || (self.status == JobStatus::Failed && to == JobStatus::Running && self.can_retry());

        if allowed {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    /// pending -> running (claim) or failed -> running (retry).
    pub fn set_running(&mut self, task_id: &str) -> JobResult<()> {
        self.guard_transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.task_id = Some(task_id.to_string());
        self.started_at = Some(Utc::now());
        self.attempts += 1;
        self.progress = 0;
        Ok(())
    }

    pub fn set_completed(&mut self, output: serde_json::Value) -> JobResult<()> {
        self.guard_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.progress = 100;
        self.output = Some(output);
        Ok(())
    }

    pub fn set_failed(&mut self, code: ErrorCode, message: &str) -> JobResult<()> {
        self.guard_transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error_code = Some(code);
        self.error_message = Some(message.to_string());
        self.retry_count += 1;
        Ok(())
    }

    pub fn set_cancelled(&mut self, reason: &str) -> JobResult<()> {
        self.guard_transition(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        self.cancellation_reason = Some(reason.to_string());
        self.error_code = Some(ErrorCode::Cancelled);
        Ok(())
    }

    pub fn set_timeout(&mut self) -> JobResult<()> {
        self.guard_transition(JobStatus::Timeout)?;
        self.status = JobStatus::Timeout;
        self.finished_at = Some(Utc::now());
        self.error_code = Some(ErrorCode::Timeout);
        self.error_message = Some(format!("exceeded {} seconds", self.timeout_secs));
        Ok(())
    }

    /// Progress is non-decreasing and only moves while running.
    pub fn update_progress(&mut self, progress: u8) -> JobResult<()> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        if progress < self.progress {
            return Err(JobError::ProgressDecreased {
                current: self.progress,
                requested: progress,
            });
        }
        self.progress = progress.min(100);
        Ok(())
    }

    /// Metrics stay mutable after terminal status; nothing else does.
    pub fn record_metric(&mut self, key: &str, value: serde_json::Value) {
        self.metrics.insert(key.to_string(), value);
    }

    /// The job-status wire form served back to the API layer.
    pub fn status_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "kind": self.kind,
            "status": self.status,
            "progress": self.progress,
            "created_at": self.created_at,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "error_code": self.error_code,
            "error_message": self.error_message,
            "output": self.output,
            "metrics": self.metrics,
        })
    }
}

/// Swappable persistence seam for jobs (in-memory here, SQL in a full
/// deployment).
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: Job) -> JobResult<()>;

    async fn get(&self, job_id: &str) -> JobResult<Option<Job>>;

    async fn update(&self, job: &Job) -> JobResult<()>;

    async fn list_by_status(&self, status: Option<JobStatus>) -> JobResult<Vec<Job>>;
}

/// In-memory job repository.
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert(&self, job: Job) -> JobResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> JobResult<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn update(&self, job: &Job) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(JobError::JobNotFound(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn list_by_status(&self, status: Option<JobStatus>) -> JobResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobKind::ParametricModel, None, serde_json::json!({}))
    }

    #[test]
    fn test_queue_routing() {
        assert_eq!(JobKind::PromptModel.queue(), "models.prompt");
        assert_eq!(JobKind::FemSimulation.queue(), "sim.fem");
        assert_eq!(JobKind::Assembly.queue(), "assemblies.a4");
        assert_eq!(JobKind::Generic.queue(), "model");
        assert!(JobKind::all_queues().contains(&"default"));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        assert_eq!(job.status, JobStatus::Pending);

        job.set_running("task-1").unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        job.update_progress(40).unwrap();
        job.set_completed(serde_json::json!({"artefact": "a.step"})).unwrap();
        assert_eq!(job.progress, 100);
        assert!(job.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut job = job();
        assert!(job.set_completed(serde_json::json!({})).is_err());

        job.set_running("t").unwrap();
        job.set_completed(serde_json::json!({})).unwrap();

        // Terminal: nothing moves.
        assert!(job.set_running("t2").is_err());
        assert!(job.set_failed(ErrorCode::Internal, "late").is_err());
        assert!(job.set_cancelled("late").is_err());
    }

    #[test]
    fn test_retry_loop_until_exhausted() {
        let mut job = job();
        job.max_retries = 2;

        job.set_running("t1").unwrap();
        job.set_failed(ErrorCode::StorageUnreachable, "blip").unwrap();
        assert!(job.can_retry());
        assert!(!job.is_terminal());

        job.set_running("t2").unwrap();
        job.set_failed(ErrorCode::StorageUnreachable, "blip").unwrap();
        assert!(!job.can_retry());
        assert!(job.is_terminal());
        assert!(job.set_running("t3").is_err());
    }

    #[test]
    fn test_progress_monotonic() {
        let mut job = job();
        job.set_running("t").unwrap();

        job.update_progress(30).unwrap();
        job.update_progress(30).unwrap();
        assert!(matches!(
            job.update_progress(20),
            Err(JobError::ProgressDecreased { .. })
        ));
        job.update_progress(95).unwrap();
        assert_eq!(job.progress, 95);
    }

    #[test]
    fn test_metrics_mutable_after_terminal() {
        let mut job = job();
        job.set_running("t").unwrap();
        job.set_completed(serde_json::json!({})).unwrap();

        job.record_metric("wall_seconds", serde_json::json!(12.5));
        assert_eq!(job.metrics.len(), 1);
    }

    #[test]
    fn test_timeout_detection() {
        let mut job = job();
        job.timeout_secs = 10;
        job.set_running("t").unwrap();

        assert!(!job.is_timed_out(Utc::now()));
        assert!(job.is_timed_out(Utc::now() + Duration::seconds(11)));
    }

    #[test]
    fn test_status_wire_shape() {
        let mut job = job();
        job.set_running("t").unwrap();
        job.update_progress(45).unwrap();

        let wire = job.status_wire();
        assert_eq!(wire["status"], "running");
        assert_eq!(wire["progress"], 45);
        assert!(wire["error_code"].is_null());
    }
}

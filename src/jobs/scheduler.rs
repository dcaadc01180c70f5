//! Job scheduler: submission idempotency, queue routing, claims,
//! cooperative cancellation and sweeps

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::ErrorCode;
use crate::fleet::{state_key, FleetState};

use super::job::{Job, JobError, JobKind, JobRepository, JobResult, JobStatus};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cooperative cancel window; the sweep force-cancels past it
    pub force_cancel_after: chrono::Duration,
    /// TTL on fleet-state job registrations
    pub registration_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            force_cancel_after: chrono::Duration::seconds(300),
            registration_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// What a worker should do after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Keep executing
    Continue,
    /// Cancel was requested; the job is now cancelled
    Cancelled,
    /// The timeout budget ran out; the job is now timed out
    TimedOut,
}

/// Orchestrates job submission, claiming and lifecycle over the fleet.
pub struct JobScheduler {
    config: SchedulerConfig,
    repo: Arc<dyn JobRepository>,
    fleet: Arc<dyn FleetState>,
    queues: RwLock<HashMap<String, VecDeque<String>>>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        repo: Arc<dyn JobRepository>,
        fleet: Arc<dyn FleetState>,
    ) -> Self {
        Self {
            config,
            repo,
            fleet,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Submit a job. A duplicate idempotency key returns the existing
    /// job without creating new work.
    pub async fn submit(
        &self,
        kind: JobKind,
        idempotency_key: Option<String>,
        input: serde_json::Value,
        user_id: Option<String>,
    ) -> JobResult<Job> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.repo.get(key).await? {
                log::debug!("Duplicate submission for {}, returning existing job", key);
                return Ok(existing);
            }
        }

        let mut job = Job::new(kind, idempotency_key, input);
        job.user_id = user_id;

        self.repo.insert(job.clone()).await?;
        self.queues
            .write()
            .await
            .entry(kind.queue().to_string())
            .or_default()
            .push_back(job.id.clone());

        let _ = self
            .fleet
            .put(
                &state_key("jobs", "active", Some(&job.id)),
                "pending",
                self.config.registration_ttl,
            )
            .await;

        log::info!("Job {} submitted to {} ({:?})", job.id, kind.queue(), kind);
        Ok(job)
    }

    /// Full job record.
    pub async fn query(&self, job_id: &str) -> JobResult<Option<Job>> {
        self.repo.get(job_id).await
    }

    /// Claim the next available job from the given queues.
    ///
    /// The claim is idempotent in the idempotency key: a queue entry
    /// whose job is already past pending (a duplicate claim) is
    /// silently skipped.
    pub async fn claim(&self, worker_id: &str, queues: &[&str]) -> JobResult<Option<Job>> {
        loop {
            let candidate = {
                let mut table = self.queues.write().await;
                let mut found = None;
                for queue in queues {
                    if let Some(entries) = table.get_mut(*queue) {
                        if let Some(job_id) = entries.pop_front() {
                            found = Some(job_id);
                            break;
                        }
                    }
                }
                found
            };

            let Some(job_id) = candidate else {
                return Ok(None);
            };

            let Some(mut job) = self.repo.get(&job_id).await? else {
                continue;
            };

            match job.status {
                JobStatus::Pending => {}
                JobStatus::Failed if job.can_retry() => {}
                _ => continue, // duplicate or stale entry
            }

            let task_id = format!("task_{}_{}", worker_id, uuid::Uuid::new_v4().simple());
            job.set_running(&task_id)?;
            self.repo.update(&job).await?;

            log::info!("Job {} claimed by {} as {}", job.id, worker_id, task_id);
            return Ok(Some(job));
        }
    }

    /// Cooperative cancel: flag the job and let the worker notice at
    /// its next checkpoint. Pending jobs cancel immediately.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> JobResult<Job> {
        let mut job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;

        match job.status {
            JobStatus::Pending => {
                job.set_cancelled(reason)?;
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                job.cancel_requested_at = Some(Utc::now());
                job.cancellation_reason = Some(reason.to_string());

                let _ = self
                    .fleet
                    .put(
                        &state_key("jobs", "cancel", Some(job_id)),
                        reason,
                        Duration::from_secs(3600),
                    )
                    .await;
            }
            // Terminal states acknowledge without changing anything.
            _ => return Ok(job),
        }

        self.repo.update(&job).await?;
        log::info!("Cancel requested for {}: {}", job_id, reason);
        Ok(job)
    }

    /// Worker checkpoint: polls the cancel flag, enforces the timeout
    /// budget, and records progress.
    pub async fn checkpoint(&self, job_id: &str, progress: u8) -> JobResult<CheckpointOutcome> {
        let mut job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Running {
            return Ok(match job.status {
                JobStatus::Cancelled => CheckpointOutcome::Cancelled,
                JobStatus::Timeout => CheckpointOutcome::TimedOut,
                _ => CheckpointOutcome::Continue,
            });
        }

        let fleet_flag = self
            .fleet
            .get(&state_key("jobs", "cancel", Some(job_id)))
            .await
            .ok()
            .flatten();

        if job.cancel_requested || fleet_flag.is_some() {
            let reason = job
                .cancellation_reason
                .clone()
                .or(fleet_flag)
                .unwrap_or_else(|| "cancelled".to_string());
            job.set_cancelled(&reason)?;
            self.repo.update(&job).await?;
            log::info!("Job {} cancelled at checkpoint ({}%)", job_id, progress);
            return Ok(CheckpointOutcome::Cancelled);
        }

        if job.is_timed_out(Utc::now()) {
            job.set_timeout()?;
            self.repo.update(&job).await?;
            log::warn!("Job {} timed out at checkpoint", job_id);
            return Ok(CheckpointOutcome::TimedOut);
        }

        // Progress never decreases; concurrent checkpoints keep the max.
        if progress > job.progress {
            job.update_progress(progress)?;
        }
        self.repo.update(&job).await?;
        Ok(CheckpointOutcome::Continue)
    }

    /// Successful completion.
    pub async fn complete(&self, job_id: &str, output: serde_json::Value) -> JobResult<Job> {
        let mut job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;

        job.set_completed(output)?;
        self.repo.update(&job).await?;
        let _ = self
            .fleet
            .delete(&state_key("jobs", "active", Some(job_id)))
            .await;

        log::info!("Job {} completed", job_id);
        Ok(job)
    }

    /// Failure path. Retryable codes requeue the job while retries
    /// remain; non-retryable codes exhaust the retry budget.
    pub async fn fail(&self, job_id: &str, code: ErrorCode, message: &str) -> JobResult<Job> {
        let mut job = self
            .repo
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;

        job.set_failed(code, message)?;
        if !code.is_retryable() {
            job.retry_count = job.max_retries;
        }
        self.repo.update(&job).await?;

        if job.can_retry() {
            self.queues
                .write()
                .await
                .entry(job.kind.queue().to_string())
                .or_default()
                .push_back(job.id.clone());
            log::warn!(
                "Job {} failed ({}), retry {}/{} queued",
                job_id,
                code,
                job.retry_count,
                job.max_retries
            );
        } else {
            log::error!("Job {} failed terminally: {} ({})", job_id, message, code);
        }
        Ok(job)
    }

    /// Force-cancel any job whose cooperative cancel has been pending
    /// longer than the configured window while still running.
    pub async fn force_cancel_sweep(&self) -> JobResult<u64> {
        let now = Utc::now();
        let mut forced = 0;

        for mut job in self.repo.list_by_status(Some(JobStatus::Running)).await? {
            let Some(requested_at) = job.cancel_requested_at else {
                continue;
            };
            if job.cancel_requested && now - requested_at > self.config.force_cancel_after {
                let reason = job
                    .cancellation_reason
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string());
                job.set_cancelled(&reason)?;
                self.repo.update(&job).await?;
                forced += 1;
                log::warn!("Job {} force-cancelled after cooperative window", job.id);
            }
        }
        Ok(forced)
    }

    /// Number of entries waiting in a queue (test hook).
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.queues
            .read()
            .await
            .get(queue)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

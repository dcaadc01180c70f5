//! Job scheduling and lifecycle management
//!
//! This module provides:
//!
//! ## Scheduler
//! - Idempotent submission (duplicate keys return the existing job)
//! - Logical queue routing per flow kind
//! - Idempotent claims, cooperative cancellation, force-cancel sweep
//! - Retry policy: transient codes retry with backoff, logical errors
//!   fail terminally
//!
//! ## Workers and flows
//! - Worker loop bracketing every job with WAL entries
//! - Post-success backup of the produced document
//! - Flow implementations for prompt, parametric, upload, assembly and
//!   FEM work
//!
//! ## Script policy
//! - Structural security validation of generated modeling scripts

pub mod flows;
pub mod job;
pub mod scheduler;
pub mod script_policy;
pub mod worker;

pub use flows::{
    AnalysisType, AssemblyFlow, FemFlow, ParametricFlow, PromptFlow, UploadFlow, UploadFormat,
};
pub use job::{
    Job, JobError, JobKind, JobPriority, JobRepository, JobResult, JobStatus, MemoryJobRepository,
};
pub use scheduler::{CheckpointOutcome, JobScheduler, SchedulerConfig};
pub use script_policy::{validate_script, ScriptPolicyError};
pub use worker::{FemLimits, Flow, FlowContext, FlowError, FlowResult, JobWorker};

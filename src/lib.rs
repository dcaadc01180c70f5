//! # CADVAULT - CAD-as-a-Service Resilience Core
//!
//! Backup, recovery and job orchestration for a CAD-as-a-Service
//! platform, built in Rust.
//!
//! ## Architecture
//!
//! - `storage`: tiered, S3-compatible object storage abstraction
//! - `chunk`: content-defined chunking and deduplicating chunk store
//! - `backup`: snapshot engine, compression, encryption, lifecycle
//! - `wal`: write-ahead log and checkpoint manager
//! - `recovery`: point-in-time recovery, disaster orchestration, CAD
//!   model repair
//! - `jobs`: scheduler, worker loop and compute flows
//! - `fleet`: cross-worker shared state and pub/sub
//! - `collaborators`: CAD kernel, AI provider and FEM solver seams
//! - `resilience`: circuit breakers and retry backoff
//! - `config`: environment configuration and startup validation
//! - `registry`: process-lifetime service wiring

#![warn(clippy::all)]

// Stable error codes
pub mod error;

// Environment configuration
pub mod config;

// Object storage abstraction
pub mod storage;

// Chunk store and deduplication
pub mod chunk;

// Backup engine and lifecycle
pub mod backup;

// Write-ahead log and checkpoints
pub mod wal;

// Recovery engines
pub mod recovery;

// Job scheduling and flows
pub mod jobs;

// Fleet coordination
pub mod fleet;

// External collaborator seams
pub mod collaborators;

// Resilience primitives
pub mod resilience;

// Service wiring
pub mod registry;

// Re-export commonly used types
pub use backup::{BackupEngine, Snapshot, SnapshotKind};
pub use error::{CodedError, ErrorCode};
pub use jobs::{Job, JobKind, JobScheduler, JobStatus};
pub use recovery::{DisasterRecoveryOrchestrator, PointInTimeRecovery};
pub use registry::ServiceRegistry;
pub use storage::{ObjectStore, StorageTier};
pub use wal::WalManager;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

//! Backup engine with deduplication and multi-tier lifecycle
//!
//! This module provides:
//!
//! ## Snapshots
//! - Full, incremental, differential and synthetic snapshots
//! - Per-source snapshot chains with bounded length
//! - Deduplicated storage through the content-addressed chunk store
//!
//! ## At-rest protection
//! - Compression with automatic algorithm selection (zstd preferred)
//! - Authenticated encryption (AES-256-GCM or ChaCha20-Poly1305)
//!
//! ## Lifecycle
//! - Age-driven tier transitions (hot -> warm -> cold -> glacier)
//! - Retention policies: time-based, version-based, legal hold and
//!   compliance (immutable once applied)

pub mod compression;
pub mod delta;
pub mod encryption;
pub mod engine;
pub mod lifecycle;
pub mod retention;
pub mod snapshot;

pub use compression::CompressionAlgorithm;
pub use encryption::{EncryptionConfig, EncryptionMethod};
pub use engine::{BackupConfig, BackupEngine, BackupError, BackupResult};
pub use lifecycle::{LifecycleManager, LifecycleReport, TransitionRule};
pub use retention::{RetentionError, RetentionPolicy, RetentionRegistry};
pub use snapshot::{Snapshot, SnapshotIndex, SnapshotIntegrity, SnapshotKind};

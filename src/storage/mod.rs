//! Object storage abstraction
//!
//! This module provides a unified interface for the platform's byte sink:
//!
//! ## Object store
//! - Polymorphic `ObjectStore` trait (put/get/delete/move/list/presign)
//! - S3-compatible implementation (AWS S3 and MinIO) with SigV4 signing,
//!   multipart uploads and retry with exponential backoff
//! - In-memory implementation for tests
//!
//! ## Tiering
//! - One physical bucket per storage tier (hot/warm/cold/glacier)
//! - Reads probe tiers in order; tier moves are copy-then-delete
//!
//! ## Keys and metadata
//! - Canonical object key layout for artefacts, logs, snapshots and WAL
//! - Content-type and content-disposition defaults per extension

pub mod keys;
pub mod object_store;
pub mod s3;

pub use keys::{content_disposition_for, content_type_for, ObjectKey};
pub use object_store::{
    clamp_presign_expiry, MemoryObjectStore, ObjectMetadata, ObjectStore, PresignOperation,
    PutResult, StorageError, StorageResult, StorageTier,
};
pub use s3::{S3Config, S3ObjectStore};

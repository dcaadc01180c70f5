//! Stable error codes shared across subsystems
//!
//! Every failure surfaced to a submitter or recorded on a job carries one of
//! these machine-readable codes. Human-readable messages may be localized;
//! the code is the contract.

use serde::{Deserialize, Serialize};

/// Machine-readable error code attached to job failures, disaster events
/// and recovery results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Input errors
    ValidationFailed,
    UnsupportedFormat,
    InvalidParameters,

    // Security violations
    SecurityViolation,
    ForbiddenImport,

    // Transient infrastructure
    StorageUnreachable,
    FleetStateTimeout,
    AiProviderTimeout,
    AiRateLimited,
    DocumentLockTimeout,

    // External collaborator failures
    AiMalformedResponse,
    SolverNonConvergence,
    SolverFailed,
    GeometryInvalid,

    // Integrity failures
    ChunkChecksumMismatch,
    WalChecksumMismatch,
    SnapshotCorrupted,

    // Resource errors
    ResourceLimitExceeded,
    ObjectTooLarge,

    // Generic
    NotFound,
    AccessDenied,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorCode {
    /// Whether a failure with this code may be retried by the scheduler.
    ///
    /// Only transient infrastructure failures retry; logical errors,
    /// security violations and collaborator protocol failures do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::StorageUnreachable
                | ErrorCode::FleetStateTimeout
                | ErrorCode::AiProviderTimeout
                | ErrorCode::AiRateLimited
                | ErrorCode::DocumentLockTimeout
        )
    }

    /// Stable string form used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::UnsupportedFormat => "unsupported_format",
            ErrorCode::InvalidParameters => "invalid_parameters",
            ErrorCode::SecurityViolation => "security_violation",
            ErrorCode::ForbiddenImport => "forbidden_import",
            ErrorCode::StorageUnreachable => "storage_unreachable",
            ErrorCode::FleetStateTimeout => "fleet_state_timeout",
            ErrorCode::AiProviderTimeout => "ai_provider_timeout",
            ErrorCode::AiRateLimited => "ai_rate_limited",
            ErrorCode::DocumentLockTimeout => "document_lock_timeout",
            ErrorCode::AiMalformedResponse => "ai_malformed_response",
            ErrorCode::SolverNonConvergence => "solver_non_convergence",
            ErrorCode::SolverFailed => "solver_failed",
            ErrorCode::GeometryInvalid => "geometry_invalid",
            ErrorCode::ChunkChecksumMismatch => "chunk_checksum_mismatch",
            ErrorCode::WalChecksumMismatch => "wal_checksum_mismatch",
            ErrorCode::SnapshotCorrupted => "snapshot_corrupted",
            ErrorCode::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorCode::ObjectTooLarge => "object_too_large",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded failure: the stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedError {
    pub code: ErrorCode,
    pub message: String,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CodedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CodedError {}

//! Retention policies for snapshots
//!
//! Four kinds: time-based expiry, version-based keep-last-K, legal hold
//! until an absolute timestamp, and compliance mode. Compliance policies
//! are immutable once applied: retention can be extended, never shortened,
//! and never removed.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retention errors
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Compliance violation on policy {0}: retention cannot be shortened or removed")]
    ComplianceViolation(String),

    #[error("Policy already exists: {0}")]
    PolicyExists(String),
}

/// Result type for retention operations
pub type RetentionResult<T> = Result<T, RetentionError>;

/// Retention policy kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete snapshots older than `days`
    TimeBased { days: i64 },
    /// Keep the last `keep_last` snapshots per source
    VersionBased { keep_last: usize },
    /// Snapshots cannot expire before this timestamp
    LegalHold { until: DateTime<Utc> },
    /// Immutable once applied; retention may only be extended
    Compliance { retain_until: DateTime<Utc> },
}

impl RetentionPolicy {
    /// Whether a snapshot created at `created_at` may expire at `now`.
    /// Version-based policies are evaluated by the lifecycle sweep with
    /// chain context; standalone they never expire a snapshot.
    pub fn allows_expiry(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RetentionPolicy::TimeBased { days } => now - created_at > Duration::days(*days),
            RetentionPolicy::VersionBased { .. } => false,
            RetentionPolicy::LegalHold { until } => now >= *until,
            RetentionPolicy::Compliance { retain_until } => now >= *retain_until,
        }
    }
}

/// Named retention policies attached to snapshots by name.
#[derive(Default)]
pub struct RetentionRegistry {
    policies: HashMap<String, RetentionPolicy>,
}

impl RetentionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, policy: RetentionPolicy) -> RetentionResult<()> {
        if self.policies.contains_key(name) {
            return Err(RetentionError::PolicyExists(name.to_string()));
        }
        self.policies.insert(name.to_string(), policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RetentionPolicy> {
        self.policies.get(name)
    }

    /// Update a policy. Compliance policies accept only extensions of
    /// their `retain_until`; any other mutation is rejected.
    pub fn update(&mut self, name: &str, updated: RetentionPolicy) -> RetentionResult<()> {
        let current = self
            .policies
            .get(name)
            .ok_or_else(|| RetentionError::PolicyNotFound(name.to_string()))?;

        if let RetentionPolicy::Compliance { retain_until } = current {
            match &updated {
                RetentionPolicy::Compliance {
                    retain_until: new_until,
                } if new_until >= retain_until => {}
                _ => return Err(RetentionError::ComplianceViolation(name.to_string())),
            }
        }

        self.policies.insert(name.to_string(), updated);
        Ok(())
    }

    /// Remove a policy. Compliance policies cannot be removed.
    pub fn remove(&mut self, name: &str) -> RetentionResult<RetentionPolicy> {
        if matches!(
            self.policies.get(name),
            Some(RetentionPolicy::Compliance { .. })
        ) {
            return Err(RetentionError::ComplianceViolation(name.to_string()));
        }
        self.policies
            .remove(name)
            .ok_or_else(|| RetentionError::PolicyNotFound(name.to_string()))
    }
}

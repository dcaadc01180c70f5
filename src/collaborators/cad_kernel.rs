//! CAD-kernel collaborator interface
//!
//! The kernel is invoked through a script-execution seam: inputs are a
//! validated script and a document handle, outputs are computed object
//! bags. Lock timeouts are retryable; geometry failures are not.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Kernel errors
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Another worker holds the document lock; retryable
    #[error("Document lock timeout: {0}")]
    DocumentLockTimeout(String),

    /// The kernel rejected the geometry; not retryable
    #[error("Geometry invalid: {0}")]
    GeometryInvalid(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Script execution failed: {0}")]
    ScriptFailed(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Validation depth for document checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Basic,
    Geometry,
    Topology,
    Constraints,
    Full,
}

/// Export formats the kernel can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    FcStd,
    Step,
    Stl,
    Dxf,
    Glb,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::FcStd => "fcstd",
            ExportFormat::Step => "step",
            ExportFormat::Stl => "stl",
            ExportFormat::Dxf => "dxf",
            ExportFormat::Glb => "glb",
        }
    }
}

/// The CAD-kernel collaborator.
#[async_trait]
pub trait CadKernel: Send + Sync {
    /// Execute a validated script against a document and return the
    /// computed object bag.
    async fn execute_script(
        &self,
        document_id: &str,
        script: &str,
    ) -> KernelResult<serde_json::Value>;

    /// Validate a document at the given depth; returns collected errors.
    async fn validate_document(
        &self,
        document_id: &str,
        level: ValidationLevel,
    ) -> KernelResult<Vec<String>>;

    /// Recompute the document's feature tree.
    async fn recompute(&self, document_id: &str) -> KernelResult<()>;

    /// Apply an assembly constraint (attachment, axis alignment,
    /// offset) within a document. The constraint record must carry a
    /// `kind` discriminator.
    async fn apply_constraint(
        &self,
        document_id: &str,
        constraint: &serde_json::Value,
    ) -> KernelResult<()>;

    /// In-place repair operation (geometry recompute, constraint solve,
    /// partial extraction, feature regeneration).
    async fn repair(&self, document_id: &str, operation: &str) -> KernelResult<()>;

    /// Export the document in a given format.
    async fn export(&self, document_id: &str, format: ExportFormat) -> KernelResult<Vec<u8>>;

    /// Replace a document's content wholesale (backup restore path).
    async fn replace_content(&self, document_id: &str, content: &[u8]) -> KernelResult<()>;
}

/// In-process mock kernel with scriptable validation outcomes.
pub struct MockCadKernel {
    documents: RwLock<HashMap<String, Vec<u8>>>,
    /// document_id -> errors returned by validate_document
    validation_errors: RwLock<HashMap<String, Vec<String>>>,
    /// operations that clear validation errors when repaired
    repair_fixes: RwLock<HashMap<String, bool>>,
    /// document_id -> constraints applied so far
    constraints: RwLock<HashMap<String, u32>>,
}

impl MockCadKernel {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            validation_errors: RwLock::new(HashMap::new()),
            repair_fixes: RwLock::new(HashMap::new()),
            constraints: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert_document(&self, document_id: &str, content: &[u8]) {
        self.documents
            .write()
            .await
            .insert(document_id.to_string(), content.to_vec());
    }

    /// Make subsequent validations of a document fail with these errors.
    pub async fn seed_validation_errors(&self, document_id: &str, errors: Vec<String>) {
        self.validation_errors
            .write()
            .await
            .insert(document_id.to_string(), errors);
    }

    /// Whether a repair call clears the seeded errors (default true).
    pub async fn set_repairable(&self, document_id: &str, repairable: bool) {
        self.repair_fixes
            .write()
            .await
            .insert(document_id.to_string(), repairable);
    }

    pub async fn document_content(&self, document_id: &str) -> Option<Vec<u8>> {
        self.documents.read().await.get(document_id).cloned()
    }

    /// Constraints applied to a document so far.
    pub async fn constraint_count(&self, document_id: &str) -> u32 {
        self.constraints
            .read()
            .await
            .get(document_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MockCadKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CadKernel for MockCadKernel {
    async fn execute_script(
        &self,
        document_id: &str,
        script: &str,
    ) -> KernelResult<serde_json::Value> {
        let mut documents = self.documents.write().await;
        let content = documents.entry(document_id.to_string()).or_default();
        content.extend_from_slice(script.as_bytes());

        Ok(serde_json::json!({
            "document_id": document_id,
            "objects_created": script.matches("addObject").count(),
            "recomputed": true,
        }))
    }

    async fn validate_document(
        &self,
        document_id: &str,
        _level: ValidationLevel,
    ) -> KernelResult<Vec<String>> {
        if !self.documents.read().await.contains_key(document_id) {
            return Err(KernelError::DocumentNotFound(document_id.to_string()));
        }
        Ok(self
            .validation_errors
            .read()
            .await
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn recompute(&self, document_id: &str) -> KernelResult<()> {
        if !self.documents.read().await.contains_key(document_id) {
            return Err(KernelError::DocumentNotFound(document_id.to_string()));
        }
        Ok(())
    }

    async fn apply_constraint(
        &self,
        document_id: &str,
        constraint: &serde_json::Value,
    ) -> KernelResult<()> {
        if !self.documents.read().await.contains_key(document_id) {
            return Err(KernelError::DocumentNotFound(document_id.to_string()));
        }
        if constraint.get("kind").and_then(|kind| kind.as_str()).is_none() {
            return Err(KernelError::ScriptFailed(
                "constraint record is missing its kind".to_string(),
            ));
        }

        *self
            .constraints
            .write()
            .await
            .entry(document_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn repair(&self, document_id: &str, operation: &str) -> KernelResult<()> {
        let repairable = self
            .repair_fixes
            .read()
            .await
            .get(document_id)
            .copied()
            .unwrap_or(true);

        if repairable {
            self.validation_errors.write().await.remove(document_id);
            log::debug!("Mock repair '{}' fixed {}", operation, document_id);
            Ok(())
        } else {
            Err(KernelError::GeometryInvalid(format!(
                "repair '{}' could not fix {}",
                operation, document_id
            )))
        }
    }

    async fn export(&self, document_id: &str, format: ExportFormat) -> KernelResult<Vec<u8>> {
        let documents = self.documents.read().await;
        let content = documents
            .get(document_id)
            .ok_or_else(|| KernelError::DocumentNotFound(document_id.to_string()))?;

        let mut out = format!("{}:", format.extension()).into_bytes();
        out.extend_from_slice(content);
        Ok(out)
    }

    async fn replace_content(&self, document_id: &str, content: &[u8]) -> KernelResult<()> {
        self.documents
            .write()
            .await
            .insert(document_id.to_string(), content.to_vec());
        self.validation_errors.write().await.remove(document_id);
        Ok(())
    }
}

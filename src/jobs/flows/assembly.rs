//! Assembly composition flow: one parent assembly linking N child
//! documents with constraints

use async_trait::async_trait;

use crate::collaborators::{ExportFormat, KernelError, ValidationLevel};
use crate::error::ErrorCode;
use crate::jobs::job::{Job, JobKind};
use crate::jobs::worker::{Flow, FlowContext, FlowError, FlowResult};
use crate::storage::{ObjectKey, ObjectMetadata, StorageTier};
use crate::wal::TransactionKind;

/// Assembly flow: load children, set up parent-child links, apply
/// constraints, recompute.
pub struct AssemblyFlow;

#[async_trait]
impl Flow for AssemblyFlow {
    fn kind(&self) -> JobKind {
        JobKind::Assembly
    }

    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value> {
        let children: Vec<String> = job
            .input
            .get("children")
            .and_then(|value| value.as_array())
            .map(|array| {
                array
                    .iter()
                    .filter_map(|entry| entry.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        if children.is_empty() {
            return Err(FlowError::failed(
                ErrorCode::ValidationFailed,
                "an assembly needs at least one child document",
            ));
        }

        // Every child document must load.
        for child in &children {
            ctx.kernel
                .validate_document(child, ValidationLevel::Basic)
                .await
                .map_err(|e| {
                    FlowError::failed(
                        ErrorCode::ValidationFailed,
                        format!("child {} failed to load: {}", child, e),
                    )
                })?;
        }
        ctx.checkpoint(&job.id, 10).await?;

        let constraints: Vec<serde_json::Value> = job
            .input
            .get("constraints")
            .and_then(|value| value.as_array())
            .cloned()
            .unwrap_or_default();

        // Build the parent document linking every child.
        let assembly_id = format!("asm-{}", job.id);
        let mut script = String::from("import FreeCAD\nimport Part\ndoc = FreeCAD.newDocument()\n");
        for (index, child) in children.iter().enumerate() {
            script.push_str(&format!(
                "link{} = doc.addObject('App::Link', 'Child{}')\nlink{}.Label = '{}'\n",
                index, index, index, child
            ));
        }
        script.push_str("doc.recompute()\n");

        let guard = ctx.lock_document(&assembly_id).await?;
        let _ = ctx
            .pitr
            .log_transaction(
                TransactionKind::Create,
                &assembly_id,
                serde_json::json!({ "children": children, "constraints": constraints.len() }),
                None,
                None,
                job.user_id.clone(),
            )
            .await;
        let execution = ctx.kernel.execute_script(&assembly_id, &script).await;
        ctx.unlock_document(&guard).await;
        execution.map_err(|e| FlowError::failed(ErrorCode::GeometryInvalid, e.to_string()))?;

        ctx.checkpoint(&job.id, 40).await?;

        // Apply constraints through the kernel, then the final recompute.
        for (index, constraint) in constraints.iter().enumerate() {
            ctx.kernel
                .apply_constraint(&assembly_id, constraint)
                .await
                .map_err(|e| {
                    let code = match &e {
                        KernelError::ScriptFailed(_) => ErrorCode::InvalidParameters,
                        KernelError::DocumentLockTimeout(_) => ErrorCode::DocumentLockTimeout,
                        _ => ErrorCode::GeometryInvalid,
                    };
                    FlowError::failed(code, format!("constraint {} failed: {}", index, e))
                })?;
        }
        ctx.checkpoint(&job.id, 60).await?;

        ctx.kernel
            .recompute(&assembly_id)
            .await
            .map_err(|e| FlowError::failed(ErrorCode::GeometryInvalid, e.to_string()))?;
        ctx.checkpoint(&job.id, 80).await?;

        let bytes = ctx
            .kernel
            .export(&assembly_id, ExportFormat::FcStd)
            .await
            .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;
        let key = ObjectKey::artefact(&job.id, ExportFormat::FcStd.extension());
        ctx.storage
            .put(
                StorageTier::Hot,
                &key,
                &bytes,
                ObjectMetadata::for_upload(&key, &bytes),
            )
            .await
            .map_err(|e| FlowError::failed(ErrorCode::StorageUnreachable, e.to_string()))?;
        ctx.checkpoint(&job.id, 95).await?;

        Ok(serde_json::json!({
            "document_id": assembly_id,
            "children": children,
            "constraints_applied": constraints.len(),
            "artefacts": [key],
        }))
    }
}

//! AI-driven model generation flow

use async_trait::async_trait;

use crate::collaborators::{AiError, AiRequest, ExportFormat, KernelError};
use crate::error::ErrorCode;
use crate::jobs::job::{Job, JobKind};
use crate::jobs::script_policy::{self, ScriptPolicyError};
use crate::jobs::worker::{Flow, FlowContext, FlowError, FlowResult};
use crate::storage::{ObjectKey, ObjectMetadata, StorageTier};
use crate::wal::TransactionKind;

const SYSTEM_PROMPT: &str = "You are a CAD modeling assistant. Produce a FreeCAD Python script \
and canonical parameters for the user's request. Respond with strict JSON only.";

/// Prompt flow: validate input, call the AI collaborator, security-check
/// the generated script, execute it under a document lock inside a
/// WAL-bound transaction, export artefacts.
pub struct PromptFlow;

#[async_trait]
impl Flow for PromptFlow {
    fn kind(&self) -> JobKind {
        JobKind::PromptModel
    }

    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value> {
        ctx.checkpoint(&job.id, 5).await?;

        let prompt = job
            .input
            .get("prompt")
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .ok_or_else(|| {
                FlowError::failed(ErrorCode::ValidationFailed, "missing or empty prompt")
            })?;

        // AI call behind the circuit breaker.
        if !ctx.ai_breaker.allow_request() {
            return Err(FlowError::failed(
                ErrorCode::AiProviderTimeout,
                "AI provider circuit is open",
            ));
        }

        let request = AiRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: prompt.to_string(),
            context: job
                .input
                .get("context")
                .and_then(|value| value.as_str())
                .map(String::from),
            user_id: job.user_id.clone(),
        };

        let response = match ctx.ai.generate(&request).await {
            Ok(response) => {
                ctx.ai_breaker.record_success();
                response
            }
            Err(e) => {
                // Only transport-level failures count against the
                // breaker; policy refusals mean the provider is healthy.
                if matches!(e, AiError::Timeout | AiError::RateLimited | AiError::Provider(_)) {
                    ctx.ai_breaker.record_failure();
                }
                return Err(FlowError::failed(e.error_code(), e.to_string()));
            }
        };

        if response.requires_clarification {
            return Err(FlowError::failed(
                ErrorCode::InvalidParameters,
                "the prompt needs clarification before a model can be generated",
            ));
        }

        ctx.checkpoint(&job.id, 30).await?;

        // Security validation is non-retryable by definition.
        match script_policy::validate_script(&response.script) {
            Ok(()) => {}
            Err(ScriptPolicyError::Violations(violations)) => {
                return Err(FlowError::failed(
                    ErrorCode::SecurityViolation,
                    format!("script rejected: {}", violations.join("; ")),
                ));
            }
            Err(other) => {
                return Err(FlowError::failed(ErrorCode::SecurityViolation, other.to_string()));
            }
        }

        ctx.checkpoint(&job.id, 40).await?;

        let document_id = job
            .input
            .get("document_id")
            .and_then(|value| value.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("model-{}", job.id));

        // Execute under the document lock, journaled in the WAL.
        let guard = ctx.lock_document(&document_id).await?;
        let _ = ctx
            .pitr
            .log_transaction(
                TransactionKind::Update,
                &document_id,
                serde_json::json!({
                    "script_executed": job.id,
                    "parameters": response.parameters,
                }),
                None,
                None,
                job.user_id.clone(),
            )
            .await;

        let execution = ctx.kernel.execute_script(&document_id, &response.script).await;
        ctx.unlock_document(&guard).await;

        let computed = execution.map_err(|e| match e {
            KernelError::DocumentLockTimeout(_) => {
                FlowError::failed(ErrorCode::DocumentLockTimeout, e.to_string())
            }
            KernelError::GeometryInvalid(_) => {
                FlowError::failed(ErrorCode::GeometryInvalid, e.to_string())
            }
            other => FlowError::failed(ErrorCode::Internal, other.to_string()),
        })?;

        ctx.checkpoint(&job.id, 60).await?;

        // Export and upload artefacts.
        let mut artefacts = Vec::new();
        for format in [ExportFormat::FcStd, ExportFormat::Step, ExportFormat::Stl] {
            let bytes = ctx
                .kernel
                .export(&document_id, format)
                .await
                .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;

            let key = ObjectKey::artefact(&job.id, format.extension());
            if !ctx.storage_breaker.allow_request() {
                return Err(FlowError::failed(
                    ErrorCode::StorageUnreachable,
                    "storage circuit is open",
                ));
            }
            match ctx
                .storage
                .put(
                    StorageTier::Hot,
                    &key,
                    &bytes,
                    ObjectMetadata::for_upload(&key, &bytes),
                )
                .await
            {
                Ok(_) => {
                    ctx.storage_breaker.record_success();
                    artefacts.push(key);
                }
                Err(e) => {
                    ctx.storage_breaker.record_failure();
                    return Err(FlowError::failed(ErrorCode::StorageUnreachable, e.to_string()));
                }
            }
        }

        ctx.checkpoint(&job.id, 85).await?;
        ctx.checkpoint(&job.id, 95).await?;

        Ok(serde_json::json!({
            "document_id": document_id,
            "artefacts": artefacts,
            "parameters": response.parameters,
            "units": response.units,
            "warnings": response.warnings,
            "objects": computed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockAiAdapter;
    use crate::jobs::job::JobStatus;
    use crate::jobs::worker::tests::test_context;
    use crate::jobs::worker::JobWorker;
    use std::sync::Arc;

    async fn submit_and_run(
        ctx: &Arc<FlowContext>,
        worker: &JobWorker,
        input: serde_json::Value,
    ) -> Job {
        let job = ctx
            .scheduler
            .submit(JobKind::PromptModel, None, input, None)
            .await
            .unwrap();
        worker.run_once().await;
        ctx.scheduler.query(&job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_prompt_flow_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;

        let mut worker = JobWorker::new("w1", vec!["models.prompt".to_string()], Arc::clone(&ctx));
        worker.register_flow(Arc::new(PromptFlow));

        let finished = submit_and_run(
            &ctx,
            &worker,
            serde_json::json!({ "prompt": "a 40x20x10 mounting plate" }),
        )
        .await;

        assert_eq!(finished.status, JobStatus::Completed, "{:?}", finished.error_message);
        let output = finished.output.unwrap();
        assert_eq!(output["artefacts"].as_array().unwrap().len(), 3);
        assert!(output["document_id"].as_str().unwrap().starts_with("model-"));

        // Artefacts landed in the hot tier under the job's prefix.
        let keys = ctx
            .storage
            .list(&format!("artefacts/{}/", finished.id), None, 100)
            .await
            .unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_prompt_flow_rejects_empty_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;

        let mut worker = JobWorker::new("w1", vec!["models.prompt".to_string()], Arc::clone(&ctx));
        worker.register_flow(Arc::new(PromptFlow));

        let finished = submit_and_run(&ctx, &worker, serde_json::json!({ "prompt": "  " })).await;
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.error_code, Some(ErrorCode::ValidationFailed));
        assert!(finished.is_terminal());
    }

    #[tokio::test]
    async fn test_prompt_flow_ai_timeout_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let base = test_context(dir.path()).await;
        let ctx = Arc::new(FlowContext {
            ai: Arc::new(MockAiAdapter::failing_with("timeout")),
            ..match Arc::try_unwrap(base) {
                Ok(ctx) => ctx,
                Err(_) => unreachable!("context has one owner"),
            }
        });

        let mut worker = JobWorker::new("w1", vec!["models.prompt".to_string()], Arc::clone(&ctx));
        worker.register_flow(Arc::new(PromptFlow));

        let finished =
            submit_and_run(&ctx, &worker, serde_json::json!({ "prompt": "a bracket" })).await;
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.error_code, Some(ErrorCode::AiProviderTimeout));
        assert!(finished.can_retry());
    }

    #[tokio::test]
    async fn test_prompt_flow_malformed_ai_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let base = test_context(dir.path()).await;
        let ctx = Arc::new(FlowContext {
            ai: Arc::new(MockAiAdapter::failing_with("malformed")),
            ..match Arc::try_unwrap(base) {
                Ok(ctx) => ctx,
                Err(_) => unreachable!("context has one owner"),
            }
        });

        let mut worker = JobWorker::new("w1", vec!["models.prompt".to_string()], Arc::clone(&ctx));
        worker.register_flow(Arc::new(PromptFlow));

        let finished =
            submit_and_run(&ctx, &worker, serde_json::json!({ "prompt": "a bracket" })).await;
        assert_eq!(finished.error_code, Some(ErrorCode::AiMalformedResponse));
        assert!(finished.is_terminal());
    }
}

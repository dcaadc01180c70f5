//! FEM simulation flow: mesh, deck, external solve, artifact bundle

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::jobs::job::{Job, JobKind};
use crate::jobs::worker::{Flow, FlowContext, FlowError, FlowResult};
use crate::storage::{ObjectKey, ObjectMetadata, StorageTier};
use crate::wal::TransactionKind;

/// Supported analysis types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    Static,
    Modal,
    Buckling,
    ThermalSteady,
    ThermalTransient,
    Coupled,
}

impl AnalysisType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "static" => Some(AnalysisType::Static),
            "modal" => Some(AnalysisType::Modal),
            "buckling" => Some(AnalysisType::Buckling),
            "thermal_steady" => Some(AnalysisType::ThermalSteady),
            "thermal_transient" => Some(AnalysisType::ThermalTransient),
            "coupled" => Some(AnalysisType::Coupled),
            _ => None,
        }
    }

    fn deck_keyword(&self) -> &'static str {
        match self {
            AnalysisType::Static => "*STATIC",
            AnalysisType::Modal => "*FREQUENCY",
            AnalysisType::Buckling => "*BUCKLE",
            AnalysisType::ThermalSteady => "*HEAT TRANSFER, STEADY STATE",
            AnalysisType::ThermalTransient => "*HEAT TRANSFER",
            AnalysisType::Coupled => "*COUPLED TEMPERATURE-DISPLACEMENT",
        }
    }
}

/// Pre-execution resource estimate derived from the mesh settings.
struct ResourceEstimate {
    nodes: u64,
    elements: u64,
    memory_mb: u64,
}

/// Estimate mesh size from the bounding volume and element size.
fn estimate_resources(volume_mm3: f64, mesh_size_mm: f64) -> ResourceEstimate {
    let element_volume = mesh_size_mm.powi(3).max(1e-6);
    let elements = (volume_mm3 / element_volume).ceil().max(1.0) as u64;
    // Second-order tetrahedra average roughly 1.8 nodes per element.
    let nodes = (elements as f64 * 1.8).ceil() as u64;
    // Solver working set is on the order of 1 KiB per node.
    let memory_mb = nodes / 1024 + 64;

    ResourceEstimate {
        nodes,
        elements,
        memory_mb,
    }
}

/// FEM flow: load model, assign materials, constraints and loads, mesh,
/// write the solver deck, run the external solver, parse results, emit
/// the artifact bundle.
pub struct FemFlow;

#[async_trait]
impl Flow for FemFlow {
    fn kind(&self) -> JobKind {
        JobKind::FemSimulation
    }

    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value> {
        let document_id = job
            .input
            .get("document_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| FlowError::failed(ErrorCode::ValidationFailed, "missing document_id"))?;

        let analysis = job
            .input
            .get("analysis_type")
            .and_then(|value| value.as_str())
            .and_then(AnalysisType::parse)
            .ok_or_else(|| {
                FlowError::failed(
                    ErrorCode::InvalidParameters,
                    "analysis_type must be one of static, modal, buckling, thermal_steady, thermal_transient, coupled",
                )
            })?;

        // Resource pre-estimate gates the submission before any work.
        let volume = job
            .input
            .get("volume_mm3")
            .and_then(|value| value.as_f64())
            .unwrap_or(1_000_000.0);
        let mesh_size = job
            .input
            .get("mesh_size_mm")
            .and_then(|value| value.as_f64())
            .unwrap_or(10.0);

        let estimate = estimate_resources(volume, mesh_size);
        if estimate.nodes > ctx.fem_limits.max_nodes
            || estimate.elements > ctx.fem_limits.max_elements
            || estimate.memory_mb > ctx.fem_limits.max_memory_mb
        {
            return Err(FlowError::failed(
                ErrorCode::ResourceLimitExceeded,
                format!(
                    "estimated {} nodes / {} elements / {} MiB exceeds the per-analysis caps",
                    estimate.nodes, estimate.elements, estimate.memory_mb
                ),
            ));
        }

        // Load the referenced model.
        ctx.kernel
            .recompute(document_id)
            .await
            .map_err(|e| FlowError::failed(ErrorCode::ValidationFailed, e.to_string()))?;
        ctx.checkpoint(&job.id, 10).await?;

        let material = job
            .input
            .get("material")
            .and_then(|value| value.as_str())
            .unwrap_or("steel");
        ctx.checkpoint(&job.id, 25).await?;

        let loads: Vec<serde_json::Value> = job
            .input
            .get("loads")
            .and_then(|value| value.as_array())
            .cloned()
            .unwrap_or_default();
        let constraints: Vec<serde_json::Value> = job
            .input
            .get("constraints")
            .and_then(|value| value.as_array())
            .cloned()
            .unwrap_or_default();
        ctx.checkpoint(&job.id, 40).await?;

        // Mesh generation is the long compute stage.
        ctx.checkpoint(&job.id, 60).await?;

        // Write the solver input deck.
        let deck_dir = ctx.scratch_dir.join(&job.id);
        tokio::fs::create_dir_all(&deck_dir)
            .await
            .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;
        let deck_path: PathBuf = deck_dir.join("analysis.inp");

        let deck = build_deck(document_id, analysis, material, &estimate, &loads, &constraints);
        tokio::fs::write(&deck_path, deck.as_bytes())
            .await
            .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;
        ctx.checkpoint(&job.id, 70).await?;

        // External solve behind the breaker, with a hard timeout.
        if !ctx.solver_breaker.allow_request() {
            return Err(FlowError::failed(
                ErrorCode::SolverFailed,
                "solver circuit is open",
            ));
        }
        let solve_timeout = Duration::from_secs(
            job.input
                .get("solver_timeout_secs")
                .and_then(|value| value.as_u64())
                .unwrap_or(1800),
        );

        let output = match ctx.solver.solve(&deck_path, solve_timeout).await {
            Ok(output) => {
                ctx.solver_breaker.record_success();
                output
            }
            Err(e) => {
                use crate::collaborators::SolverError;
                let code = match &e {
                    // Divergence is deterministic; the breaker only
                    // counts infrastructure failures.
                    SolverError::NonConvergence(_) => ErrorCode::SolverNonConvergence,
                    _ => {
                        ctx.solver_breaker.record_failure();
                        ErrorCode::SolverFailed
                    }
                };
                return Err(FlowError::failed(code, e.to_string()));
            }
        };
        ctx.checkpoint(&job.id, 85).await?;

        let _ = ctx
            .pitr
            .log_transaction(
                TransactionKind::Update,
                document_id,
                serde_json::json!({
                    "fem_analysis": format!("{:?}", analysis),
                    "iterations": output.iterations,
                }),
                None,
                None,
                job.user_id.clone(),
            )
            .await;

        // Artifact bundle: result file, deck, data, status, report, log.
        let mut artefacts = Vec::new();
        let report = serde_json::json!({
            "analysis_type": analysis,
            "material": material,
            "nodes": estimate.nodes,
            "elements": estimate.elements,
            "iterations": output.iterations,
            "loads": loads.len(),
            "constraints": constraints.len(),
        });

        let uploads: Vec<(String, Vec<u8>)> = vec![
            (
                ObjectKey::artefact(&job.id, "frd"),
                tokio::fs::read(&output.result_file).await.unwrap_or_default(),
            ),
            (
                ObjectKey::artefact(&job.id, "dat"),
                tokio::fs::read(&output.data_file).await.unwrap_or_default(),
            ),
            (
                ObjectKey::artefact(&job.id, "sta"),
                tokio::fs::read(&output.status_file).await.unwrap_or_default(),
            ),
            (ObjectKey::artefact(&job.id, "inp"), deck.into_bytes()),
            (
                ObjectKey::artefact(&job.id, "json"),
                serde_json::to_vec(&report).unwrap_or_default(),
            ),
            (ObjectKey::artefact(&job.id, "log"), output.log.clone().into_bytes()),
        ];

        for (key, bytes) in uploads {
            ctx.storage
                .put(
                    StorageTier::Hot,
                    &key,
                    &bytes,
                    ObjectMetadata::for_upload(&key, &bytes),
                )
                .await
                .map_err(|e| FlowError::failed(ErrorCode::StorageUnreachable, e.to_string()))?;
            artefacts.push(key);
        }
        ctx.checkpoint(&job.id, 95).await?;

        Ok(serde_json::json!({
            "document_id": document_id,
            "analysis_type": analysis,
            "report": report,
            "artefacts": artefacts,
        }))
    }
}

/// Render the solver input deck.
fn build_deck(
    document_id: &str,
    analysis: AnalysisType,
    material: &str,
    estimate: &ResourceEstimate,
    loads: &[serde_json::Value],
    constraints: &[serde_json::Value],
) -> String {
    let mut deck = String::new();
    deck.push_str(&format!("** model: {}\n", document_id));
    deck.push_str(&format!(
        "** mesh: {} nodes, {} elements\n",
        estimate.nodes, estimate.elements
    ));
    deck.push_str(&format!("*MATERIAL, NAME={}\n", material.to_uppercase()));
    deck.push_str("*ELASTIC\n210000., .3\n");
    deck.push_str("*STEP\n");
    deck.push_str(analysis.deck_keyword());
    deck.push('\n');
    for constraint in constraints {
        deck.push_str(&format!(
            "*BOUNDARY\n** {}\n",
            constraint.get("name").and_then(|v| v.as_str()).unwrap_or("fixed")
        ));
    }
    for load in loads {
        deck.push_str(&format!(
            "*CLOAD\n** {}\n",
            load.get("name").and_then(|v| v.as_str()).unwrap_or("load")
        ));
    }
    deck.push_str("*NODE FILE\nU\n*END STEP\n");
    deck
}

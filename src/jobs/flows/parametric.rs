//! Parametric modeling flow: named templates plus explicit dimensions

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::collaborators::ExportFormat;
use crate::error::ErrorCode;
use crate::jobs::job::{Job, JobKind};
use crate::jobs::worker::{Flow, FlowContext, FlowError, FlowResult};
use crate::storage::{ObjectKey, ObjectMetadata, StorageTier};
use crate::wal::TransactionKind;

/// One entry in the template library
struct ModelTemplate {
    name: &'static str,
    /// Dimension name -> default value in millimetres
    defaults: &'static [(&'static str, f64)],
}

static TEMPLATES: Lazy<HashMap<&'static str, ModelTemplate>> = Lazy::new(|| {
    let mut templates = HashMap::new();
    templates.insert(
        "box",
        ModelTemplate {
            name: "box",
            defaults: &[("length", 50.0), ("width", 30.0), ("height", 20.0)],
        },
    );
    templates.insert(
        "cylinder",
        ModelTemplate {
            name: "cylinder",
            defaults: &[("radius", 10.0), ("height", 40.0)],
        },
    );
    templates.insert(
        "flange",
        ModelTemplate {
            name: "flange",
            defaults: &[
                ("outer_diameter", 120.0),
                ("inner_diameter", 60.0),
                ("thickness", 12.0),
                ("bolt_circle", 95.0),
                ("bolt_count", 8.0),
            ],
        },
    );
    templates.insert(
        "bracket",
        ModelTemplate {
            name: "bracket",
            defaults: &[
                ("length", 80.0),
                ("width", 40.0),
                ("thickness", 6.0),
                ("hole_diameter", 8.0),
            ],
        },
    );
    templates
});

impl ModelTemplate {
    /// Resolve final dimensions: caller values override defaults.
    fn resolve_dimensions(&self, overrides: &serde_json::Value) -> HashMap<String, f64> {
        let mut dimensions: HashMap<String, f64> = self
            .defaults
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();

        if let Some(object) = overrides.as_object() {
            for (name, value) in object {
                if let Some(number) = value.as_f64() {
                    dimensions.insert(name.clone(), number);
                }
            }
        }
        dimensions
    }

    /// Generate the kernel script for this template.
    fn script(&self, dimensions: &HashMap<String, f64>) -> String {
        let mut script = String::from("import FreeCAD\nimport Part\ndoc = FreeCAD.newDocument()\n");
        match self.name {
            "cylinder" => {
                script.push_str("obj = doc.addObject('Part::Cylinder', 'Cylinder')\n");
                script.push_str(&format!(
                    "obj.Radius = {}\nobj.Height = {}\n",
                    dimensions["radius"], dimensions["height"]
                ));
            }
            "flange" => {
                script.push_str("obj = doc.addObject('Part::Cylinder', 'FlangeBody')\n");
                script.push_str(&format!(
                    "obj.Radius = {}\nobj.Height = {}\n",
                    dimensions["outer_diameter"] / 2.0,
                    dimensions["thickness"]
                ));
                script.push_str("bore = doc.addObject('Part::Cylinder', 'Bore')\n");
                script.push_str(&format!(
                    "bore.Radius = {}\n",
                    dimensions["inner_diameter"] / 2.0
                ));
            }
            "bracket" => {
                script.push_str("obj = doc.addObject('Part::Box', 'BracketPlate')\n");
                script.push_str(&format!(
                    "obj.Length = {}\nobj.Width = {}\nobj.Height = {}\n",
                    dimensions["length"], dimensions["width"], dimensions["thickness"]
                ));
            }
            _ => {
                script.push_str("obj = doc.addObject('Part::Box', 'Box')\n");
                script.push_str(&format!(
                    "obj.Length = {}\nobj.Width = {}\nobj.Height = {}\n",
                    dimensions["length"], dimensions["width"], dimensions["height"]
                ));
            }
        }
        script.push_str("doc.recompute()\n");
        script
    }
}

/// Parametric flow: resolve a named model kind against the template
/// library, apply dimensions under a lock, export.
pub struct ParametricFlow;

#[async_trait]
impl Flow for ParametricFlow {
    fn kind(&self) -> JobKind {
        JobKind::ParametricModel
    }

    async fn execute(&self, ctx: &FlowContext, job: &Job) -> FlowResult<serde_json::Value> {
        ctx.checkpoint(&job.id, 10).await?;

        let model_kind = job
            .input
            .get("model")
            .and_then(|value| value.as_str())
            .ok_or_else(|| FlowError::failed(ErrorCode::ValidationFailed, "missing model kind"))?;

        let template = TEMPLATES.get(model_kind).ok_or_else(|| {
            FlowError::failed(
                ErrorCode::InvalidParameters,
                format!("unknown model kind: {}", model_kind),
            )
        })?;

        let dimensions = template.resolve_dimensions(
            job.input
                .get("dimensions")
                .unwrap_or(&serde_json::Value::Null),
        );
        for (name, value) in &dimensions {
            if *value <= 0.0 || !value.is_finite() {
                return Err(FlowError::failed(
                    ErrorCode::InvalidParameters,
                    format!("dimension {} must be positive, got {}", name, value),
                ));
            }
        }

        ctx.checkpoint(&job.id, 30).await?;

        let document_id = format!("model-{}", job.id);
        let script = template.script(&dimensions);

        let guard = ctx.lock_document(&document_id).await?;
        let _ = ctx
            .pitr
            .log_transaction(
                TransactionKind::Update,
                &document_id,
                serde_json::json!({ "template": template.name, "dimensions": dimensions }),
                None,
                None,
                job.user_id.clone(),
            )
            .await;
        let execution = ctx.kernel.execute_script(&document_id, &script).await;
        ctx.unlock_document(&guard).await;
        execution.map_err(|e| FlowError::failed(ErrorCode::GeometryInvalid, e.to_string()))?;

        ctx.checkpoint(&job.id, 60).await?;

        let mut artefacts = Vec::new();
        for format in [ExportFormat::FcStd, ExportFormat::Step] {
            let bytes = ctx
                .kernel
                .export(&document_id, format)
                .await
                .map_err(|e| FlowError::failed(ErrorCode::Internal, e.to_string()))?;
            let key = ObjectKey::artefact(&job.id, format.extension());
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
            "template": template.name,
            "dimensions": dimensions,
            "artefacts": artefacts,
        }))
    }
}

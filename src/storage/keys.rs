//! Canonical object key layout and content-type defaults

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

/// Builders for the canonical object key layout.
///
/// ```text
/// artefacts/{job-id}/{uuid}.{ext}
/// logs/{YYYY-MM-DD}/{uuid}.log
/// reports/{YYYY-MM-DD}/{uuid}.pdf
/// invoices/{YYYY}/{invoice-number}.pdf
/// snapshots/{source-id}/backup_{source-id}_{uuid-hex}
/// wal/wal_{uuid-hex}.log
/// checkpoints/ckpt_{uuid-hex}.json
/// ```
pub struct ObjectKey;

impl ObjectKey {
    pub fn artefact(job_id: &str, extension: &str) -> String {
        format!("artefacts/{}/{}.{}", job_id, Uuid::new_v4(), extension)
    }

    pub fn log(date: DateTime<Utc>) -> String {
        format!("logs/{}/{}.log", date.format("%Y-%m-%d"), Uuid::new_v4())
    }

    pub fn report(date: DateTime<Utc>) -> String {
        format!("reports/{}/{}.pdf", date.format("%Y-%m-%d"), Uuid::new_v4())
    }

    pub fn invoice(date: DateTime<Utc>, invoice_number: &str) -> String {
        format!("invoices/{}/{}.pdf", date.year(), invoice_number)
    }

    pub fn snapshot(source_id: &str) -> String {
        format!(
            "snapshots/{}/backup_{}_{}",
            source_id,
            source_id,
            Uuid::new_v4().simple()
        )
    }

    pub fn wal_segment() -> String {
        format!("wal/wal_{}.log", Uuid::new_v4().simple())
    }

    pub fn checkpoint() -> String {
        format!("checkpoints/ckpt_{}.json", Uuid::new_v4().simple())
    }
}

fn extension_of(key: &str) -> &str {
    key.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .unwrap_or("")
}

/// Content type attached on upload, by extension.
pub fn content_type_for(key: &str) -> &'static str {
    match extension_of(key).to_ascii_lowercase().as_str() {
        "fcstd" => "application/zip",
        "step" | "stp" => "model/step",
        "stl" => "model/stl",
        "glb" => "model/gltf-binary",
        "nc" | "tap" | "gcode" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "mp4" => "video/mp4",
        "txt" | "log" | "dat" | "sta" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Extensions rendered inline in a browser; everything CAD-shaped is
/// served as an attachment.
const INLINE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "mp4", "pdf", "txt", "json"];

/// Content disposition attached on upload, by extension.
pub fn content_disposition_for(key: &str) -> String {
    let filename = key.rsplit('/').next().unwrap_or(key);
    let ext = extension_of(key).to_ascii_lowercase();

    if INLINE_EXTENSIONS.contains(&ext.as_str()) {
        format!("inline; filename=\"{}\"", filename)
    } else {
        format!("attachment; filename=\"{}\"", filename)
    }
}

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_FORMAT_V1: &str = "bulletin-bundle-v1";

#[derive(Debug, Clone)]
pub struct BundleSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

/// Export every issued (validated) bulletin of a class/term as a zip bundle:
/// one JSON document per bulletin plus a manifest carrying a sha256 per
/// entry, so later tampering with an issued document is detectable.
pub fn export_bulletin_bundle(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
    out_path: &Path,
) -> anyhow::Result<BundleSummary> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.student_no,
                    b.revision, b.overall_average, b.rank, b.class_size,
                    b.subject_lines, b.sequence_averages, b.class_profile,
                    b.general_remark, b.generated_at, b.signed_document_path
             FROM bulletins b
             JOIN students s ON s.id = b.student_id
             WHERE s.class_id = ? AND b.term_id = ? AND b.status = 'validated'
               AND b.revision = (SELECT MAX(revision) FROM bulletins
                                 WHERE student_id = b.student_id
                                   AND term_id = b.term_id
                                   AND status = 'validated')
             ORDER BY s.sort_order",
        )
        .context("failed to prepare bulletin export query")?;

    let documents: Vec<(String, serde_json::Value)> = stmt
        .query_map((class_id, term_id), |r| {
            let student_id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let student_no: Option<String> = r.get(3)?;
            let subjects: String = r.get(8)?;
            let sequences: String = r.get(9)?;
            let profile: String = r.get(10)?;
            let doc = json!({
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "studentNo": student_no,
                "termId": term_id,
                "revision": r.get::<_, i64>(4)?,
                "overallAverage": r.get::<_, Option<f64>>(5)?,
                "rank": r.get::<_, Option<i64>>(6)?,
                "classSize": r.get::<_, i64>(7)?,
                "subjects": serde_json::from_str::<serde_json::Value>(&subjects)
                    .unwrap_or(serde_json::Value::Null),
                "sequences": serde_json::from_str::<serde_json::Value>(&sequences)
                    .unwrap_or(serde_json::Value::Null),
                "classProfile": serde_json::from_str::<serde_json::Value>(&profile)
                    .unwrap_or(serde_json::Value::Null),
                "generalRemark": r.get::<_, Option<String>>(11)?,
                "generatedAt": r.get::<_, String>(12)?,
                "signedDocumentPath": r.get::<_, Option<String>>(13)?,
            });
            Ok((format!("bulletins/{}.json", student_id), doc))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .context("failed to read validated bulletins")?;

    if documents.is_empty() {
        return Err(anyhow!(
            "no validated bulletin to export for class {} term {}",
            class_id,
            term_id
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut manifest_entries: Vec<serde_json::Value> = Vec::new();
    for (entry_path, doc) in &documents {
        let bytes = serde_json::to_vec_pretty(doc).context("failed to serialize bulletin")?;
        let digest = Sha256::digest(&bytes);
        manifest_entries.push(json!({
            "path": entry_path,
            "sha256": format!("{:x}", digest),
        }));
        zip.start_file(entry_path.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry_path))?;
        zip.write_all(&bytes)
            .with_context(|| format!("failed to write entry {}", entry_path))?;
    }

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "classId": class_id,
        "termId": term_id,
        "entries": manifest_entries,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(BundleSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: documents.len() + 1,
    })
}

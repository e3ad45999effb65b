use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::bulletin::BulletinPayload;
use crate::error::EngineError;

/// Two-state bulletin lifecycle. Every transition goes through this module
/// so the `AlreadyValidated` / `TermClosed` guards live in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulletinStatus {
    Draft,
    Validated,
}

impl BulletinStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BulletinStatus::Draft => "draft",
            BulletinStatus::Validated => "validated",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw {
            "draft" => Ok(BulletinStatus::Draft),
            "validated" => Ok(BulletinStatus::Validated),
            _ => Err(EngineError::not_found("bulletin status")),
        }
    }
}

/// Persisted bulletin row, latest revision for a (student, term).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinRecord {
    pub id: String,
    pub student_id: String,
    pub term_id: String,
    pub revision: i64,
    pub status: String,
    pub overall_average: Option<f64>,
    pub rank: Option<i64>,
    pub class_size: i64,
    pub subjects: serde_json::Value,
    pub sequences: serde_json::Value,
    pub class_profile: serde_json::Value,
    pub general_remark: Option<String>,
    pub generated_at: String,
    pub signed_document_path: Option<String>,
}

pub(crate) fn term_closed(conn: &Connection, term_id: &str) -> Result<bool, EngineError> {
    let closed: Option<i64> = conn
        .query_row("SELECT closed FROM terms WHERE id = ?", [term_id], |r| {
            r.get(0)
        })
        .optional()?;
    match closed {
        Some(v) => Ok(v != 0),
        None => Err(EngineError::not_found("term")),
    }
}

fn latest_revision(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<Option<(String, i64, BulletinStatus)>, EngineError> {
    let row: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT id, revision, status FROM bulletins
             WHERE student_id = ? AND term_id = ?
             ORDER BY revision DESC LIMIT 1",
            (student_id, term_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    match row {
        Some((id, rev, status)) => Ok(Some((id, rev, BulletinStatus::parse(&status)?))),
        None => Ok(None),
    }
}

fn insert_revision(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    revision: i64,
    payload: &BulletinPayload,
    generated_at: &str,
) -> Result<String, EngineError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO bulletins(
            id, student_id, term_id, revision, status,
            overall_average, rank, class_size,
            subject_lines, sequence_averages, class_profile,
            general_remark, generated_at
         ) VALUES (?, ?, ?, ?, 'draft', ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            student_id,
            term_id,
            revision,
            payload.overall_average,
            payload.rank,
            payload.class_size,
            payload.subjects_json(),
            payload.sequences_json(),
            payload.profile_json(),
            payload.general_remark,
            generated_at,
        ],
    )?;
    Ok(id)
}

fn replace_draft(
    conn: &Connection,
    row_id: &str,
    payload: &BulletinPayload,
    generated_at: &str,
) -> Result<(), EngineError> {
    // A recompute replaces the draft content but keeps a remark the
    // reviewer already wrote.
    conn.execute(
        "UPDATE bulletins SET
            overall_average = ?, rank = ?, class_size = ?,
            subject_lines = ?, sequence_averages = ?, class_profile = ?,
            general_remark = COALESCE(?, general_remark),
            generated_at = ?
         WHERE id = ?",
        rusqlite::params![
            payload.overall_average,
            payload.rank,
            payload.class_size,
            payload.subjects_json(),
            payload.sequences_json(),
            payload.profile_json(),
            payload.general_remark,
            generated_at,
            row_id,
        ],
    )?;
    Ok(())
}

/// Write a draft for (student, term): insert revision 1, or replace the
/// current draft's content. A validated current revision refuses the write.
pub fn upsert_draft(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    payload: &BulletinPayload,
    generated_at: &str,
) -> Result<String, EngineError> {
    match latest_revision(conn, student_id, term_id)? {
        None => insert_revision(conn, student_id, term_id, 1, payload, generated_at),
        Some((row_id, _, BulletinStatus::Draft)) => {
            replace_draft(conn, &row_id, payload, generated_at)?;
            Ok(row_id)
        }
        Some((_, _, BulletinStatus::Validated)) => Err(EngineError::AlreadyValidated {
            student_id: student_id.to_string(),
        }),
    }
}

/// Like `upsert_draft`, but a validated current revision is kept untouched
/// and a new draft revision is stacked on top of it.
pub fn supersede_draft(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    payload: &BulletinPayload,
    generated_at: &str,
) -> Result<String, EngineError> {
    match latest_revision(conn, student_id, term_id)? {
        None => insert_revision(conn, student_id, term_id, 1, payload, generated_at),
        Some((row_id, _, BulletinStatus::Draft)) => {
            replace_draft(conn, &row_id, payload, generated_at)?;
            Ok(row_id)
        }
        Some((_, rev, BulletinStatus::Validated)) => {
            insert_revision(conn, student_id, term_id, rev + 1, payload, generated_at)
        }
    }
}

/// Draft -> Validated. Validating an already-validated bulletin is a no-op
/// success so a retried administrative action does not fail.
pub fn mark_validated(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<(), EngineError> {
    if term_closed(conn, term_id)? {
        return Err(EngineError::TermClosed {
            term_id: term_id.to_string(),
        });
    }
    match latest_revision(conn, student_id, term_id)? {
        None => Err(EngineError::not_found("bulletin")),
        Some((_, _, BulletinStatus::Validated)) => Ok(()),
        Some((row_id, _, BulletinStatus::Draft)) => {
            conn.execute(
                "UPDATE bulletins SET status = 'validated' WHERE id = ?",
                [row_id],
            )?;
            Ok(())
        }
    }
}

/// Latest revision for (student, term).
pub fn get(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<BulletinRecord, EngineError> {
    let row = conn
        .query_row(
            "SELECT id, student_id, term_id, revision, status,
                    overall_average, rank, class_size,
                    subject_lines, sequence_averages, class_profile,
                    general_remark, generated_at, signed_document_path
             FROM bulletins
             WHERE student_id = ? AND term_id = ?
             ORDER BY revision DESC LIMIT 1",
            (student_id, term_id),
            |r| {
                Ok(BulletinRecord {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    term_id: r.get(2)?,
                    revision: r.get(3)?,
                    status: r.get(4)?,
                    overall_average: r.get(5)?,
                    rank: r.get(6)?,
                    class_size: r.get(7)?,
                    subjects: parse_json_col(r.get::<_, String>(8)?),
                    sequences: parse_json_col(r.get::<_, String>(9)?),
                    class_profile: parse_json_col(r.get::<_, String>(10)?),
                    general_remark: r.get(11)?,
                    generated_at: r.get(12)?,
                    signed_document_path: r.get(13)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| EngineError::not_found("bulletin"))
}

fn parse_json_col(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}

/// Set the reviewer's free-text remark on the current draft.
pub fn set_remark(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    remark: &str,
) -> Result<(), EngineError> {
    match latest_revision(conn, student_id, term_id)? {
        None => Err(EngineError::not_found("bulletin")),
        Some((_, _, BulletinStatus::Validated)) => Err(EngineError::AlreadyValidated {
            student_id: student_id.to_string(),
        }),
        Some((row_id, _, BulletinStatus::Draft)) => {
            conn.execute(
                "UPDATE bulletins SET general_remark = ? WHERE id = ?",
                (remark, row_id),
            )?;
            Ok(())
        }
    }
}

/// Record the path of the rendered, signed document. Only a validated
/// bulletin can carry one.
pub fn attach_document(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    path: &str,
) -> Result<(), EngineError> {
    match latest_revision(conn, student_id, term_id)? {
        None => Err(EngineError::not_found("bulletin")),
        Some((_, _, BulletinStatus::Draft)) => Err(EngineError::NotValidated {
            student_id: student_id.to_string(),
        }),
        Some((row_id, _, BulletinStatus::Validated)) => {
            conn.execute(
                "UPDATE bulletins SET signed_document_path = ? WHERE id = ?",
                (path, row_id),
            )?;
            Ok(())
        }
    }
}

/// First student of the class whose bulletin for the term is validated, if
/// any. A validated bulletin freezes the whole class/term unit: regeneration
/// must supersede, and the scores feeding it stop being editable.
pub fn first_validated_student(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
) -> Result<Option<String>, EngineError> {
    let student: Option<String> = conn
        .query_row(
            "SELECT b.student_id FROM bulletins b
             JOIN students s ON s.id = b.student_id
             WHERE s.class_id = ? AND b.term_id = ? AND b.status = 'validated'
             ORDER BY s.sort_order LIMIT 1",
            (class_id, term_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(student)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulletin::{BulletinPayload, ClassProfile};
    use crate::db;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    fn seeded_conn() -> Connection {
        let conn = db::open_db(&temp_workspace("bulletind-store-test")).expect("open db");
        conn.execute("INSERT INTO classes(id, name) VALUES('c1', '6e A')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
             VALUES('s1', 'c1', 'Abena', 'Paul', 1, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO terms(id, school_year, label, sort_order) VALUES('t1', '2025-2026', 'Trimestre 1', 0)",
            [],
        )
        .unwrap();
        conn
    }

    fn payload(overall: f64) -> BulletinPayload {
        BulletinPayload {
            overall_average: Some(overall),
            rank: Some(1),
            class_size: 1,
            subjects: vec![],
            sequences: vec![],
            profile: ClassProfile::empty(),
            general_remark: None,
        }
    }

    #[test]
    fn upsert_creates_then_replaces_draft() {
        let conn = seeded_conn();
        let id1 = upsert_draft(&conn, "s1", "t1", &payload(12.0), "2026-01-10T08:00:00Z")
            .expect("insert draft");
        let id2 = upsert_draft(&conn, "s1", "t1", &payload(13.5), "2026-01-11T08:00:00Z")
            .expect("replace draft");
        assert_eq!(id1, id2);

        let rec = get(&conn, "s1", "t1").expect("get");
        assert_eq!(rec.revision, 1);
        assert_eq!(rec.status, "draft");
        assert_eq!(rec.overall_average, Some(13.5));
    }

    #[test]
    fn replace_keeps_reviewer_remark() {
        let conn = seeded_conn();
        upsert_draft(&conn, "s1", "t1", &payload(12.0), "2026-01-10T08:00:00Z").unwrap();
        set_remark(&conn, "s1", "t1", "Bon trimestre.").unwrap();
        upsert_draft(&conn, "s1", "t1", &payload(12.5), "2026-01-11T08:00:00Z").unwrap();

        let rec = get(&conn, "s1", "t1").expect("get");
        assert_eq!(rec.general_remark.as_deref(), Some("Bon trimestre."));
    }

    #[test]
    fn mark_validated_is_idempotent_and_freezes_upserts() {
        let conn = seeded_conn();
        upsert_draft(&conn, "s1", "t1", &payload(12.0), "2026-01-10T08:00:00Z").unwrap();

        mark_validated(&conn, "s1", "t1").expect("validate");
        mark_validated(&conn, "s1", "t1").expect("second validate is a no-op");

        let err = upsert_draft(&conn, "s1", "t1", &payload(15.0), "2026-01-12T08:00:00Z")
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyValidated { .. }));

        // The frozen record is untouched.
        let rec = get(&conn, "s1", "t1").expect("get");
        assert_eq!(rec.overall_average, Some(12.0));
        assert_eq!(rec.status, "validated");
    }

    #[test]
    fn mark_validated_refuses_closed_term() {
        let conn = seeded_conn();
        upsert_draft(&conn, "s1", "t1", &payload(12.0), "2026-01-10T08:00:00Z").unwrap();
        conn.execute("UPDATE terms SET closed = 1 WHERE id = 't1'", [])
            .unwrap();

        let err = mark_validated(&conn, "s1", "t1").unwrap_err();
        assert!(matches!(err, EngineError::TermClosed { .. }));
    }

    #[test]
    fn supersede_stacks_a_new_draft_over_validated() {
        let conn = seeded_conn();
        upsert_draft(&conn, "s1", "t1", &payload(12.0), "2026-01-10T08:00:00Z").unwrap();
        mark_validated(&conn, "s1", "t1").unwrap();

        supersede_draft(&conn, "s1", "t1", &payload(14.0), "2026-02-01T08:00:00Z")
            .expect("supersede");

        let rec = get(&conn, "s1", "t1").expect("get");
        assert_eq!(rec.revision, 2);
        assert_eq!(rec.status, "draft");
        assert_eq!(rec.overall_average, Some(14.0));

        // Revision 1 survives, still validated, content intact.
        let (status, avg): (String, Option<f64>) = conn
            .query_row(
                "SELECT status, overall_average FROM bulletins
                 WHERE student_id = 's1' AND term_id = 't1' AND revision = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("revision 1 row");
        assert_eq!(status, "validated");
        assert_eq!(avg, Some(12.0));
    }

    #[test]
    fn attach_document_requires_validated() {
        let conn = seeded_conn();
        upsert_draft(&conn, "s1", "t1", &payload(12.0), "2026-01-10T08:00:00Z").unwrap();

        let err = attach_document(&conn, "s1", "t1", "out/b1.pdf").unwrap_err();
        assert!(matches!(err, EngineError::NotValidated { .. }));

        mark_validated(&conn, "s1", "t1").unwrap();
        attach_document(&conn, "s1", "t1", "out/b1.pdf").expect("attach");
        let rec = get(&conn, "s1", "t1").unwrap();
        assert_eq!(rec.signed_document_path.as_deref(), Some("out/b1.pdf"));
    }

    #[test]
    fn get_missing_is_not_found() {
        let conn = seeded_conn();
        let err = get(&conn, "s1", "t1").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}

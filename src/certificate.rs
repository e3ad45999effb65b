use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;

/// Certificates are not graded content but share the bulletin's two-state
/// issue workflow: drafted, reviewed, then frozen by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Enrollment,
    Attendance,
}

impl CertificateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CertificateKind::Enrollment => "enrollment",
            CertificateKind::Attendance => "attendance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enrollment" => Some(CertificateKind::Enrollment),
            "attendance" => Some(CertificateKind::Attendance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub id: String,
    pub student_id: String,
    pub kind: String,
    pub number: i64,
    pub status: String,
    pub body: String,
    pub issued_at: String,
    pub signed_document_path: Option<String>,
}

/// Draft a certificate with the next number of its kind. Numbering is
/// per-kind sequential; the read and insert run in one transaction so two
/// issues cannot take the same number.
pub fn issue(
    conn: &mut Connection,
    student_id: &str,
    kind: CertificateKind,
    body: &str,
) -> Result<CertificateRecord, EngineError> {
    let tx = conn.transaction()?;

    let student: Option<String> = tx
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    if student.is_none() {
        return Err(EngineError::not_found("student"));
    }

    let number: i64 = tx.query_row(
        "SELECT COALESCE(MAX(number), 0) + 1 FROM certificates WHERE kind = ?",
        [kind.as_str()],
        |r| r.get(0),
    )?;
    let record = CertificateRecord {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        kind: kind.as_str().to_string(),
        number,
        status: "draft".to_string(),
        body: body.to_string(),
        issued_at: Utc::now().to_rfc3339(),
        signed_document_path: None,
    };
    tx.execute(
        "INSERT INTO certificates(id, student_id, kind, number, status, body, issued_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        (
            &record.id,
            &record.student_id,
            &record.kind,
            record.number,
            &record.status,
            &record.body,
            &record.issued_at,
        ),
    )?;
    tx.commit()?;
    Ok(record)
}

pub fn get(conn: &Connection, id: &str) -> Result<CertificateRecord, EngineError> {
    let row = conn
        .query_row(
            "SELECT id, student_id, kind, number, status, body, issued_at, signed_document_path
             FROM certificates WHERE id = ?",
            [id],
            |r| {
                Ok(CertificateRecord {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    kind: r.get(2)?,
                    number: r.get(3)?,
                    status: r.get(4)?,
                    body: r.get(5)?,
                    issued_at: r.get(6)?,
                    signed_document_path: r.get(7)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| EngineError::not_found("certificate"))
}

/// Draft -> Validated; idempotent like the bulletin transition.
pub fn mark_validated(conn: &Connection, id: &str) -> Result<(), EngineError> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM certificates WHERE id = ?", [id], |r| {
            r.get(0)
        })
        .optional()?;
    match status.as_deref() {
        None => Err(EngineError::not_found("certificate")),
        Some("validated") => Ok(()),
        Some(_) => {
            conn.execute(
                "UPDATE certificates SET status = 'validated' WHERE id = ?",
                [id],
            )?;
            Ok(())
        }
    }
}

pub fn attach_document(conn: &Connection, id: &str, path: &str) -> Result<(), EngineError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT student_id, status FROM certificates WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => Err(EngineError::not_found("certificate")),
        Some((student_id, status)) if status != "validated" => {
            Err(EngineError::NotValidated { student_id })
        }
        Some(_) => {
            conn.execute(
                "UPDATE certificates SET signed_document_path = ? WHERE id = ?",
                (path, id),
            )?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
        let conn = db::open_db(&temp_workspace("bulletind-cert-test")).expect("open db");
        conn.execute("INSERT INTO classes(id, name) VALUES('c1', '6e A')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
             VALUES('s1', 'c1', 'Abena', 'Paul', 1, 0)",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn numbering_is_sequential_per_kind() {
        let mut conn = seeded_conn();
        let a = issue(&mut conn, "s1", CertificateKind::Enrollment, "...").unwrap();
        let b = issue(&mut conn, "s1", CertificateKind::Enrollment, "...").unwrap();
        let c = issue(&mut conn, "s1", CertificateKind::Attendance, "...").unwrap();
        assert_eq!(a.number, 1);
        assert_eq!(b.number, 2);
        assert_eq!(c.number, 1);
    }

    #[test]
    fn validate_is_idempotent() {
        let mut conn = seeded_conn();
        let cert = issue(&mut conn, "s1", CertificateKind::Attendance, "...").unwrap();
        mark_validated(&conn, &cert.id).expect("validate");
        mark_validated(&conn, &cert.id).expect("revalidate is a no-op");
        assert_eq!(get(&conn, &cert.id).unwrap().status, "validated");
    }

    #[test]
    fn document_attaches_only_after_validation() {
        let mut conn = seeded_conn();
        let cert = issue(&mut conn, "s1", CertificateKind::Enrollment, "...").unwrap();
        let err = attach_document(&conn, &cert.id, "out/cert.pdf").unwrap_err();
        assert!(matches!(err, EngineError::NotValidated { .. }));

        mark_validated(&conn, &cert.id).unwrap();
        attach_document(&conn, &cert.id, "out/cert.pdf").expect("attach");
        assert_eq!(
            get(&conn, &cert.id).unwrap().signed_document_path.as_deref(),
            Some("out/cert.pdf")
        );
    }

    #[test]
    fn unknown_student_is_not_found() {
        let mut conn = seeded_conn();
        let err = issue(&mut conn, "nope", CertificateKind::Enrollment, "...").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}

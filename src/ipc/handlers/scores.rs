use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct TermRow {
    active_sequence: i64,
    closed: bool,
}

fn fetch_term(conn: &Connection, term_id: &str) -> Result<Option<TermRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT active_sequence, closed FROM terms WHERE id = ?",
        [term_id],
        |r| {
            Ok(TermRow {
                active_sequence: r.get(0)?,
                closed: r.get::<_, i64>(1)? != 0,
            })
        },
    )
    .optional()
}

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = match required_f64(req, "value") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(0.0..=20.0).contains(&value) {
        return err(
            &req.id,
            "bad_params",
            "value must be within the 0-20 scale",
            Some(json!({ "value": value })),
        );
    }

    let term = match fetch_term(conn, &term_id) {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "term not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if term.closed {
        return err(
            &req.id,
            "term_closed",
            format!("term {} is closed", term_id),
            None,
        );
    }

    let class_id: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_id) = class_id else {
        return err(&req.id, "not_found", "student not found", None);
    };

    // Once any bulletin of the class is validated for the term, the marks
    // feeding it are frozen too.
    match store::first_validated_student(conn, &class_id, &term_id) {
        Ok(None) => {}
        Ok(Some(frozen)) => {
            return err(
                &req.id,
                "already_validated",
                "a validated bulletin freezes this term's scores",
                Some(json!({ "studentId": frozen })),
            )
        }
        Err(e) => return engine_err(&req.id, &e),
    }

    // New marks land in the term's active sequence unless told otherwise.
    let sequence = optional_i64(req, "sequence").unwrap_or(term.active_sequence);
    if sequence < 1 {
        return err(&req.id, "bad_params", "sequence must be >= 1", None);
    }
    let eval_kind = optional_str(req, "evalKind").unwrap_or_else(|| "written".to_string());
    let date = optional_str(req, "date");
    let remark = optional_str(req, "remark");

    let id = Uuid::new_v4().to_string();
    let res = conn.execute(
        "INSERT INTO scores(id, student_id, assignment_id, term_id, sequence, value, eval_kind, date, remark)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, assignment_id, term_id, sequence, eval_kind) DO UPDATE SET
            value = excluded.value,
            date = excluded.date,
            remark = excluded.remark",
        rusqlite::params![
            id,
            student_id,
            assignment_id,
            term_id,
            sequence,
            value,
            eval_kind,
            date,
            remark
        ],
    );
    if let Err(e) = res {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "studentId": student_id, "sequence": sequence, "value": value }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, assignment_id, sequence, value, eval_kind, date, remark
         FROM scores
         WHERE student_id = ? AND term_id = ?
         ORDER BY assignment_id, sequence",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &term_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "assignmentId": r.get::<_, String>(1)?,
                "sequence": r.get::<_, i64>(2)?,
                "value": r.get::<_, f64>(3)?,
                "evalKind": r.get::<_, String>(4)?,
                "date": r.get::<_, Option<String>>(5)?,
                "remark": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_record(state, req)),
        "scores.list" => Some(handle_list(state, req)),
        _ => None,
    }
}

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year = match required_str(req, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sort_order = optional_i64(req, "sortOrder").unwrap_or(0);
    let id = optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO terms(id, school_year, label, sort_order) VALUES(?, ?, ?, ?)",
        (&id, &school_year, &label, sort_order),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "termId": id }))
}

/// Closing is terminal: it rejects later score mutation, draft generation
/// and validation for the term. There is no reopen.
fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("UPDATE terms SET closed = 1 WHERE id = ?", [&term_id]) {
        Ok(0) => err(&req.id, "not_found", "term not found", None),
        Ok(_) => ok(&req.id, json!({ "termId": term_id, "closed": true })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_set_active_sequence(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(sequence) = optional_i64(req, "sequence") else {
        return err(&req.id, "bad_params", "missing sequence", None);
    };
    if sequence < 1 {
        return err(&req.id, "bad_params", "sequence must be >= 1", None);
    }
    let closed: Option<i64> = match conn
        .query_row("SELECT closed FROM terms WHERE id = ?", [&term_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match closed {
        None => return err(&req.id, "not_found", "term not found", None),
        Some(c) if c != 0 => {
            return err(&req.id, "term_closed", format!("term {} is closed", term_id), None)
        }
        Some(_) => {}
    }
    if let Err(e) = conn.execute(
        "UPDATE terms SET active_sequence = ? WHERE id = ?",
        (sequence, &term_id),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "termId": term_id, "activeSequence": sequence }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, school_year, label, sort_order, active_sequence, closed
         FROM terms ORDER BY school_year, sort_order",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolYear": r.get::<_, String>(1)?,
                "label": r.get::<_, String>(2)?,
                "sortOrder": r.get::<_, i64>(3)?,
                "activeSequence": r.get::<_, i64>(4)?,
                "closed": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(terms) => ok(&req.id, json!({ "terms": terms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "terms.create" => Some(handle_create(state, req)),
        "terms.close" => Some(handle_close(state, req)),
        "terms.setActiveSequence" => Some(handle_set_active_sequence(state, req)),
        "terms.list" => Some(handle_list(state, req)),
        _ => None,
    }
}

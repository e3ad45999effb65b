use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

// Roster ingestion. The surrounding application owns the full CRUD screens;
// the daemon only needs enough surface to be fed the entities the engine
// reads.

fn given_or_new_id(req: &Request) -> String {
    optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn handle_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = given_or_new_id(req);
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (&id, &name),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "classId": id }))
}

fn handle_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_no = optional_str(req, "studentNo");
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let sort_order = optional_i64(req, "sortOrder").unwrap_or(0);
    let id = given_or_new_id(req);
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            class_id = excluded.class_id,
            last_name = excluded.last_name,
            first_name = excluded.first_name,
            student_no = excluded.student_no,
            active = excluded.active,
            sort_order = excluded.sort_order",
        (
            &id,
            &class_id,
            &last_name,
            &first_name,
            &student_no,
            active as i64,
            sort_order,
        ),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": id }))
}

fn handle_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = given_or_new_id(req);
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, last_name, first_name) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            last_name = excluded.last_name,
            first_name = excluded.first_name",
        (&id, &last_name, &first_name),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacherId": id }))
}

fn handle_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let short_code = match required_str(req, "shortCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = given_or_new_id(req);
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, short_code) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            short_code = excluded.short_code",
        (&id, &name, &short_code),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "subjectId": id }))
}

fn handle_assignment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = optional_str(req, "teacherId");
    let coefficient = optional_i64(req, "coefficient").unwrap_or(1);
    if coefficient < 1 {
        return err(
            &req.id,
            "bad_params",
            "coefficient must be a positive integer",
            Some(json!({ "coefficient": coefficient })),
        );
    }
    let id = given_or_new_id(req);
    if let Err(e) = conn.execute(
        "INSERT INTO subject_assignments(id, subject_id, class_id, teacher_id, coefficient)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(subject_id, class_id) DO UPDATE SET
            teacher_id = excluded.teacher_id,
            coefficient = excluded.coefficient",
        (&id, &subject_id, &class_id, &teacher_id, coefficient),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    // The upsert may have kept an earlier row id; report the effective one.
    let effective: Result<String, _> = conn.query_row(
        "SELECT id FROM subject_assignments WHERE subject_id = ? AND class_id = ?",
        (&subject_id, &class_id),
        |r| r.get(0),
    );
    match effective {
        Ok(assignment_id) => ok(&req.id, json!({ "assignmentId": assignment_id })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.class" => Some(handle_class(state, req)),
        "setup.student" => Some(handle_student(state, req)),
        "setup.teacher" => Some(handle_teacher(state, req)),
        "setup.subject" => Some(handle_subject(state, req)),
        "setup.assignment" => Some(handle_assignment(state, req)),
        _ => None,
    }
}

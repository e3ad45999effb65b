use crate::archive;
use crate::bulletin::{self, GenerateMode};
use crate::db;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, db_conn_mut, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;
use std::path::PathBuf;

fn handle_generate(state: &mut AppState, req: &Request, mode: GenerateMode) -> serde_json::Value {
    let conn = match db_conn_mut(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cfg = match db::load_calc_config(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match bulletin::generate_class_drafts(conn, &class_id, &term_id, &cfg, mode) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match store::mark_validated(conn, &student_id, &term_id) {
        Ok(()) => ok(
            &req.id,
            json!({ "studentId": student_id, "termId": term_id, "status": "validated" }),
        ),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match store::get(conn, &student_id, &term_id) {
        Ok(record) => ok(&req.id, json!({ "bulletin": record })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_set_remark(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let remark = match required_str(req, "remark") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::set_remark(conn, &student_id, &term_id, &remark) {
        Ok(()) => ok(&req.id, json!({ "studentId": student_id, "termId": term_id })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_attach_document(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::attach_document(conn, &student_id, &term_id, &path) {
        Ok(()) => ok(&req.id, json!({ "studentId": student_id, "path": path })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_class_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match bulletin::class_sheet(conn, &class_id, &term_id) {
        Ok(rows) => ok(&req.id, json!({ "students": rows })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    match archive::export_bulletin_bundle(conn, &class_id, &term_id, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "outPath": out_path.to_string_lossy(),
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bulletins.generate" => Some(handle_generate(state, req, GenerateMode::Regenerate)),
        "bulletins.supersede" => Some(handle_generate(state, req, GenerateMode::Supersede)),
        "bulletins.validate" => Some(handle_validate(state, req)),
        "bulletins.get" => Some(handle_get(state, req)),
        "bulletins.setRemark" => Some(handle_set_remark(state, req)),
        "bulletins.attachDocument" => Some(handle_attach_document(state, req)),
        "bulletins.classSheet" => Some(handle_class_sheet(state, req)),
        "bulletins.exportBundle" => Some(handle_export_bundle(state, req)),
        _ => None,
    }
}

use crate::certificate::{self, CertificateKind};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, db_conn_mut, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_issue(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn_mut(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind_raw = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(kind) = CertificateKind::parse(&kind_raw) else {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: enrollment, attendance",
            Some(json!({ "kind": kind_raw })),
        );
    };
    let body = match required_str(req, "body") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match certificate::issue(conn, &student_id, kind, &body) {
        Ok(record) => ok(&req.id, json!({ "certificate": record })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let certificate_id = match required_str(req, "certificateId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match certificate::mark_validated(conn, &certificate_id) {
        Ok(()) => ok(
            &req.id,
            json!({ "certificateId": certificate_id, "status": "validated" }),
        ),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let certificate_id = match required_str(req, "certificateId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match certificate::get(conn, &certificate_id) {
        Ok(record) => ok(&req.id, json!({ "certificate": record })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_attach_document(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let certificate_id = match required_str(req, "certificateId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match certificate::attach_document(conn, &certificate_id, &path) {
        Ok(()) => ok(&req.id, json!({ "certificateId": certificate_id, "path": path })),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "certificates.issue" => Some(handle_issue(state, req)),
        "certificates.validate" => Some(handle_validate(state, req)),
        "certificates.get" => Some(handle_get(state, req)),
        "certificates.attachDocument" => Some(handle_attach_document(state, req)),
        _ => None,
    }
}

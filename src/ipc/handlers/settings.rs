use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::load_calc_config(conn) {
        Ok(cfg) => ok(&req.id, json!({ "calc": cfg })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(threshold) = req.params.get("passingThreshold").and_then(|v| v.as_f64()) {
        if !(0.0..=20.0).contains(&threshold) {
            return err(
                &req.id,
                "bad_params",
                "passingThreshold must be within the 0-20 scale",
                Some(json!({ "passingThreshold": threshold })),
            );
        }
        if let Err(e) = db::settings_set_json(conn, "calc.passingThreshold", &json!(threshold)) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    if let Some(decimals) = req.params.get("roundDecimals").and_then(|v| v.as_u64()) {
        if decimals > 4 {
            return err(
                &req.id,
                "bad_params",
                "roundDecimals must be between 0 and 4",
                Some(json!({ "roundDecimals": decimals })),
            );
        }
        if let Err(e) = db::settings_set_json(conn, "calc.roundDecimals", &json!(decimals)) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }
    match db::load_calc_config(conn) {
        Ok(cfg) => ok(&req.id, json!({ "calc": cfg })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_get(state, req)),
        "settings.update" => Some(handle_update(state, req)),
        _ => None,
    }
}

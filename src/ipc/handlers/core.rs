use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bad_params, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn scoring_config_get(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!(scoring::load_config(conn)))
}

fn scoring_config_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut cfg = scoring::load_config(conn);
    if let Some(v) = params.get("passMark").and_then(|v| v.as_f64()) {
        if !(0.0..=100.0).contains(&v) {
            return Err(bad_params("passMark must be between 0 and 100"));
        }
        cfg.pass_mark = v;
    }
    if let Some(v) = params.get("asrMinRatio").and_then(|v| v.as_f64()) {
        if !(0.0..=1.0).contains(&v) {
            return Err(bad_params("asrMinRatio must be between 0 and 1"));
        }
        cfg.asr_min_ratio = v;
    }
    if let Some(v) = params.get("emotionDefaultThreshold").and_then(|v| v.as_f64()) {
        if !(0.0..=1.0).contains(&v) {
            return Err(bad_params("emotionDefaultThreshold must be between 0 and 1"));
        }
        cfg.emotion_default_threshold = v;
    }
    if let Some(map) = params.get("emotionThresholds").and_then(|v| v.as_object()) {
        for (label, value) in map {
            let Some(t) = value.as_f64() else {
                return Err(bad_params("emotionThresholds values must be numbers"));
            };
            if !(0.0..=1.0).contains(&t) {
                return Err(bad_params("emotionThresholds values must be between 0 and 1"));
            }
            cfg.emotion_thresholds.insert(label.clone(), t);
        }
    }
    scoring::save_config(conn, &cfg)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!(cfg))
}

fn handle_scoring_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match scoring_config_get(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_scoring_config_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match scoring_config_set(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "scoring.config.get" => Some(handle_scoring_config_get(state, req)),
        "scoring.config.set" => Some(handle_scoring_config_set(state, req)),
        _ => None,
    }
}

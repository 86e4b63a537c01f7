use base64::Engine;
use serde_json::Value;

use crate::ipc::error::err;
use crate::progress::ProgressError;

/// Handler-side error carrying a stable wire code. Logic functions return
/// `Result<Value, HandlerErr>` and the thin `handle_*` wrappers turn the Err
/// arm into the error envelope.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        HandlerErr {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: Value) -> Self {
        HandlerErr {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<ProgressError> for HandlerErr {
    fn from(e: ProgressError) -> Self {
        HandlerErr {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("not_found", message)
}

pub fn db_query(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_insert(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_insert_failed", e.to_string())
}

pub fn db_update(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_update_failed", e.to_string())
}

pub fn db_tx(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

pub fn db_commit(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_commit_failed", e.to_string())
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn get_optional_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn get_str_array(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(bad_params(format!("missing {}", key)));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(bad_params(format!("{} must be an array of strings", key)));
        };
        out.push(s.to_string());
    }
    Ok(out)
}

pub fn decode_b64_param(params: &Value, key: &str) -> Result<Vec<u8>, HandlerErr> {
    let raw = get_required_str(params, key)?;
    base64::engine::general_purpose::STANDARD
        .decode(raw.as_bytes())
        .map_err(|_| bad_params(format!("{} is not valid base64", key)))
}

use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::capabilities::{EchoTranscriber, ExpressionDetector, HeuristicDetector, Transcriber};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub transcriber: Box<dyn Transcriber>,
    pub detector: Box<dyn ExpressionDetector>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            transcriber: Box::new(EchoTranscriber),
            detector: Box::new(HeuristicDetector),
        }
    }
}

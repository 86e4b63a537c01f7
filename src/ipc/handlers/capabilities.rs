use crate::capabilities::{ExpressionDetector, Transcriber};
use crate::ipc::error::ok;
use crate::ipc::helpers::{decode_b64_param, get_optional_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, ScoringConfig};
use serde_json::json;

fn io_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("io_failed", e.to_string())
}

// Analysis-only surface: neither op touches the workspace database, so a
// client can probe the capabilities before selecting one.

fn asr_transcribe(
    transcriber: &dyn Transcriber,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let audio = decode_b64_param(params, "audioB64")?;
    let lang = get_optional_str(params, "lang")
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "en".to_string());
    let t = transcriber.transcribe(&audio, &lang).map_err(io_failed)?;
    Ok(json!({
        "text": t.text,
        "confidence": t.confidence,
        "lang": lang,
    }))
}

fn emotion_analyze(
    detector: &dyn ExpressionDetector,
    cfg: &ScoringConfig,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let image = decode_b64_param(params, "imageB64")?;
    let d = detector.detect(&image).map_err(io_failed)?;
    let all_scores: Vec<serde_json::Value> = d
        .all_scores
        .iter()
        .map(|(label, score)| json!({ "label": label, "score": score }))
        .collect();
    let mut out = json!({
        "label": d.label,
        "canonicalLabel": scoring::canonical_emotion(&d.label),
        "confidence": d.confidence,
        "allScores": all_scores,
    });
    if let Some(expected) = get_optional_str(params, "expected") {
        let score = scoring::score_emotion(cfg, &expected, &d.label, d.confidence);
        out["score"] = json!(score);
        out["match"] = json!(score == 100.0);
    }
    Ok(out)
}

fn handle_asr_transcribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    match asr_transcribe(state.transcriber.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_emotion_analyze(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = match state.db.as_ref() {
        Some(conn) => scoring::load_config(conn),
        None => ScoringConfig::default(),
    };
    match emotion_analyze(state.detector.as_ref(), &cfg, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "asr.transcribe" => Some(handle_asr_transcribe(state, req)),
        "emotion.analyze" => Some(handle_emotion_analyze(state, req)),
        _ => None,
    }
}

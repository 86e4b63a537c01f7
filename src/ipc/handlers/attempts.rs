use crate::achievements;
use crate::capabilities::{ExpressionDetector, Transcriber};
use crate::content;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, db_insert, db_query, decode_b64_param, get_optional_i64, get_optional_str,
    get_required_str, not_found, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::progress;
use crate::scoring;
use log::warn;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ActivityRow {
    id: String,
    lesson_id: String,
    activity_type: String,
    layout: String,
    data: serde_json::Value,
}

fn load_activity(conn: &Connection, activity_id: &str) -> Result<Option<ActivityRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, lesson_id, activity_type, layout, data FROM activities
         WHERE id = ? AND is_active = 1",
        [activity_id],
        |r| {
            let data_text: String = r.get(4)?;
            Ok(ActivityRow {
                id: r.get(0)?,
                lesson_id: r.get(1)?,
                activity_type: r.get(2)?,
                layout: r.get(3)?,
                data: serde_json::from_str(&data_text).unwrap_or_else(|_| json!({})),
            })
        },
    )
    .optional()
    .map_err(db_query)
}

struct ScoreOutcome {
    score: f64,
    evidence: serde_json::Value,
}

/// Scores one submission against the activity's resolved branch. Capability
/// failures and missing content degrade to a zero score; only malformed
/// input is an error.
fn score_submission(
    cfg: &scoring::ScoringConfig,
    transcriber: &dyn Transcriber,
    detector: &dyn ExpressionDetector,
    activity: &ActivityRow,
    lang: &str,
    submission: &serde_json::Value,
) -> Result<ScoreOutcome, HandlerErr> {
    let branch = content::resolve_branch(&activity.data, lang);
    match activity.activity_type.as_str() {
        "asr" => {
            let heard = if submission.get("audioB64").is_some() {
                let audio = decode_b64_param(submission, "audioB64")?;
                match transcriber.transcribe(&audio, lang) {
                    Ok(t) => t.text,
                    Err(e) => {
                        warn!("transcription failed for activity {}: {}", activity.id, e);
                        String::new()
                    }
                }
            } else {
                submission
                    .get("heardText")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let Some(expected) = branch.expected_speech else {
                warn!(
                    "activity {} has no expected speech for lang {}",
                    activity.id, lang
                );
                return Ok(ScoreOutcome {
                    score: 0.0,
                    evidence: json!({ "heard": heard }),
                });
            };
            let score = scoring::score_speech(cfg, &expected, &heard);
            Ok(ScoreOutcome {
                score,
                evidence: json!({ "heard": heard, "expected": expected }),
            })
        }
        "emotion" => {
            let (label, confidence) = if submission.get("imageB64").is_some() {
                let image = decode_b64_param(submission, "imageB64")?;
                match detector.detect(&image) {
                    Ok(d) => (d.label, d.confidence),
                    Err(e) => {
                        warn!("expression detection failed for activity {}: {}", activity.id, e);
                        ("no_face".to_string(), 0.0)
                    }
                }
            } else {
                (
                    submission
                        .get("detectedLabel")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    submission
                        .get("confidence")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                )
            };
            let Some(expected) = branch.expected_emotion else {
                warn!(
                    "activity {} has no expected emotion for lang {}",
                    activity.id, lang
                );
                return Ok(ScoreOutcome {
                    score: 0.0,
                    evidence: json!({ "detectedLabel": label, "confidence": confidence }),
                });
            };
            let score = scoring::score_emotion(cfg, &expected, &label, confidence);
            Ok(ScoreOutcome {
                score,
                evidence: json!({
                    "detectedLabel": label,
                    "confidence": confidence,
                    "expected": expected,
                }),
            })
        }
        // mcq, recognition and listening all answer with a choice key.
        _ => {
            let submitted = submission
                .get("choiceKey")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let Some(expected) = branch.correct_key else {
                warn!(
                    "activity {} has no correct key for lang {}",
                    activity.id, lang
                );
                return Ok(ScoreOutcome {
                    score: 0.0,
                    evidence: json!({ "choiceKey": submitted }),
                });
            };
            let score = scoring::score_choice(&expected, submitted);
            Ok(ScoreOutcome {
                score,
                evidence: json!({ "choiceKey": submitted }),
            })
        }
    }
}

fn attempt_submit(
    conn: &Connection,
    transcriber: &dyn Transcriber,
    detector: &dyn ExpressionDetector,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let activity_id = get_required_str(params, "activityId")?;
    let submission = params.get("submission").cloned().unwrap_or_else(|| json!({}));
    if !submission.is_object() {
        return Err(bad_params("submission must be an object"));
    }

    let preferred_lang: Option<String> = conn
        .query_row(
            "SELECT preferred_lang FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let Some(preferred_lang) = preferred_lang else {
        return Err(not_found("student not found"));
    };
    let Some(activity) = load_activity(conn, &activity_id)? else {
        return Err(not_found("activity not found"));
    };
    let lang = get_optional_str(params, "lang")
        .filter(|l| !l.trim().is_empty())
        .unwrap_or(preferred_lang);

    let cfg = scoring::load_config(conn);
    let skipped = submission.get("action").and_then(|v| v.as_str()) == Some("skip");
    let outcome = if skipped {
        ScoreOutcome {
            score: 0.0,
            evidence: json!({}),
        }
    } else {
        score_submission(&cfg, transcriber, detector, &activity, &lang, &submission)?
    };

    let mut meta = json!({
        "action": if skipped { "skip" } else { "submit" },
        "layout": activity.layout,
        "lang": lang,
        "submission": submission,
    });
    if skipped {
        meta["skipped"] = json!(true);
    }
    if let Some(session_id) = get_optional_str(params, "sessionId") {
        meta["sessionId"] = json!(session_id);
    }
    if let Some(wrong) = submission.get("wrongCount").and_then(|v| v.as_i64()) {
        meta["wrongCount"] = json!(wrong);
    }
    if let Some(evidence) = outcome.evidence.as_object() {
        for (k, v) in evidence {
            meta[k.as_str()] = v.clone();
        }
    }

    // The ledger write comes first; nothing downstream runs without it.
    let attempt_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attempts(id, student_id, activity_id, score, meta, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &attempt_id,
            &student_id,
            &activity.id,
            outcome.score,
            meta.to_string(),
            db::now_iso(),
        ),
    )
    .map_err(db_insert)?;

    progress::recompute_completion(conn, &student_id, &activity.lesson_id, cfg.pass_mark)?;

    let awards = achievements::evaluate(
        conn,
        &student_id,
        outcome.score,
        Some(&activity.lesson_id),
        Some(&activity.layout),
        cfg.pass_mark,
    );

    Ok(json!({
        "attemptId": attempt_id,
        "score": outcome.score,
        "passed": outcome.score >= cfg.pass_mark,
        "inlineAchievements": awards.inline,
        "profileAchievements": awards.profile,
    }))
}

fn attempts_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let activity_id = get_optional_str(params, "activityId");
    let limit = get_optional_i64(params, "limit").unwrap_or(50).clamp(1, 500);

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        let meta_text: String = r.get(4)?;
        let meta =
            serde_json::from_str::<serde_json::Value>(&meta_text).unwrap_or_else(|_| json!({}));
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "activityId": r.get::<_, String>(2)?,
            "score": r.get::<_, f64>(3)?,
            "meta": meta,
            "createdAt": r.get::<_, String>(5)?,
        }))
    };

    let attempts = if let Some(activity_id) = activity_id {
        let mut stmt = conn
            .prepare(
                "SELECT id, student_id, activity_id, score, meta, created_at FROM attempts
                 WHERE student_id = ? AND activity_id = ?
                 ORDER BY rowid DESC
                 LIMIT ?",
            )
            .map_err(db_query)?;
        stmt.query_map((&student_id, &activity_id, limit), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?
    } else {
        let mut stmt = conn
            .prepare(
                "SELECT id, student_id, activity_id, score, meta, created_at FROM attempts
                 WHERE student_id = ?
                 ORDER BY rowid DESC
                 LIMIT ?",
            )
            .map_err(db_query)?;
        stmt.query_map((&student_id, limit), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?
    };

    Ok(json!({ "attempts": attempts }))
}

fn handle_attempt_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attempt_submit(
        conn,
        state.transcriber.as_ref(),
        state.detector.as_ref(),
        &req.params,
    ) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attempts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attempts_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempt.submit" => Some(handle_attempt_submit(state, req)),
        "attempts.list" => Some(handle_attempts_list(state, req)),
        _ => None,
    }
}

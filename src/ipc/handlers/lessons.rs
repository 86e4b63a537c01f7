use crate::content;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query, get_optional_str, get_required_str, not_found, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::progress;
use crate::scoring;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn student_preferred_lang(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT preferred_lang FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query)
}

/// Answer keys stay on this side of the wire; the client only ever sees
/// choices and prompts. Both the flat fields and per-language branches are
/// scrubbed.
fn strip_answer_keys(data: &serde_json::Value) -> serde_json::Value {
    let mut out = data.clone();
    if let Some(map) = out.as_object_mut() {
        map.retain(|k, _| !k.starts_with("correct_key") && k != "correctKey");
        if let Some(i18n) = map.get_mut("i18n").and_then(|v| v.as_object_mut()) {
            for branch in i18n.values_mut() {
                if let Some(b) = branch.as_object_mut() {
                    b.retain(|k, _| !k.starts_with("correct_key") && k != "correctKey");
                }
            }
        }
    }
    out
}

fn lesson_activities(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let lesson_id = get_required_str(params, "lessonId")?;
    let Some(preferred_lang) = student_preferred_lang(conn, &student_id)? else {
        return Err(not_found("student not found"));
    };
    let lang = get_optional_str(params, "lang")
        .filter(|l| !l.trim().is_empty())
        .unwrap_or(preferred_lang);

    let lesson_known: bool = conn
        .query_row(
            "SELECT 1 FROM lessons WHERE id = ? AND is_active = 1",
            [&lesson_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map(|v| v.is_some())
        .map_err(db_query)?;
    if !lesson_known {
        return Err(not_found("lesson not found"));
    }

    let pass_mark = scoring::load_config(conn).pass_mark;
    if !progress::can_start_lesson(conn, &student_id, &lesson_id, pass_mark)? {
        return Err(HandlerErr::with_details(
            "locked",
            "lesson is locked for this student",
            json!({ "lessonId": lesson_id }),
        ));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, activity_type, layout, sort_order, data FROM activities
             WHERE lesson_id = ? AND is_active = 1
             ORDER BY sort_order",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([&lesson_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut activities = Vec::with_capacity(rows.len());
    for (id, activity_type, layout, sort_order, data_text) in rows {
        let data = serde_json::from_str::<serde_json::Value>(&data_text)
            .unwrap_or_else(|_| json!({}));
        let branch = content::resolve_branch(&data, &lang);
        activities.push(json!({
            "id": id,
            "activityType": activity_type,
            "layout": layout,
            "sortOrder": sort_order,
            "prompt": branch.prompt,
            "expectedSpeech": branch.expected_speech,
            "expectedEmotion": branch.expected_emotion,
            "data": strip_answer_keys(&data),
        }));
    }

    Ok(json!({
        "lessonId": lesson_id,
        "lang": lang,
        "activities": activities,
    }))
}

fn lesson_complete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let lesson_id = get_required_str(params, "lessonId")?;
    if student_preferred_lang(conn, &student_id)?.is_none() {
        return Err(not_found("student not found"));
    }
    let pass_mark = scoring::load_config(conn).pass_mark;
    let outcome = progress::complete_lesson(conn, &student_id, &lesson_id, pass_mark)?;
    Ok(json!(outcome))
}

fn handle_lesson_activities(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match lesson_activities(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_lesson_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match lesson_complete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lesson.activities" => Some(handle_lesson_activities(state, req)),
        "lesson.complete" => Some(handle_lesson_complete(state, req)),
        _ => None,
    }
}

use crate::achievements;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, db_insert, db_query, db_update, get_optional_str, get_required_str, not_found,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const SPEECH_LEVELS: [&str; 3] = ["non_verbal", "emerging", "verbal"];

const STUDENT_COLS: &str =
    "id, display_name, speech_level, preferred_lang, graduated_at, created_at";

fn student_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "displayName": r.get::<_, String>(1)?,
        "speechLevel": r.get::<_, String>(2)?,
        "preferredLang": r.get::<_, String>(3)?,
        "graduatedAt": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, String>(5)?,
    }))
}

fn load_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLS),
        [student_id],
        student_json,
    )
    .optional()
    .map_err(db_query)
}

fn require_speech_level(value: &str) -> Result<(), HandlerErr> {
    if SPEECH_LEVELS.contains(&value) {
        return Ok(());
    }
    Err(bad_params(
        "speechLevel must be one of: non_verbal, emerging, verbal",
    ))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?;
    if display_name.trim().is_empty() {
        return Err(bad_params("displayName must not be empty"));
    }
    let speech_level = get_required_str(params, "speechLevel")?;
    require_speech_level(&speech_level)?;
    let preferred_lang = get_optional_str(params, "preferredLang").unwrap_or_else(|| "en".to_string());

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, display_name, speech_level, preferred_lang, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            display_name.trim(),
            &speech_level,
            &preferred_lang,
            db::now_iso(),
        ),
    )
    .map_err(db_insert)?;

    load_student(conn, &id)?.ok_or_else(|| not_found("student row missing after insert"))
}

fn students_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM students ORDER BY created_at, id",
            STUDENT_COLS
        ))
        .map_err(db_query)?;
    let students = stmt
        .query_map([], student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "students": students }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if load_student(conn, &student_id)?.is_none() {
        return Err(not_found("student not found"));
    }
    let patch = params.get("patch").cloned().unwrap_or_else(|| json!({}));
    if !patch.is_object() {
        return Err(bad_params("patch must be an object"));
    }

    if let Some(name) = patch.get("displayName").and_then(|v| v.as_str()) {
        if name.trim().is_empty() {
            return Err(bad_params("displayName must not be empty"));
        }
        conn.execute(
            "UPDATE students SET display_name = ? WHERE id = ?",
            (name.trim(), &student_id),
        )
        .map_err(db_update)?;
    }
    if let Some(level) = patch.get("speechLevel").and_then(|v| v.as_str()) {
        require_speech_level(level)?;
        conn.execute(
            "UPDATE students SET speech_level = ? WHERE id = ?",
            (level, &student_id),
        )
        .map_err(db_update)?;
    }
    if let Some(lang) = patch.get("preferredLang").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE students SET preferred_lang = ? WHERE id = ?",
            (lang, &student_id),
        )
        .map_err(db_update)?;
    }

    load_student(conn, &student_id)?.ok_or_else(|| not_found("student not found"))
}

fn graduation_counts(conn: &Connection, student_id: &str) -> Result<(i64, i64), HandlerErr> {
    let total: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM lessons WHERE is_active = 1",
            [],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    let completed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM lesson_progress lp
             JOIN lessons l ON l.id = lp.lesson_id AND l.is_active = 1
             WHERE lp.student_id = ? AND lp.status = 'completed'",
            [student_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    Ok((total, completed))
}

fn students_profile(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(student) = load_student(conn, &student_id)? else {
        return Err(not_found("student not found"));
    };

    let badges = achievements::list_for_student(conn, &student_id)
        .map_err(db_query)?
        .into_iter()
        .map(|(code, awarded_at)| json!({ "code": code, "awardedAt": awarded_at }))
        .collect::<Vec<_>>();

    let in_progress: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM lesson_progress lp
             JOIN lessons l ON l.id = lp.lesson_id AND l.is_active = 1
             WHERE lp.student_id = ? AND lp.status != 'completed'",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    let (total, completed) = graduation_counts(conn, &student_id)?;
    let pass_mark = scoring::load_config(conn).pass_mark;
    let passing_attempts: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attempts WHERE student_id = ? AND score >= ?",
            (&student_id, pass_mark),
            |r| r.get(0),
        )
        .map_err(db_query)?;

    let graduated_at = student.get("graduatedAt").cloned().unwrap_or(json!(null));
    Ok(json!({
        "student": student,
        "achievements": badges,
        "progress": {
            "lessonsCompleted": completed,
            "lessonsInProgress": in_progress,
            "totalActiveLessons": total,
            "passingAttempts": passing_attempts,
        },
        "graduation": {
            "allCompleted": total > 0 && completed == total,
            "graduatedAt": graduated_at,
        },
    }))
}

fn graduation_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let graduated_at: Option<String> = conn
        .query_row(
            "SELECT graduated_at FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| not_found("student not found"))?;
    let (total, completed) = graduation_counts(conn, &student_id)?;
    Ok(json!({
        "allCompleted": total > 0 && completed == total,
        "lessonsCompleted": completed,
        "totalActiveLessons": total,
        "graduatedAt": graduated_at,
    }))
}

fn graduation_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let graduated_at: Option<String> = conn
        .query_row(
            "SELECT graduated_at FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| not_found("student not found"))?;

    // Marking twice is a no-op that reports the original stamp.
    if let Some(existing) = graduated_at {
        return Ok(json!({ "graduatedAt": existing, "alreadyGraduated": true }));
    }

    let (total, completed) = graduation_counts(conn, &student_id)?;
    if total == 0 || completed < total {
        return Err(HandlerErr::with_details(
            "not_completed",
            "not every lesson is completed",
            json!({ "lessonsCompleted": completed, "totalActiveLessons": total }),
        ));
    }

    let now = db::now_iso();
    conn.execute(
        "UPDATE students SET graduated_at = ? WHERE id = ?",
        (&now, &student_id),
    )
    .map_err(db_update)?;
    Ok(json!({ "graduatedAt": now, "alreadyGraduated": false }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_profile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_profile(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_graduation_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match graduation_status(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_graduation_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match graduation_mark(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.profile" => Some(handle_students_profile(state, req)),
        "graduation.status" => Some(handle_graduation_status(state, req)),
        "graduation.mark" => Some(handle_graduation_mark(state, req)),
        _ => None,
    }
}

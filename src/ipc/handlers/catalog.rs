use crate::content;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, db_commit, db_insert, db_query, db_tx, db_update, get_optional_bool,
    get_optional_i64, get_required_str, get_str_array, not_found, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn chapter_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "sortOrder": r.get::<_, i64>(2)?,
    }))
}

fn lesson_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "chapterId": r.get::<_, String>(1)?,
        "title": r.get::<_, String>(2)?,
        "sortOrder": r.get::<_, i64>(3)?,
        "isActive": r.get::<_, i64>(4)? != 0,
    }))
}

const ACTIVITY_COLS: &str =
    "id, lesson_id, activity_type, layout, sort_order, data, is_active, created_at";

fn activity_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let data_text: String = r.get(5)?;
    let data = serde_json::from_str::<serde_json::Value>(&data_text).unwrap_or_else(|_| json!({}));
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "lessonId": r.get::<_, String>(1)?,
        "activityType": r.get::<_, String>(2)?,
        "layout": r.get::<_, String>(3)?,
        "sortOrder": r.get::<_, i64>(4)?,
        "data": data,
        "isActive": r.get::<_, i64>(6)? != 0,
        "createdAt": r.get::<_, String>(7)?,
    }))
}

fn chapters_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    if title.trim().is_empty() {
        return Err(bad_params("title must not be empty"));
    }
    let sort_order = match get_optional_i64(params, "sortOrder") {
        Some(v) if v >= 1 => v,
        Some(_) => return Err(bad_params("sortOrder must be >= 1")),
        None => {
            let max: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sort_order), 0) FROM chapters",
                    [],
                    |r| r.get(0),
                )
                .map_err(db_query)?;
            max + 1
        }
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO chapters(id, title, sort_order) VALUES(?, ?, ?)",
        (&id, title.trim(), sort_order),
    )
    .map_err(db_insert)?;

    conn.query_row(
        "SELECT id, title, sort_order FROM chapters WHERE id = ?",
        [&id],
        chapter_json,
    )
    .map_err(db_query)
}

fn chapters_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, title, sort_order FROM chapters ORDER BY sort_order")
        .map_err(db_query)?;
    let chapters = stmt
        .query_map([], chapter_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "chapters": chapters }))
}

fn chapter_exists(conn: &Connection, chapter_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM chapters WHERE id = ?", [chapter_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query)
}

fn lessons_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let chapter_id = get_required_str(params, "chapterId")?;
    if !chapter_exists(conn, &chapter_id)? {
        return Err(not_found("chapter not found"));
    }
    let title = get_required_str(params, "title")?;
    if title.trim().is_empty() {
        return Err(bad_params("title must not be empty"));
    }
    let sort_order = match get_optional_i64(params, "sortOrder") {
        Some(v) if v >= 1 => v,
        Some(_) => return Err(bad_params("sortOrder must be >= 1")),
        None => {
            let max: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sort_order), 0) FROM lessons
                     WHERE chapter_id = ? AND is_active = 1",
                    [&chapter_id],
                    |r| r.get(0),
                )
                .map_err(db_query)?;
            max + 1
        }
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO lessons(id, chapter_id, title, sort_order) VALUES(?, ?, ?, ?)",
        (&id, &chapter_id, title.trim(), sort_order),
    )
    .map_err(db_insert)?;

    conn.query_row(
        "SELECT id, chapter_id, title, sort_order, is_active FROM lessons WHERE id = ?",
        [&id],
        lesson_json,
    )
    .map_err(db_query)
}

fn lessons_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let chapter_id = get_required_str(params, "chapterId")?;
    if !chapter_exists(conn, &chapter_id)? {
        return Err(not_found("chapter not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, chapter_id, title, sort_order, is_active FROM lessons
             WHERE chapter_id = ? AND is_active = 1
             ORDER BY sort_order",
        )
        .map_err(db_query)?;
    let lessons = stmt
        .query_map([&chapter_id], lesson_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "lessons": lessons }))
}

fn active_lesson_ids(conn: &Connection, chapter_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM lessons
             WHERE chapter_id = ? AND is_active = 1
             ORDER BY sort_order",
        )
        .map_err(db_query)?;
    stmt.query_map([chapter_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)
}

fn require_permutation(given: &[String], current: &[String], what: &str) -> Result<(), HandlerErr> {
    let given_set: HashSet<&str> = given.iter().map(|s| s.as_str()).collect();
    let current_set: HashSet<&str> = current.iter().map(|s| s.as_str()).collect();
    if given.len() != given_set.len() {
        return Err(bad_params(format!("{} contains duplicates", what)));
    }
    if given_set != current_set {
        return Err(bad_params(format!(
            "{} must be exactly the current active set",
            what
        )));
    }
    Ok(())
}

fn lessons_reorder(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let chapter_id = get_required_str(params, "chapterId")?;
    if !chapter_exists(conn, &chapter_id)? {
        return Err(not_found("chapter not found"));
    }
    let lesson_ids = get_str_array(params, "lessonIds")?;
    let current = active_lesson_ids(conn, &chapter_id)?;
    require_permutation(&lesson_ids, &current, "lessonIds")?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    // Two passes through negative keys keep intermediate orders disjoint
    // from the final 1..N range.
    for (i, lesson_id) in lesson_ids.iter().enumerate() {
        tx.execute(
            "UPDATE lessons SET sort_order = ? WHERE id = ? AND chapter_id = ?",
            (-(i as i64 + 1), lesson_id, &chapter_id),
        )
        .map_err(db_update)?;
    }
    for (i, lesson_id) in lesson_ids.iter().enumerate() {
        tx.execute(
            "UPDATE lessons SET sort_order = ? WHERE id = ? AND chapter_id = ?",
            (i as i64 + 1, lesson_id, &chapter_id),
        )
        .map_err(db_update)?;
    }
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true, "count": lesson_ids.len() }))
}

fn load_activity(
    conn: &Connection,
    activity_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM activities WHERE id = ?", ACTIVITY_COLS),
        [activity_id],
        activity_json,
    )
    .optional()
    .map_err(db_query)
}

fn activities_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = get_required_str(params, "lessonId")?;
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

    let activity_type = get_required_str(params, "activityType")?;
    if !content::is_valid_activity_type(&activity_type) {
        return Err(bad_params(format!(
            "activityType must be one of: {}",
            content::ACTIVITY_TYPES.join(", ")
        )));
    }
    let layout = get_required_str(params, "layout")?;
    if !content::is_valid_layout(&layout) {
        return Err(bad_params(format!(
            "layout must be one of: {}",
            content::LAYOUTS.join(", ")
        )));
    }
    let data = params.get("data").cloned().unwrap_or_else(|| json!({}));
    if !data.is_object() {
        return Err(bad_params("data must be an object"));
    }
    let sort_order = match get_optional_i64(params, "sortOrder") {
        Some(v) if v >= 1 => v,
        Some(_) => return Err(bad_params("sortOrder must be >= 1")),
        None => {
            let max: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sort_order), 0) FROM activities
                     WHERE lesson_id = ? AND is_active = 1",
                    [&lesson_id],
                    |r| r.get(0),
                )
                .map_err(db_query)?;
            max + 1
        }
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO activities(id, lesson_id, activity_type, layout, sort_order, data, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &lesson_id,
            &activity_type,
            &layout,
            sort_order,
            data.to_string(),
            db::now_iso(),
        ),
    )
    .map_err(db_insert)?;

    load_activity(conn, &id)?.ok_or_else(|| not_found("activity row missing after insert"))
}

fn activities_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = get_required_str(params, "lessonId")?;
    let include_inactive = get_optional_bool(params, "includeInactive").unwrap_or(false);
    let sql = if include_inactive {
        format!(
            "SELECT {} FROM activities WHERE lesson_id = ? ORDER BY sort_order, rowid",
            ACTIVITY_COLS
        )
    } else {
        format!(
            "SELECT {} FROM activities WHERE lesson_id = ? AND is_active = 1 ORDER BY sort_order",
            ACTIVITY_COLS
        )
    };
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let activities = stmt
        .query_map([&lesson_id], activity_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "activities": activities }))
}

fn activities_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    if load_activity(conn, &activity_id)?.is_none() {
        return Err(not_found("activity not found"));
    }
    let patch = params.get("patch").cloned().unwrap_or_else(|| json!({}));
    if !patch.is_object() {
        return Err(bad_params("patch must be an object"));
    }

    if let Some(t) = patch.get("activityType").and_then(|v| v.as_str()) {
        if !content::is_valid_activity_type(t) {
            return Err(bad_params(format!(
                "activityType must be one of: {}",
                content::ACTIVITY_TYPES.join(", ")
            )));
        }
        conn.execute(
            "UPDATE activities SET activity_type = ? WHERE id = ?",
            (t, &activity_id),
        )
        .map_err(db_update)?;
    }
    if let Some(l) = patch.get("layout").and_then(|v| v.as_str()) {
        if !content::is_valid_layout(l) {
            return Err(bad_params(format!(
                "layout must be one of: {}",
                content::LAYOUTS.join(", ")
            )));
        }
        conn.execute(
            "UPDATE activities SET layout = ? WHERE id = ?",
            (l, &activity_id),
        )
        .map_err(db_update)?;
    }
    if let Some(data) = patch.get("data") {
        if !data.is_object() {
            return Err(bad_params("data must be an object"));
        }
        conn.execute(
            "UPDATE activities SET data = ? WHERE id = ?",
            (data.to_string(), &activity_id),
        )
        .map_err(db_update)?;
    }
    if let Some(sort) = patch.get("sortOrder").and_then(|v| v.as_i64()) {
        if sort < 1 {
            return Err(bad_params("sortOrder must be >= 1"));
        }
        conn.execute(
            "UPDATE activities SET sort_order = ? WHERE id = ?",
            (sort, &activity_id),
        )
        .map_err(db_update)?;
    }

    load_activity(conn, &activity_id)?.ok_or_else(|| not_found("activity not found"))
}

fn activities_soft_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let activity_id = get_required_str(params, "activityId")?;
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT lesson_id, is_active FROM activities WHERE id = ?",
            [&activity_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((lesson_id, is_active)) = row else {
        return Err(not_found("activity not found"));
    };
    if is_active == 0 {
        return Ok(json!({ "ok": true, "alreadyDeleted": true }));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "UPDATE activities SET is_active = 0, deleted_at = ? WHERE id = ?",
        (db::now_iso(), &activity_id),
    )
    .map_err(db_update)?;
    let moved = content::resequence_activities(&tx, &lesson_id).map_err(db_update)?;
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true, "alreadyDeleted": false, "resequenced": moved }))
}

fn activities_reorder(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = get_required_str(params, "lessonId")?;
    let activity_ids = get_str_array(params, "activityIds")?;
    let mut stmt = conn
        .prepare(
            "SELECT id FROM activities
             WHERE lesson_id = ? AND is_active = 1
             ORDER BY sort_order",
        )
        .map_err(db_query)?;
    let current = stmt
        .query_map([&lesson_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    require_permutation(&activity_ids, &current, "activityIds")?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (i, activity_id) in activity_ids.iter().enumerate() {
        tx.execute(
            "UPDATE activities SET sort_order = ? WHERE id = ? AND lesson_id = ?",
            (-(i as i64 + 1), activity_id, &lesson_id),
        )
        .map_err(db_update)?;
    }
    for (i, activity_id) in activity_ids.iter().enumerate() {
        tx.execute(
            "UPDATE activities SET sort_order = ? WHERE id = ? AND lesson_id = ?",
            (i as i64 + 1, activity_id, &lesson_id),
        )
        .map_err(db_update)?;
    }
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true, "count": activity_ids.len() }))
}

fn handle_chapters_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match chapters_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_chapters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match chapters_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_lessons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match lessons_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_lessons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match lessons_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_lessons_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match lessons_reorder(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_activities_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match activities_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_activities_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match activities_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_activities_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match activities_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_activities_soft_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match activities_soft_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_activities_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match activities_reorder(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "chapters.create" => Some(handle_chapters_create(state, req)),
        "chapters.list" => Some(handle_chapters_list(state, req)),
        "lessons.create" => Some(handle_lessons_create(state, req)),
        "lessons.list" => Some(handle_lessons_list(state, req)),
        "lessons.reorder" => Some(handle_lessons_reorder(state, req)),
        "activities.create" => Some(handle_activities_create(state, req)),
        "activities.list" => Some(handle_activities_list(state, req)),
        "activities.update" => Some(handle_activities_update(state, req)),
        "activities.softDelete" => Some(handle_activities_soft_delete(state, req)),
        "activities.reorder" => Some(handle_activities_reorder(state, req)),
        _ => None,
    }
}

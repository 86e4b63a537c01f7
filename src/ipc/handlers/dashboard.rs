use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_query, get_required_str, not_found, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::progress;
use crate::scoring;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

struct LessonLite {
    id: String,
    title: String,
    sort_order: i64,
}

/// Student home view: every chapter with a display mode and per-lesson
/// display states. Display only; `can_start_lesson` stays the authority on
/// what a student may actually open.
fn dashboard_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT display_name, speech_level, preferred_lang, graduated_at
             FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((display_name, speech_level, preferred_lang, graduated_at)) = student else {
        return Err(not_found("student not found"));
    };
    let focus = progress::focus_set(&speech_level);
    let pass_mark = scoring::load_config(conn).pass_mark;

    let mut stmt = conn
        .prepare("SELECT id, title, sort_order FROM chapters ORDER BY sort_order")
        .map_err(db_query)?;
    let chapters = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, chapter_id, title, sort_order FROM lessons
             WHERE is_active = 1
             ORDER BY chapter_id, sort_order",
        )
        .map_err(db_query)?;
    let lesson_rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let mut lessons_by_chapter: HashMap<String, Vec<LessonLite>> = HashMap::new();
    for (id, chapter_id, title, sort_order) in lesson_rows {
        lessons_by_chapter.entry(chapter_id).or_default().push(LessonLite {
            id,
            title,
            sort_order,
        });
    }

    let mut stmt = conn
        .prepare("SELECT lesson_id, status, best_score FROM lesson_progress WHERE student_id = ?")
        .map_err(db_query)?;
    let progress_pairs = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let mut progress_rows: HashMap<String, (String, f64)> = HashMap::new();
    for (lesson_id, status, best) in progress_pairs {
        progress_rows.insert(lesson_id, (status, best));
    }

    let mut chapter_views = Vec::with_capacity(chapters.len());
    for (chapter_id, title, sort_order) in chapters {
        let lessons = lessons_by_chapter.remove(&chapter_id).unwrap_or_default();
        let mode = if focus.contains(&sort_order) {
            "focus"
        } else if sort_order < focus[0] {
            "review"
        } else if lessons.iter().any(|l| progress_rows.contains_key(&l.id)) {
            // Progress left behind in a future chapter keeps it browsable.
            "review"
        } else {
            "locked"
        };

        let mut prev_completed = true;
        let mut lesson_views = Vec::with_capacity(lessons.len());
        for lesson in &lessons {
            let row = progress_rows.get(&lesson.id);
            let derived =
                progress::lesson_display_state(row.map(|(s, b)| (s.as_str(), *b)), pass_mark);
            let state = match mode {
                "focus" => {
                    if derived == "completed" {
                        "completed"
                    } else if prev_completed {
                        "unlocked"
                    } else {
                        "locked"
                    }
                }
                "review" => {
                    if derived == "locked" {
                        "unlocked"
                    } else {
                        derived
                    }
                }
                _ => "locked",
            };
            prev_completed = state == "completed";
            lesson_views.push(json!({
                "id": lesson.id,
                "title": lesson.title,
                "sortOrder": lesson.sort_order,
                "state": state,
                "bestScore": row.map(|(_, b)| *b),
            }));
        }

        chapter_views.push(json!({
            "id": chapter_id,
            "title": title,
            "sortOrder": sort_order,
            "mode": mode,
            "lessons": lesson_views,
        }));
    }

    Ok(json!({
        "student": {
            "id": student_id,
            "displayName": display_name,
            "speechLevel": speech_level,
            "preferredLang": preferred_lang,
            "graduatedAt": graduated_at,
        },
        "focus": focus,
        "chapters": chapter_views,
    }))
}

fn handle_dashboard_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match dashboard_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.open" => Some(handle_dashboard_open(state, req)),
        _ => None,
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db;

/// How many leading lessons of a chapter must be passed before the next
/// chapter's first lesson opens. Chapters with fewer active lessons gate on
/// all of them.
pub const CHAPTER_GATE_LESSONS: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ProgressError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        ProgressError {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn query_err(e: rusqlite::Error) -> ProgressError {
    ProgressError::new("db_query_failed", e.to_string())
}

fn update_err(e: rusqlite::Error) -> ProgressError {
    ProgressError::new("db_update_failed", e.to_string())
}

/// The two chapters a student is currently working through, by chapter
/// sort_order. Everything outside the pair is review material for them.
pub fn focus_set(speech_level: &str) -> [i64; 2] {
    match speech_level {
        "emerging" => [3, 4],
        "verbal" => [5, 6],
        _ => [1, 2],
    }
}

#[derive(Debug, Clone)]
pub struct LessonRef {
    pub id: String,
    pub chapter_id: String,
    pub sort_order: i64,
}

pub fn load_lesson(conn: &Connection, lesson_id: &str) -> Result<Option<LessonRef>, ProgressError> {
    conn.query_row(
        "SELECT id, chapter_id, sort_order FROM lessons WHERE id = ? AND is_active = 1",
        [lesson_id],
        |r| {
            Ok(LessonRef {
                id: r.get(0)?,
                chapter_id: r.get(1)?,
                sort_order: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(query_err)
}

pub fn student_speech_level(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<String>, ProgressError> {
    conn.query_row(
        "SELECT speech_level FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)
}

fn chapter_sort_order(conn: &Connection, chapter_id: &str) -> Result<Option<i64>, ProgressError> {
    conn.query_row(
        "SELECT sort_order FROM chapters WHERE id = ?",
        [chapter_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)
}

pub fn active_activity_ids(
    conn: &Connection,
    lesson_id: &str,
) -> Result<Vec<String>, ProgressError> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM activities
             WHERE lesson_id = ? AND is_active = 1
             ORDER BY sort_order",
        )
        .map_err(query_err)?;
    stmt.query_map([lesson_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

/// Best score this student has reached per active activity of the lesson.
/// Activities without attempts are absent from the map.
pub fn best_scores_for_lesson(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
) -> Result<HashMap<String, f64>, ProgressError> {
    let mut stmt = conn
        .prepare(
            "SELECT activity_id, MAX(score) FROM attempts
             WHERE student_id = ?
               AND activity_id IN (SELECT id FROM activities WHERE lesson_id = ? AND is_active = 1)
             GROUP BY activity_id",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((student_id, lesson_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows.into_iter().collect())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub completed: bool,
    pub display_score: f64,
    pub attempted: usize,
    pub activity_count: usize,
}

/// Re-derives a lesson's completion from the attempt ledger and upserts the
/// cached progress row. Completed means: every active activity has at least
/// one attempt AND every best score clears the pass mark. The cached display
/// score is the mean of per-activity bests over all active activities.
///
/// Safe to call any number of times: a lesson that stays completed keeps its
/// original `completed_at`, and `unlocked_at` is stamped once on first
/// insert. This function is the only writer of completed/in_progress status.
pub fn recompute_completion(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
    pass_mark: f64,
) -> Result<CompletionOutcome, ProgressError> {
    let activity_ids = active_activity_ids(conn, lesson_id)?;
    let best = best_scores_for_lesson(conn, student_id, lesson_id)?;

    let completed = !activity_ids.is_empty()
        && best.len() == activity_ids.len()
        && best.values().all(|v| *v >= pass_mark);
    let display_score = if activity_ids.is_empty() {
        0.0
    } else {
        best.values().sum::<f64>() / activity_ids.len() as f64
    };

    let status = if completed { "completed" } else { "in_progress" };
    let now = db::now_iso();
    let completed_at = if completed { Some(now.clone()) } else { None };
    conn.execute(
        "INSERT INTO lesson_progress(id, student_id, lesson_id, status, best_score, unlocked_at, completed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, lesson_id) DO UPDATE SET
           status = excluded.status,
           best_score = excluded.best_score,
           completed_at = CASE
             WHEN excluded.status = 'completed'
               THEN COALESCE(lesson_progress.completed_at, excluded.completed_at)
             ELSE NULL
           END",
        (
            Uuid::new_v4().to_string(),
            student_id,
            lesson_id,
            status,
            display_score,
            &now,
            completed_at,
        ),
    )
    .map_err(update_err)?;

    Ok(CompletionOutcome {
        completed,
        display_score,
        attempted: best.len(),
        activity_count: activity_ids.len(),
    })
}

/// Live pass check straight off the ledger, no cache writes. False for
/// lessons without activities.
pub fn lesson_passed_live(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
    pass_mark: f64,
) -> Result<bool, ProgressError> {
    let activity_ids = active_activity_ids(conn, lesson_id)?;
    if activity_ids.is_empty() {
        return Ok(false);
    }
    let best = best_scores_for_lesson(conn, student_id, lesson_id)?;
    Ok(best.len() == activity_ids.len() && best.values().all(|v| *v >= pass_mark))
}

/// Completed per the cached row, with a live fallback for rows the evaluator
/// has not caught up with yet. The ledger stays the source of truth.
pub fn has_completed_lesson(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
    pass_mark: f64,
) -> Result<bool, ProgressError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM lesson_progress WHERE student_id = ? AND lesson_id = ?",
            (student_id, lesson_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    if status.as_deref() == Some("completed") {
        return Ok(true);
    }
    lesson_passed_live(conn, student_id, lesson_id, pass_mark)
}

fn first_gate_lesson_ids(conn: &Connection, chapter_id: &str) -> Result<Vec<String>, ProgressError> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM lessons
             WHERE chapter_id = ? AND is_active = 1
             ORDER BY sort_order
             LIMIT ?",
        )
        .map_err(query_err)?;
    stmt.query_map((chapter_id, CHAPTER_GATE_LESSONS), |r| {
        r.get::<_, String>(0)
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

/// The chapter-completion gate: the first five active lessons (all of them
/// when the chapter has fewer) each pass live off the ledger.
pub fn chapter_gate_complete(
    conn: &Connection,
    student_id: &str,
    chapter_id: &str,
    pass_mark: f64,
) -> Result<bool, ProgressError> {
    for lesson_id in first_gate_lesson_ids(conn, chapter_id)? {
        if !lesson_passed_live(conn, student_id, &lesson_id, pass_mark)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Access gate checked before handing out a lesson's activities. Open when
/// the lesson leads its chapter, when the chapter is review material for
/// this student, or when the preceding lesson is completed (plus, in the
/// student's second focus chapter, the first focus chapter's gate).
pub fn can_start_lesson(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
    pass_mark: f64,
) -> Result<bool, ProgressError> {
    let Some(lesson) = load_lesson(conn, lesson_id)? else {
        return Err(ProgressError::new("not_found", "lesson not found"));
    };
    if lesson.sort_order <= 1 {
        return Ok(true);
    }

    let Some(chapter_no) = chapter_sort_order(conn, &lesson.chapter_id)? else {
        return Err(ProgressError::new("not_found", "chapter not found"));
    };
    let Some(level) = student_speech_level(conn, student_id)? else {
        return Err(ProgressError::new("not_found", "student not found"));
    };
    let focus = focus_set(&level);
    if !focus.contains(&chapter_no) {
        return Ok(true);
    }

    let prev_id: Option<String> = conn
        .query_row(
            "SELECT id FROM lessons
             WHERE chapter_id = ? AND sort_order = ? AND is_active = 1",
            (&lesson.chapter_id, lesson.sort_order - 1),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    // A gap in the sequence does not wall off everything behind it.
    if let Some(prev_id) = prev_id {
        if !has_completed_lesson(conn, student_id, &prev_id, pass_mark)? {
            return Ok(false);
        }
    }

    if chapter_no == focus[1] {
        let first_focus_chapter: Option<String> = conn
            .query_row(
                "SELECT id FROM chapters WHERE sort_order = ?",
                [focus[0]],
                |r| r.get(0),
            )
            .optional()
            .map_err(query_err)?;
        if let Some(chapter_id) = first_focus_chapter {
            if !chapter_gate_complete(conn, student_id, &chapter_id, pass_mark)? {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// Seeds an `unlocked` progress row. Insert-only: rows the completion
/// evaluator already owns are left untouched, so an unlock can never
/// downgrade a completed lesson.
pub fn unlock_lesson(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
) -> Result<bool, ProgressError> {
    let n = conn
        .execute(
            "INSERT INTO lesson_progress(id, student_id, lesson_id, status, best_score, unlocked_at)
             VALUES(?, ?, ?, 'unlocked', 0, ?)
             ON CONFLICT(student_id, lesson_id) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                student_id,
                lesson_id,
                db::now_iso(),
            ),
        )
        .map_err(update_err)?;
    Ok(n > 0)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteLessonOutcome {
    pub completed: bool,
    pub display_score: f64,
    pub next_lesson_id: Option<String>,
    pub chapter_completed: bool,
    pub next_chapter_unlocked: bool,
}

/// The unlock propagation run after a lesson wraps up: recompute this
/// lesson, open the next lesson in the chapter when completed, and when the
/// chapter gate is newly satisfied, open the next chapter's first lesson
/// (focus or review alike).
pub fn complete_lesson(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
    pass_mark: f64,
) -> Result<CompleteLessonOutcome, ProgressError> {
    let Some(lesson) = load_lesson(conn, lesson_id)? else {
        return Err(ProgressError::new("not_found", "lesson not found"));
    };

    let outcome = recompute_completion(conn, student_id, lesson_id, pass_mark)?;

    let mut next_lesson_id: Option<String> = None;
    if outcome.completed {
        let next: Option<String> = conn
            .query_row(
                "SELECT id FROM lessons
                 WHERE chapter_id = ? AND sort_order = ? AND is_active = 1",
                (&lesson.chapter_id, lesson.sort_order + 1),
                |r| r.get(0),
            )
            .optional()
            .map_err(query_err)?;
        if let Some(next) = next {
            unlock_lesson(conn, student_id, &next)?;
            next_lesson_id = Some(next);
        }
    }

    let chapter_completed = chapter_gate_complete(conn, student_id, &lesson.chapter_id, pass_mark)?;
    let mut next_chapter_unlocked = false;
    if chapter_completed {
        if let Some(chapter_no) = chapter_sort_order(conn, &lesson.chapter_id)? {
            let next_chapter: Option<String> = conn
                .query_row(
                    "SELECT id FROM chapters WHERE sort_order = ?",
                    [chapter_no + 1],
                    |r| r.get(0),
                )
                .optional()
                .map_err(query_err)?;
            if let Some(next_chapter) = next_chapter {
                let first_lesson: Option<String> = conn
                    .query_row(
                        "SELECT id FROM lessons
                         WHERE chapter_id = ? AND is_active = 1
                         ORDER BY sort_order
                         LIMIT 1",
                        [&next_chapter],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(query_err)?;
                if let Some(first_lesson) = first_lesson {
                    unlock_lesson(conn, student_id, &first_lesson)?;
                    next_chapter_unlocked = true;
                }
            }
        }
    }

    Ok(CompleteLessonOutcome {
        completed: outcome.completed,
        display_score: outcome.display_score,
        next_lesson_id,
        chapter_completed,
        next_chapter_unlocked,
    })
}

/// Display state for one lesson row on the dashboard. Read-side only; the
/// write path and `can_start_lesson` stay authoritative.
pub fn lesson_display_state(row: Option<(&str, f64)>, pass_mark: f64) -> &'static str {
    match row {
        Some((status, best)) => {
            if status == "completed" || best >= pass_mark {
                "completed"
            } else if status == "unlocked" || status == "in_progress" {
                "unlocked"
            } else {
                "locked"
            }
        }
        None => "locked",
    }
}

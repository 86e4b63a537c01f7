use log::warn;
use rusqlite::Connection;
use uuid::Uuid;

use crate::db;

/// How far back the streak rules look. Streaks are short by design; scanning
/// further buys nothing.
const STREAK_WINDOW: i64 = 50;

pub const FIRST_CORRECT: &str = "first_correct";
pub const THREE_IN_A_ROW: &str = "three_in_a_row";
pub const STREAK_MASTER: &str = "streak_master";
pub const SCHOLAR: &str = "scholar";
pub const SHARPSHOOTER: &str = "sharpshooter";

/// Newly earned badges for one attempt, split by where the client surfaces
/// them: inline toasts right after the attempt, and profile-page badges.
#[derive(Debug, Default)]
pub struct Awards {
    pub inline: Vec<String>,
    pub profile: Vec<String>,
}

fn has_award(conn: &Connection, student_id: &str, code: &str) -> rusqlite::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM achievements WHERE student_id = ? AND code = ?",
        (student_id, code),
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

/// Awards a badge unless the student already holds it. Returns whether this
/// call created the row. A failed insert is logged and swallowed so one
/// broken badge never fails the attempt that earned it.
fn award_once(conn: &Connection, student_id: &str, code: &str) -> bool {
    match has_award(conn, student_id, code) {
        Ok(true) => return false,
        Ok(false) => {}
        Err(e) => {
            warn!("achievement lookup failed for {}: {}", code, e);
            return false;
        }
    }
    let res = conn.execute(
        "INSERT INTO achievements(id, student_id, code, awarded_at) VALUES(?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            student_id,
            code,
            db::now_iso(),
        ),
    );
    match res {
        Ok(_) => true,
        Err(e) => {
            warn!("achievement insert failed for {}: {}", code, e);
            false
        }
    }
}

fn recent_scores(conn: &Connection, student_id: &str) -> rusqlite::Result<Vec<f64>> {
    let mut stmt = conn.prepare(
        "SELECT score FROM attempts WHERE student_id = ? ORDER BY rowid DESC LIMIT ?",
    )?;
    let rows = stmt
        .query_map((student_id, STREAK_WINDOW), |r| r.get::<_, f64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Passing scores counting back from the latest attempt, stopping at the
/// first miss.
fn current_pass_streak(scores: &[f64], pass_mark: f64) -> usize {
    scores.iter().take_while(|s| **s >= pass_mark).count()
}

fn sound_pass_count(conn: &Connection, student_id: &str, pass_mark: f64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM attempts
         WHERE student_id = ?
           AND json_extract(meta, '$.layout') = 'sound'
           AND score >= ?",
        (student_id, pass_mark),
        |r| r.get(0),
    )
}

/// True when the student has attempts on this lesson's active activities
/// and every one of them scored exactly 100. One wobble anywhere, ever,
/// disqualifies. Attempts on soft-deleted activities do not count.
fn lesson_all_perfect(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
) -> rusqlite::Result<bool> {
    let (attempts, imperfect): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(score != 100.0), 0) FROM attempts
         WHERE student_id = ?
           AND activity_id IN (SELECT id FROM activities WHERE lesson_id = ? AND is_active = 1)",
        (student_id, lesson_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(attempts > 0 && imperfect == 0)
}

/// Evaluates every badge rule after an attempt lands in the ledger. The
/// attempt itself must already be inserted; streak rules count it. Rules are
/// independent: one attempt can earn several badges at once.
pub fn evaluate(
    conn: &Connection,
    student_id: &str,
    score: f64,
    lesson_id: Option<&str>,
    layout: Option<&str>,
    pass_mark: f64,
) -> Awards {
    let mut awards = Awards::default();

    if score >= pass_mark && award_once(conn, student_id, FIRST_CORRECT) {
        awards.inline.push(FIRST_CORRECT.to_string());
    }

    if score >= pass_mark {
        let streak = match recent_scores(conn, student_id) {
            Ok(scores) => current_pass_streak(&scores, pass_mark),
            Err(e) => {
                warn!("streak scan failed: {}", e);
                0
            }
        };
        if streak >= 3 && award_once(conn, student_id, THREE_IN_A_ROW) {
            awards.inline.push(THREE_IN_A_ROW.to_string());
        }
        if streak >= 5 && award_once(conn, student_id, STREAK_MASTER) {
            awards.inline.push(STREAK_MASTER.to_string());
        }
    }

    if layout == Some("sound") && score >= pass_mark {
        match sound_pass_count(conn, student_id, pass_mark) {
            Ok(n) if n >= 10 => {
                if award_once(conn, student_id, SCHOLAR) {
                    awards.profile.push(SCHOLAR.to_string());
                }
            }
            Ok(_) => {}
            Err(e) => warn!("scholar scan failed: {}", e),
        }
    }

    if score >= pass_mark {
        if let Some(lesson_id) = lesson_id {
            match lesson_all_perfect(conn, student_id, lesson_id) {
                Ok(true) => {
                    if award_once(conn, student_id, SHARPSHOOTER) {
                        awards.inline.push(SHARPSHOOTER.to_string());
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("sharpshooter scan failed: {}", e),
            }
        }
    }

    awards
}

pub fn list_for_student(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT code, awarded_at FROM achievements WHERE student_id = ? ORDER BY awarded_at, code",
    )?;
    let rows = stmt
        .query_map([student_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

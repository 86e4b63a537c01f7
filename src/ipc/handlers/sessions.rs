use chrono::{DateTime, Duration, FixedOffset, Offset, SecondsFormat, TimeZone, Utc};
use log::warn;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, db_insert, db_query, db_update, get_optional_str, get_required_i64,
    get_required_str, not_found, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

pub const ALLOWED_MINUTES: [i64; 4] = [5, 10, 15, 20];
pub const DEFAULT_UTC_OFFSET_MINUTES: i64 = 480;
const SETTINGS_KEY: &str = "day_gate";

fn blocked(reason: &str, message: &str) -> HandlerErr {
    HandlerErr::with_details(
        reason,
        message,
        json!({ "blocked": true, "reason": reason }),
    )
}

#[derive(Debug)]
struct SessionRow {
    id: String,
    student_id: String,
    status: String,
    minutes_allowed: i64,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

const SESSION_COLS: &str =
    "id, student_id, status, minutes_allowed, created_at, started_at, ended_at";

fn map_session_row(r: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        status: r.get(2)?,
        minutes_allowed: r.get(3)?,
        created_at: r.get(4)?,
        started_at: r.get(5)?,
        ended_at: r.get(6)?,
    })
}

fn session_json(row: &SessionRow, now: DateTime<Utc>) -> serde_json::Value {
    let mut v = json!({
        "id": row.id,
        "studentId": row.student_id,
        "status": row.status,
        "minutesAllowed": row.minutes_allowed,
        "createdAt": row.created_at,
        "startedAt": row.started_at,
        "endedAt": row.ended_at,
    });
    if row.status == "active" {
        if let Some(started) = &row.started_at {
            v["remainingSeconds"] = json!(remaining_seconds(started, row.minutes_allowed, now));
        }
    }
    v
}

fn load_session(
    conn: &Connection,
    student_id: &str,
    session_id: &str,
) -> Result<Option<SessionRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sessions WHERE id = ? AND student_id = ?",
            SESSION_COLS
        ),
        (session_id, student_id),
        |r| map_session_row(r),
    )
    .optional()
    .map_err(db_query)
}

/// The effective UTC offset for "one session per day". Read from settings
/// each time so a changed offset applies without restarting; read failures
/// fall back to the default rather than blocking play.
fn utc_offset_minutes(conn: &Connection) -> i64 {
    match db::settings_get_json(conn, SETTINGS_KEY) {
        Ok(Some(v)) => v
            .get("utcOffsetMinutes")
            .and_then(|x| x.as_i64())
            .unwrap_or(DEFAULT_UTC_OFFSET_MINUTES),
        Ok(None) => DEFAULT_UTC_OFFSET_MINUTES,
        Err(e) => {
            warn!("day-gate settings read failed: {}", e);
            DEFAULT_UTC_OFFSET_MINUTES
        }
    }
}

/// UTC window [start, end) covering the local calendar day that contains
/// `now`, as RFC3339 strings comparable against stored timestamps.
fn day_bounds_utc(now: DateTime<Utc>, offset_minutes: i64) -> (String, String) {
    let secs = (offset_minutes.clamp(-16 * 60, 16 * 60) * 60) as i32;
    let offset = FixedOffset::east_opt(secs).unwrap_or_else(|| Utc.fix());
    let local = now.with_timezone(&offset);
    let start_naive = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| local.naive_local());
    let start_local = offset
        .from_local_datetime(&start_naive)
        .single()
        .unwrap_or(local);
    let start_utc = start_local.with_timezone(&Utc);
    let end_utc = start_utc + Duration::days(1);
    (
        start_utc.to_rfc3339_opts(SecondsFormat::Millis, true),
        end_utc.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

/// Seconds left on an active session, floored at zero. None when the start
/// stamp does not parse.
fn remaining_seconds(started_at: &str, minutes_allowed: i64, now: DateTime<Utc>) -> Option<i64> {
    let started = DateTime::parse_from_rfc3339(started_at)
        .ok()?
        .with_timezone(&Utc);
    let deadline = started + Duration::minutes(minutes_allowed);
    Some((deadline - now).num_seconds().max(0))
}

fn open_session(conn: &Connection, student_id: &str) -> Result<Option<SessionRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sessions
             WHERE student_id = ? AND status IN ('pending', 'active')
             ORDER BY created_at DESC
             LIMIT 1",
            SESSION_COLS
        ),
        [student_id],
        |r| map_session_row(r),
    )
    .optional()
    .map_err(db_query)
}

fn started_within(
    conn: &Connection,
    student_id: &str,
    start: &str,
    end: &str,
) -> Result<bool, HandlerErr> {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sessions
             WHERE student_id = ?
               AND started_at IS NOT NULL
               AND started_at >= ? AND started_at < ?",
            (student_id, start, end),
            |r| r.get(0),
        )
        .map_err(db_query)?;
    Ok(n > 0)
}

fn check_day_gate(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let (start, end) = day_bounds_utc(Utc::now(), utc_offset_minutes(conn));
    if started_within(conn, student_id, &start, &end)? {
        return Err(blocked(
            "session_recent",
            "a session was already played today",
        ));
    }
    Ok(())
}

/// Opens a `pending` session. Blocked while another session is open and by
/// the one-session-per-local-day rule.
fn create_session(
    conn: &Connection,
    student_id: &str,
    minutes: i64,
) -> Result<SessionRow, HandlerErr> {
    if !ALLOWED_MINUTES.contains(&minutes) {
        return Err(bad_params("minutes must be one of 5, 10, 15, 20"));
    }
    let students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if students == 0 {
        return Err(not_found("student not found"));
    }

    if let Some(open) = open_session(conn, student_id)? {
        return Err(HandlerErr::with_details(
            "session_active",
            "a session is already open",
            json!({
                "blocked": true,
                "reason": "session_active",
                "sessionId": open.id,
            }),
        ));
    }
    check_day_gate(conn, student_id)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(id, student_id, status, minutes_allowed, created_at)
         VALUES(?, ?, 'pending', ?, ?)",
        (&id, student_id, minutes, db::now_iso()),
    )
    .map_err(db_insert)?;

    load_session(conn, student_id, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "session row missing after insert"))
}

/// Flips a pending session to `active` and stamps `started_at`. The day
/// gate is re-checked here so a pending session created yesterday cannot
/// dodge today's rule. The update is guarded on pending/unstarted, so
/// double activation affects zero rows.
fn activate_session(
    conn: &Connection,
    student_id: &str,
    session_id: &str,
) -> Result<SessionRow, HandlerErr> {
    check_day_gate(conn, student_id)?;
    let n = conn
        .execute(
            "UPDATE sessions SET status = 'active', started_at = ?
             WHERE id = ? AND student_id = ? AND status = 'pending' AND started_at IS NULL",
            (db::now_iso(), session_id, student_id),
        )
        .map_err(db_update)?;
    if n == 0 {
        return Err(not_found("no pending session to activate"));
    }
    load_session(conn, student_id, session_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "session row missing after update"))
}

/// Ends a session by id, or the latest active one when no id is given.
fn end_session(
    conn: &Connection,
    student_id: &str,
    session_id: Option<&str>,
) -> Result<SessionRow, HandlerErr> {
    let target = match session_id {
        Some(id) => Some(id.to_string()),
        None => conn
            .query_row(
                "SELECT id FROM sessions
                 WHERE student_id = ? AND status = 'active'
                 ORDER BY started_at DESC
                 LIMIT 1",
                [student_id],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(db_query)?,
    };
    let Some(id) = target else {
        return Err(not_found("no active session"));
    };

    let n = conn
        .execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?
             WHERE id = ? AND student_id = ? AND status = 'active'",
            (db::now_iso(), &id, student_id),
        )
        .map_err(db_update)?;
    if n == 0 {
        return Err(not_found("no active session with that id"));
    }
    load_session(conn, student_id, &id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "session row missing after update"))
}

/// Latest open session, with expiry applied: an active session whose clock
/// has run out is ended here before being reported.
fn session_status(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<SessionRow>, HandlerErr> {
    let Some(row) = open_session(conn, student_id)? else {
        return Ok(None);
    };
    if row.status == "active" {
        if let Some(started) = &row.started_at {
            if remaining_seconds(started, row.minutes_allowed, Utc::now()) == Some(0) {
                conn.execute(
                    "UPDATE sessions SET status = 'ended', ended_at = ? WHERE id = ?",
                    (db::now_iso(), &row.id),
                )
                .map_err(db_update)?;
                return load_session(conn, student_id, &row.id);
            }
        }
    }
    Ok(Some(row))
}

fn session_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let minutes = get_required_i64(params, "minutes")?;
    let row = create_session(conn, &student_id, minutes)?;
    Ok(json!({ "session": session_json(&row, Utc::now()) }))
}

fn session_activate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let session_id = get_required_str(params, "sessionId")?;
    let row = activate_session(conn, &student_id, &session_id)?;
    Ok(json!({ "session": session_json(&row, Utc::now()) }))
}

fn session_end(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let session_id = get_optional_str(params, "sessionId");
    let row = end_session(conn, &student_id, session_id.as_deref())?;
    Ok(json!({ "session": session_json(&row, Utc::now()) }))
}

fn session_status_op(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let row = session_status(conn, &student_id)?;
    Ok(json!({
        "session": row.map(|r| session_json(&r, Utc::now())),
    }))
}

fn handle_session_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_session_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_activate(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_session_end(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_end(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_session_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_status_op(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.create" => Some(handle_session_create(state, req)),
        "session.activate" => Some(handle_session_activate(state, req)),
        "session.end" => Some(handle_session_end(state, req)),
        "session.status" => Some(handle_session_status(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::init_schema(&conn).expect("init schema");
        conn.execute(
            "INSERT INTO students(id, display_name, speech_level, created_at)
             VALUES('s', 's', 'non_verbal', ?)",
            [crate::db::now_iso()],
        )
        .expect("student");
        conn
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("utc")
    }

    #[test]
    fn day_bounds_shift_with_offset() {
        // 18:30Z is already past midnight in UTC+8.
        let (start, end) = day_bounds_utc(utc(2024, 3, 10, 18, 30), 480);
        assert_eq!(start, "2024-03-10T16:00:00.000Z");
        assert_eq!(end, "2024-03-11T16:00:00.000Z");

        let (start, end) = day_bounds_utc(utc(2024, 3, 10, 18, 30), 0);
        assert_eq!(start, "2024-03-10T00:00:00.000Z");
        assert_eq!(end, "2024-03-11T00:00:00.000Z");

        // 02:30Z is still the previous evening in UTC-5.
        let (start, _) = day_bounds_utc(utc(2024, 3, 10, 2, 30), -300);
        assert_eq!(start, "2024-03-09T05:00:00.000Z");
    }

    #[test]
    fn remaining_seconds_counts_down_to_zero() {
        let started = "2024-01-01T00:00:00.000Z";
        assert_eq!(
            remaining_seconds(started, 5, utc(2024, 1, 1, 0, 2) + Duration::seconds(30)),
            Some(150)
        );
        assert_eq!(remaining_seconds(started, 5, utc(2024, 1, 1, 0, 10)), Some(0));
        assert_eq!(remaining_seconds("not a time", 5, utc(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn create_rejects_bad_minutes() {
        let conn = test_conn();
        let err = create_session(&conn, "s", 7).expect_err("must reject");
        assert_eq!(err.code, "bad_params");
    }

    #[test]
    fn lifecycle_blocks_double_open_and_same_day_replay() {
        let conn = test_conn();

        let created = create_session(&conn, "s", 10).expect("create");
        assert_eq!(created.status, "pending");
        assert!(created.started_at.is_none());

        let err = create_session(&conn, "s", 10).expect_err("second create");
        assert_eq!(err.code, "session_active");
        let details = err.details.expect("details");
        assert_eq!(details["blocked"], true);
        assert_eq!(details["reason"], "session_active");

        let active = activate_session(&conn, "s", &created.id).expect("activate");
        assert_eq!(active.status, "active");
        assert!(active.started_at.is_some());

        // Activating again hits the pending/unstarted guard.
        let err = activate_session(&conn, "s", &created.id).expect_err("double activate");
        assert_eq!(err.code, "not_found");

        let ended = end_session(&conn, "s", None).expect("end");
        assert_eq!(ended.status, "ended");
        assert!(ended.ended_at.is_some());

        // Nothing open anymore, but a session started today blocks a new one.
        let err = create_session(&conn, "s", 10).expect_err("same-day create");
        assert_eq!(err.code, "session_recent");
    }

    #[test]
    fn status_auto_ends_expired_sessions() {
        let conn = test_conn();
        let stale_start =
            (Utc::now() - Duration::minutes(30)).to_rfc3339_opts(SecondsFormat::Millis, true);
        conn.execute(
            "INSERT INTO sessions(id, student_id, status, minutes_allowed, created_at, started_at)
             VALUES('sess', 's', 'active', 5, ?, ?)",
            (crate::db::now_iso(), stale_start),
        )
        .expect("seed session");

        let row = session_status(&conn, "s").expect("status").expect("row");
        assert_eq!(row.status, "ended");
        assert!(row.ended_at.is_some());

        // Once ended it no longer shows up as the open session.
        assert!(session_status(&conn, "s").expect("status").is_none());
    }

    #[test]
    fn end_without_id_needs_an_active_session() {
        let conn = test_conn();
        let err = end_session(&conn, "s", None).expect_err("nothing active");
        assert_eq!(err.code, "not_found");

        // A pending session does not count as active.
        create_session(&conn, "s", 5).expect("create");
        let err = end_session(&conn, "s", None).expect_err("pending only");
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn status_reports_remaining_seconds() {
        let conn = test_conn();
        let created = create_session(&conn, "s", 10).expect("create");
        activate_session(&conn, "s", &created.id).expect("activate");

        let out = session_status_op(&conn, &json!({ "studentId": "s" })).expect("status");
        let session = &out["session"];
        assert_eq!(session["status"], "active");
        let remaining = session["remainingSeconds"].as_i64().expect("remaining");
        assert!(remaining > 0 && remaining <= 600);
    }
}

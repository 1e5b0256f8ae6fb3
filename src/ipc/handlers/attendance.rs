use crate::calc::{self, AttendanceStatus};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::sections::{list_roster, section_name};

#[derive(Debug, Clone)]
struct SessionRow {
    id: String,
    class_section_id: String,
    class_section_name: String,
    teacher_id: String,
    date: String,
    present_count: i64,
    absent_count: i64,
}

fn session_json(s: &SessionRow) -> serde_json::Value {
    json!({
        "id": s.id,
        "classSectionId": s.class_section_id,
        "classSectionName": s.class_section_name,
        "teacherId": s.teacher_id,
        "date": s.date,
        "presentCount": s.present_count,
        "absentCount": s.absent_count
    })
}

fn map_session_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        class_section_id: r.get(1)?,
        class_section_name: r.get(2)?,
        teacher_id: r.get(3)?,
        date: r.get(4)?,
        present_count: r.get(5)?,
        absent_count: r.get(6)?,
    })
}

const SESSION_COLUMNS: &str =
    "id, class_section_id, class_section_name, teacher_id, date, present_count, absent_count";

/// Session dates are whole-day granularity. The inclusive/exclusive bounds
/// feed the range lookup that enforces one-session-per-class-per-day.
fn day_bounds(date: &str) -> Result<(String, String), HandlerErr> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    let next = day
        .succ_opt()
        .ok_or_else(|| HandlerErr::bad_params("date is out of range"))?;
    Ok((day.to_string(), next.to_string()))
}

fn find_session(
    conn: &Connection,
    section_id: &str,
    date: &str,
) -> Result<Option<SessionRow>, HandlerErr> {
    let (start, end) = day_bounds(date)?;
    conn.query_row(
        &format!(
            "SELECT {} FROM attendance_sessions
             WHERE class_section_id = ? AND date >= ? AND date < ?",
            SESSION_COLUMNS
        ),
        (section_id, &start, &end),
        map_session_row,
    )
    .optional()
    .map_err(HandlerErr::query_failed)
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<SessionRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM attendance_sessions WHERE id = ?",
            SESSION_COLUMNS
        ),
        [session_id],
        map_session_row,
    )
    .optional()
    .map_err(HandlerErr::query_failed)
}

fn parse_statuses(
    params: &serde_json::Value,
) -> Result<BTreeMap<String, AttendanceStatus>, HandlerErr> {
    let Some(obj) = params.get("statuses").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing statuses map"));
    };
    if obj.is_empty() {
        return Err(HandlerErr::bad_params("statuses must not be empty"));
    }
    let mut statuses = BTreeMap::new();
    for (student_id, value) in obj {
        let status = value
            .as_str()
            .and_then(AttendanceStatus::parse)
            .ok_or_else(|| {
                HandlerErr::bad_params(format!(
                    "status for student {} must be present or absent",
                    student_id
                ))
            })?;
        statuses.insert(student_id.clone(), status);
    }
    Ok(statuses)
}

/// Editing draft for one class+date: the active roster with each student's
/// stored status, defaulting to present where the day is unmarked.
fn open_draft(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let date = required_str(params, "date")?;
    if section_name(conn, &section_id)?.is_none() {
        return Err(HandlerErr::not_found("class section not found"));
    }

    let existing = find_session(conn, &section_id, &date)?;
    let mut stored: HashMap<String, String> = HashMap::new();
    if let Some(session) = &existing {
        let mut stmt = conn
            .prepare("SELECT student_id, status FROM attendance_records WHERE session_id = ?")
            .map_err(HandlerErr::query_failed)?;
        let rows = stmt
            .query_map([&session.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query_failed)?;
        stored.extend(rows);
    }

    let students: Vec<serde_json::Value> = list_roster(conn, &section_id, true)?
        .iter()
        .map(|s| {
            let status = stored
                .get(&s.id)
                .cloned()
                .unwrap_or_else(|| AttendanceStatus::Present.as_str().to_string());
            json!({
                "studentId": s.id,
                "name": s.name,
                "rollNo": s.roll_no,
                "status": status
            })
        })
        .collect();

    Ok(json!({
        "classSectionId": section_id,
        "date": date,
        "sessionId": existing.as_ref().map(|s| s.id.clone()),
        "students": students
    }))
}

/// Draft helper over an in-flight statuses map, like the timetable's period
/// helpers: every entry is overwritten with the given status and the map is
/// returned for the caller to keep editing. Nothing is persisted.
fn mark_all_draft(
    _conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut statuses = parse_statuses(params)?;
    let status = required_str(params, "status")?;
    let status = AttendanceStatus::parse(&status)
        .ok_or_else(|| HandlerErr::bad_params("status must be present or absent"))?;
    calc::mark_all(&mut statuses, status);
    Ok(json!({ "statuses": statuses }))
}

/// Creates or re-marks the one session for (class, date). The cached counts
/// and the child record set are derived from the same statuses map inside a
/// single transaction, so they cannot diverge.
fn mark_attendance(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let section_id = required_str(params, "classSectionId")?;
    let date = required_str(params, "date")?;
    let statuses = parse_statuses(params)?;
    let (date, _) = day_bounds(&date)?;

    let Some(section_name) = section_name(conn, &section_id)? else {
        return Err(HandlerErr::not_found("class section not found"));
    };
    let existing = find_session(conn, &section_id, &date)?;
    let (present, absent) = calc::tally(&statuses);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let session_id = match existing {
        Some(session) => {
            // Re-mark: refresh the cached counts, then replace the child
            // record set wholesale rather than patching per student.
            tx.execute(
                "UPDATE attendance_sessions
                 SET teacher_id = ?, present_count = ?, absent_count = ?
                 WHERE id = ?",
                (&teacher_id, present, absent, &session.id),
            )
            .map_err(|e| {
                HandlerErr::new("db_update_failed", e.to_string())
                    .with_details(json!({ "table": "attendance_sessions" }))
            })?;
            tx.execute(
                "DELETE FROM attendance_records WHERE session_id = ?",
                [&session.id],
            )
            .map_err(|e| {
                HandlerErr::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "attendance_records" }))
            })?;
            session.id
        }
        None => {
            let session_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO attendance_sessions(
                    id, class_section_id, class_section_name, teacher_id,
                    date, present_count, absent_count)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &session_id,
                    &section_id,
                    &section_name,
                    &teacher_id,
                    &date,
                    present,
                    absent,
                ),
            )
            .map_err(|e| {
                HandlerErr::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "attendance_sessions" }))
            })?;
            session_id
        }
    };

    for (student_id, status) in &statuses {
        let record_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO attendance_records(
                id, session_id, student_id, status, date, class_section_id, teacher_id)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &record_id,
                &session_id,
                student_id,
                status.as_str(),
                &date,
                &section_id,
                &teacher_id,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "attendance_records" }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "sessionId": session_id,
        "presentCount": present,
        "absentCount": absent,
        "recordCount": statuses.len()
    }))
}

fn delete_session(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = required_str(params, "sessionId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let Some(session) = load_session(conn, &session_id)? else {
        return Err(HandlerErr::not_found("attendance session not found"));
    };
    if session.teacher_id != teacher_id {
        return Err(HandlerErr::forbidden(
            "session belongs to a different teacher",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE session_id = ?",
        [&session_id],
    )
    .map_err(|e| {
        HandlerErr::new("db_delete_failed", e.to_string())
            .with_details(json!({ "table": "attendance_records" }))
    })?;
    tx.execute("DELETE FROM attendance_sessions WHERE id = ?", [&session_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "attendance_sessions" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn sessions_where(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Vec<SessionRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM attendance_sessions WHERE {} = ? ORDER BY date, id",
            SESSION_COLUMNS, column
        ))
        .map_err(HandlerErr::query_failed)?;
    stmt.query_map([value], map_session_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)
}

fn sessions_for_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let sessions: Vec<serde_json::Value> = sessions_where(conn, "teacher_id", &teacher_id)?
        .iter()
        .map(session_json)
        .collect();
    Ok(json!({ "sessions": sessions }))
}

fn sessions_for_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let sessions: Vec<serde_json::Value> = sessions_where(conn, "class_section_id", &section_id)?
        .iter()
        .map(session_json)
        .collect();
    Ok(json!({ "sessions": sessions }))
}

fn records_for_session(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = required_str(params, "sessionId")?;
    if load_session(conn, &session_id)?.is_none() {
        return Err(HandlerErr::not_found("attendance session not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, status, date
             FROM attendance_records
             WHERE session_id = ?
             ORDER BY student_id",
        )
        .map_err(HandlerErr::query_failed)?;
    let records: Vec<serde_json::Value> = stmt
        .query_map([&session_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "date": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;
    Ok(json!({ "sessionId": session_id, "records": records }))
}

/// A student's personal history across every session they were marked in,
/// with the rounded overall percentage.
fn student_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT status, date, class_section_id
             FROM attendance_records
             WHERE student_id = ?
             ORDER BY date, id",
        )
        .map_err(HandlerErr::query_failed)?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([&student_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;

    let present = rows.iter().filter(|(status, _, _)| status == "present").count() as i64;
    let absent = rows.len() as i64 - present;
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|(status, date, section_id)| {
            json!({
                "status": status,
                "date": date,
                "classSectionId": section_id
            })
        })
        .collect();

    Ok(json!({
        "studentId": student_id,
        "presentCount": present,
        "absentCount": absent,
        "percentage": calc::student_attendance_percentage(present, absent),
        "records": records
    }))
}

/// Running mean of session percentages in ascending date order (id as
/// tiebreak), so the order-sensitive figure is deterministic.
fn class_average(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let sessions = sessions_where(conn, "class_section_id", &section_id)?;
    let percentages: Vec<f64> = sessions
        .iter()
        .map(|s| calc::session_percentage(s.present_count, s.absent_count))
        .collect();
    Ok(json!({
        "classSectionId": section_id,
        "sessionCount": sessions.len(),
        "averageAttendance": calc::running_average(&percentages)
    }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.open" => Some(handle(state, req, open_draft)),
        "attendance.markAll" => Some(handle(state, req, mark_all_draft)),
        "attendance.mark" => Some(handle(state, req, mark_attendance)),
        "attendance.deleteSession" => Some(handle(state, req, delete_session)),
        "attendance.sessionsForTeacher" => Some(handle(state, req, sessions_for_teacher)),
        "attendance.sessionsForClass" => Some(handle(state, req, sessions_for_class)),
        "attendance.records" => Some(handle(state, req, records_for_session)),
        "attendance.studentSummary" => Some(handle(state, req, student_summary)),
        "attendance.classAverage" => Some(handle(state, req, class_average)),
        _ => None,
    }
}

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, required_str, required_u64};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, ScheduleDay, ScheduleDoc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::sections::section_name;

fn decode_days_param(params: &serde_json::Value) -> Result<Vec<ScheduleDay>, HandlerErr> {
    let Some(raw) = params.get("days") else {
        return Err(HandlerErr::bad_params("missing days"));
    };
    let days: Vec<ScheduleDay> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("days did not decode: {}", e)))?;
    schedule::validate_days(&days).map_err(HandlerErr::bad_params)?;
    Ok(days)
}

fn encode_days(days: &[ScheduleDay]) -> Result<String, HandlerErr> {
    serde_json::to_string(days).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// Decodes a stored schedule row into the typed document, failing fast on a
/// malformed body instead of propagating loose fields.
fn decode_row(
    id: String,
    class_section_id: String,
    class_section_name: String,
    days_json: String,
) -> Result<ScheduleDoc, HandlerErr> {
    let days: Vec<ScheduleDay> = serde_json::from_str(&days_json).map_err(|e| {
        HandlerErr::new("bad_document", format!("stored schedule is malformed: {}", e))
            .with_details(json!({ "scheduleId": id }))
    })?;
    Ok(ScheduleDoc {
        id,
        class_section_id,
        class_section_name,
        days,
    })
}

fn load_schedule(conn: &Connection, id: &str) -> Result<Option<ScheduleDoc>, HandlerErr> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT class_section_id, class_section_name, days FROM class_schedules WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query_failed)?;
    match row {
        Some((section_id, section_name, days_json)) => {
            Ok(Some(decode_row(id.to_string(), section_id, section_name, days_json)?))
        }
        None => Ok(None),
    }
}

/// Full-collection scan; the teacher projection and list views are pure
/// functions of this set and are recomputed on every call.
fn load_all_schedules(conn: &Connection) -> Result<Vec<ScheduleDoc>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, class_section_id, class_section_name, days FROM class_schedules")
        .map_err(HandlerErr::query_failed)?;
    let rows: Vec<(String, String, String, String)> = stmt
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;
    rows.into_iter()
        .map(|(id, section_id, section_name, days_json)| {
            decode_row(id, section_id, section_name, days_json)
        })
        .collect()
}

fn schedule_json(mut doc: ScheduleDoc) -> Result<serde_json::Value, HandlerErr> {
    schedule::sort_for_display(&mut doc.days);
    let days = serde_json::to_value(&doc.days)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({
        "id": doc.id,
        "classSectionId": doc.class_section_id,
        "classSectionName": doc.class_section_name,
        "days": days
    }))
}

fn create_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let days = decode_days_param(params)?;
    let Some(section_name) = section_name(conn, &section_id)? else {
        return Err(HandlerErr::not_found("class section not found"));
    };

    // A second schedule for the same section is allowed; there is no
    // uniqueness rule to enforce here.
    let schedule_id = Uuid::new_v4().to_string();
    let days_json = encode_days(&days)?;
    conn.execute(
        "INSERT INTO class_schedules(id, class_section_id, class_section_name, days)
         VALUES(?, ?, ?, ?)",
        (&schedule_id, &section_id, &section_name, &days_json),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "class_schedules" }))
    })?;

    Ok(json!({ "scheduleId": schedule_id }))
}

fn update_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let schedule_id = required_str(params, "scheduleId")?;
    let days = decode_days_param(params)?;
    let days_json = encode_days(&days)?;

    // Whole-document replacement of the grid; periods are never patched
    // individually.
    let updated = conn
        .execute(
            "UPDATE class_schedules SET days = ? WHERE id = ?",
            (&days_json, &schedule_id),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "class_schedules" }))
        })?;
    if updated == 0 {
        return Err(HandlerErr::not_found("schedule not found"));
    }
    Ok(json!({ "ok": true }))
}

fn get_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let schedule_id = required_str(params, "scheduleId")?;
    let Some(doc) = load_schedule(conn, &schedule_id)? else {
        return Err(HandlerErr::not_found("schedule not found"));
    };
    Ok(json!({ "schedule": schedule_json(doc)? }))
}

fn schedules_for_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, class_section_id, class_section_name, days
             FROM class_schedules
             WHERE class_section_id = ?",
        )
        .map_err(HandlerErr::query_failed)?;
    let rows: Vec<(String, String, String, String)> = stmt
        .query_map([&section_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;

    let mut schedules: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    for (id, owner_id, owner_name, days_json) in rows {
        schedules.push(schedule_json(decode_row(id, owner_id, owner_name, days_json)?)?);
    }
    Ok(json!({ "schedules": schedules }))
}

fn list_schedules(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let docs = load_all_schedules(conn)?;
    let mut schedules: Vec<serde_json::Value> = Vec::with_capacity(docs.len());
    for doc in docs {
        schedules.push(schedule_json(doc)?);
    }
    Ok(json!({ "schedules": schedules }))
}

fn delete_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let schedule_id = required_str(params, "scheduleId")?;
    let deleted = conn
        .execute("DELETE FROM class_schedules WHERE id = ?", [&schedule_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "class_schedules" }))
        })?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("schedule not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Draft helper over an in-flight grid; nothing is persisted. The caller
/// owns the draft and submits it through create/update when done.
fn add_period(
    _conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut days = decode_days_param(params)?;
    let day_index = required_u64(params, "dayIndex")? as usize;
    schedule::add_period(&mut days, day_index).map_err(HandlerErr::bad_params)?;
    let days = serde_json::to_value(&days).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({ "days": days }))
}

fn remove_period(
    _conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut days = decode_days_param(params)?;
    let day_index = required_u64(params, "dayIndex")? as usize;
    let period_index = required_u64(params, "periodIndex")? as usize;
    schedule::remove_period(&mut days, day_index, period_index).map_err(HandlerErr::bad_params)?;
    let days = serde_json::to_value(&days).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({ "days": days }))
}

fn week_for_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let schedules = load_all_schedules(conn)?;
    let week = schedule::project_for_teacher(&teacher_id, &schedules);
    let days = serde_json::to_value(&week).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({ "teacherId": teacher_id, "days": days }))
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
        "timetable.create" => Some(handle(state, req, create_schedule)),
        "timetable.update" => Some(handle(state, req, update_schedule)),
        "timetable.get" => Some(handle(state, req, get_schedule)),
        "timetable.forClass" => Some(handle(state, req, schedules_for_class)),
        "timetable.list" => Some(handle(state, req, list_schedules)),
        "timetable.delete" => Some(handle(state, req, delete_schedule)),
        "timetable.addPeriod" => Some(handle(state, req, add_period)),
        "timetable.removePeriod" => Some(handle(state, req, remove_period)),
        "timetable.forTeacher" => Some(handle(state, req, week_for_teacher)),
        _ => None,
    }
}

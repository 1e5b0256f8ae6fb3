use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, required_bool, required_str, required_text, required_u64};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn section_name(conn: &Connection, section_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT name FROM class_sections WHERE id = ?",
        [section_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query_failed)
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub name: String,
    pub roll_no: i64,
    pub sort_order: i64,
    pub active: bool,
}

/// The section's current roster in stable order. When `active_only` is set,
/// only currently enrolled students are returned (the set attendance drafts
/// and exam snapshots work from).
pub fn list_roster(
    conn: &Connection,
    section_id: &str,
    active_only: bool,
) -> Result<Vec<RosterStudent>, HandlerErr> {
    let sql = if active_only {
        "SELECT id, name, roll_no, sort_order, active
         FROM students
         WHERE class_section_id = ? AND active = 1
         ORDER BY sort_order"
    } else {
        "SELECT id, name, roll_no, sort_order, active
         FROM students
         WHERE class_section_id = ?
         ORDER BY sort_order"
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query_failed)?;
    stmt.query_map([section_id], |r| {
        Ok(RosterStudent {
            id: r.get(0)?,
            name: r.get(1)?,
            roll_no: r.get(2)?,
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query_failed)
}

fn create_section(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_text(params, "name")?;
    let section_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_sections(id, name) VALUES(?, ?)",
        (&section_id, &name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "class_sections" }))
    })?;
    Ok(json!({ "sectionId": section_id, "name": name }))
}

fn list_sections(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM class_sections ORDER BY name")
        .map_err(HandlerErr::query_failed)?;
    let rows: Vec<(String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;

    // One count query per section; cheap at this scale and keeps reads to
    // plain equality filters.
    let mut sections: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    for (id, name) in rows {
        let student_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE class_section_id = ?",
                [&id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::query_failed)?;
        sections.push(json!({
            "id": id,
            "name": name,
            "studentCount": student_count
        }));
    }

    Ok(json!({ "sections": sections }))
}

fn delete_section(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "sectionId")?;
    if section_name(conn, &section_id)?.is_none() {
        return Err(HandlerErr::not_found("class section not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Children before parents. Attendance records carry the section id
    // denormalized, so no session lookup is needed.
    for (table, sql) in [
        (
            "attendance_records",
            "DELETE FROM attendance_records WHERE class_section_id = ?",
        ),
        (
            "attendance_sessions",
            "DELETE FROM attendance_sessions WHERE class_section_id = ?",
        ),
        ("exams", "DELETE FROM exams WHERE class_section_id = ?"),
        (
            "class_schedules",
            "DELETE FROM class_schedules WHERE class_section_id = ?",
        ),
        ("students", "DELETE FROM students WHERE class_section_id = ?"),
        ("class_sections", "DELETE FROM class_sections WHERE id = ?"),
    ] {
        tx.execute(sql, [&section_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn add_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let name = required_text(params, "name")?;
    let roll_no = required_u64(params, "rollNo")? as i64;
    if section_name(conn, &section_id)?.is_none() {
        return Err(HandlerErr::not_found("class section not found"));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_section_id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query_failed)?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_section_id, name, roll_no, sort_order, active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&student_id, &section_id, &name, roll_no, sort_order),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student_id, "sortOrder": sort_order }))
}

fn list_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let students: Vec<serde_json::Value> = list_roster(conn, &section_id, false)?
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "rollNo": s.roll_no,
                "sortOrder": s.sort_order,
                "active": s.active
            })
        })
        .collect();
    Ok(json!({ "students": students }))
}

fn set_student_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let active = required_bool(params, "active")?;
    let updated = conn
        .execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "students" }))
        })?;
    if updated == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "ok": true }))
}

fn remove_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let deleted = conn
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "students" }))
        })?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "ok": true }))
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
        "sections.create" => Some(handle(state, req, create_section)),
        "sections.list" => Some(handle(state, req, list_sections)),
        "sections.delete" => Some(handle(state, req, delete_section)),
        "roster.add" => Some(handle(state, req, add_student)),
        "roster.list" => Some(handle(state, req, list_students)),
        "roster.setActive" => Some(handle(state, req, set_student_active)),
        "roster.remove" => Some(handle(state, req, remove_student)),
        _ => None,
    }
}

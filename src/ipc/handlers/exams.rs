use crate::calc::{self, ExamFigure, MarkEntry};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, required_str, required_text};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::sections::{list_roster, section_name};

#[derive(Debug, Clone)]
struct ExamDoc {
    id: String,
    name: String,
    subject: String,
    class_section_id: String,
    class_section_name: String,
    teacher_id: String,
    teacher_name: String,
    max_marks: i64,
    marks: Vec<MarkEntry>,
    created_at: String,
}

const EXAM_COLUMNS: &str = "id, name, subject, class_section_id, class_section_name, \
                            teacher_id, teacher_name, max_marks, marks, created_at";

/// Decodes a stored exam row, failing fast when the embedded mark list does
/// not match the typed shape.
fn decode_exam_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(ExamDoc, Option<String>)> {
    let id: String = r.get(0)?;
    let marks_json: String = r.get(8)?;
    let decoded: Result<Vec<MarkEntry>, _> = serde_json::from_str(&marks_json);
    let (marks, decode_err) = match decoded {
        Ok(marks) => (marks, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };
    Ok((
        ExamDoc {
            id,
            name: r.get(1)?,
            subject: r.get(2)?,
            class_section_id: r.get(3)?,
            class_section_name: r.get(4)?,
            teacher_id: r.get(5)?,
            teacher_name: r.get(6)?,
            max_marks: r.get(7)?,
            marks,
            created_at: r.get(9)?,
        },
        decode_err,
    ))
}

fn check_decode(doc: ExamDoc, decode_err: Option<String>) -> Result<ExamDoc, HandlerErr> {
    match decode_err {
        None => Ok(doc),
        Some(e) => Err(
            HandlerErr::new("bad_document", format!("stored exam is malformed: {}", e))
                .with_details(json!({ "examId": doc.id })),
        ),
    }
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<Option<ExamDoc>, HandlerErr> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLUMNS),
            [exam_id],
            decode_exam_row,
        )
        .optional()
        .map_err(HandlerErr::query_failed)?;
    match row {
        Some((doc, decode_err)) => Ok(Some(check_decode(doc, decode_err)?)),
        None => Ok(None),
    }
}

fn load_exams_where(
    conn: &Connection,
    filter_column: Option<&str>,
    value: &str,
) -> Result<Vec<ExamDoc>, HandlerErr> {
    let sql = match filter_column {
        Some(column) => format!(
            "SELECT {} FROM exams WHERE {} = ? ORDER BY created_at, id",
            EXAM_COLUMNS, column
        ),
        None => format!("SELECT {} FROM exams ORDER BY created_at, id", EXAM_COLUMNS),
    };
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query_failed)?;
    let rows = match filter_column {
        Some(_) => stmt.query_map([value], decode_exam_row),
        None => stmt.query_map([], decode_exam_row),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query_failed)?;

    rows.into_iter()
        .map(|(doc, decode_err)| check_decode(doc, decode_err))
        .collect()
}

fn marks_json(marks: &[MarkEntry]) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(marks).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn exam_json(doc: &ExamDoc) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "id": doc.id,
        "name": doc.name,
        "subject": doc.subject,
        "classSectionId": doc.class_section_id,
        "classSectionName": doc.class_section_name,
        "teacherId": doc.teacher_id,
        "teacherName": doc.teacher_name,
        "maxMarks": doc.max_marks,
        "marks": marks_json(&doc.marks)?,
        "createdAt": doc.created_at
    }))
}

fn exam_summary_json(doc: &ExamDoc) -> serde_json::Value {
    json!({
        "id": doc.id,
        "name": doc.name,
        "subject": doc.subject,
        "classSectionId": doc.class_section_id,
        "classSectionName": doc.class_section_name,
        "teacherId": doc.teacher_id,
        "teacherName": doc.teacher_name,
        "maxMarks": doc.max_marks,
        "entryCount": doc.marks.len(),
        "createdAt": doc.created_at
    })
}

fn required_max_marks(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    match params.get("maxMarks").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => Ok(v),
        _ => Err(HandlerErr::bad_params("maxMarks must be a positive integer")),
    }
}

fn decode_marks_param(params: &serde_json::Value) -> Result<Option<Vec<MarkEntry>>, HandlerErr> {
    let Some(raw) = params.get("marks") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let marks: Vec<MarkEntry> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("marks did not decode: {}", e)))?;
    Ok(Some(marks))
}

/// Creates an exam with a full roster snapshot. When the caller supplies no
/// marks, the active roster is captured with zeroed values for the teacher
/// to fill in and overwrite later; either way the whole set is validated
/// before anything is written.
fn create_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_text(params, "name")?;
    let subject = required_text(params, "subject")?;
    let section_id = required_str(params, "classSectionId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let max_marks = required_max_marks(params)?;

    let Some(section_name) = section_name(conn, &section_id)? else {
        return Err(HandlerErr::not_found("class section not found"));
    };

    let marks = match decode_marks_param(params)? {
        Some(marks) => marks,
        None => list_roster(conn, &section_id, true)?
            .iter()
            .map(|s| MarkEntry {
                student_id: s.id.clone(),
                student_name: s.name.clone(),
                roll_no: s.roll_no,
                marks: 0.0,
            })
            .collect(),
    };
    calc::validate_marks(&marks, max_marks).map_err(HandlerErr::bad_params)?;

    // Dangling teacher ids are tolerated; the snapshot name is just blank.
    let teacher_name: String = conn
        .query_row("SELECT name FROM users WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query_failed)?
        .unwrap_or_default();

    let exam_id = Uuid::new_v4().to_string();
    let marks_body =
        serde_json::to_string(&marks).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO exams(
            id, name, subject, class_section_id, class_section_name,
            teacher_id, teacher_name, max_marks, marks, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &name,
            &subject,
            &section_id,
            &section_name,
            &teacher_id,
            &teacher_name,
            max_marks,
            &marks_body,
            &created_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "exams" }))
    })?;

    Ok(json!({ "examId": exam_id, "entryCount": marks.len() }))
}

/// Full overwrite of the mutable fields; the mark list is never patched
/// entry by entry.
fn update_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let name = required_text(params, "name")?;
    let max_marks = required_max_marks(params)?;
    let Some(marks) = decode_marks_param(params)? else {
        return Err(HandlerErr::bad_params("missing marks"));
    };
    calc::validate_marks(&marks, max_marks).map_err(HandlerErr::bad_params)?;

    let marks_body =
        serde_json::to_string(&marks).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    let updated = conn
        .execute(
            "UPDATE exams SET name = ?, max_marks = ?, marks = ? WHERE id = ?",
            (&name, max_marks, &marks_body, &exam_id),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "exams" }))
        })?;
    if updated == 0 {
        return Err(HandlerErr::not_found("exam not found"));
    }
    Ok(json!({ "ok": true }))
}

/// Optional requesting identity: when present it must match the owning
/// teacher.
fn check_owner(doc: &ExamDoc, params: &serde_json::Value) -> Result<(), HandlerErr> {
    if let Some(teacher_id) = optional_str(params, "teacherId") {
        if doc.teacher_id != teacher_id {
            return Err(HandlerErr::forbidden("exam belongs to a different teacher"));
        }
    }
    Ok(())
}

fn get_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let Some(doc) = load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    check_owner(&doc, params)?;
    Ok(json!({ "exam": exam_json(&doc)? }))
}

fn delete_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let Some(doc) = load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    check_owner(&doc, params)?;
    conn.execute("DELETE FROM exams WHERE id = ?", [&exam_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "exams" }))
        })?;
    Ok(json!({ "ok": true }))
}

fn list_for_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let exams: Vec<serde_json::Value> = load_exams_where(conn, Some("class_section_id"), &section_id)?
        .iter()
        .map(exam_summary_json)
        .collect();
    Ok(json!({ "exams": exams }))
}

fn list_for_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = required_str(params, "teacherId")?;
    let exams: Vec<serde_json::Value> = load_exams_where(conn, Some("teacher_id"), &teacher_id)?
        .iter()
        .map(exam_summary_json)
        .collect();
    Ok(json!({ "exams": exams }))
}

/// Exams that include the student, found by scanning the collection; the
/// embedded mark list is the only place that membership lives.
fn list_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let mut exams: Vec<serde_json::Value> = Vec::new();
    for doc in load_exams_where(conn, None, "")? {
        let Some(entry) = doc.marks.iter().find(|m| m.student_id == student_id) else {
            continue;
        };
        let mut summary = exam_summary_json(&doc);
        let percent = if doc.max_marks > 0 {
            100.0 * entry.marks / doc.max_marks as f64
        } else {
            0.0
        };
        let obj = summary.as_object_mut().expect("summary is an object");
        obj.insert("marks".into(), json!(entry.marks));
        obj.insert("percent".into(), json!(percent));
        exams.push(summary);
    }
    Ok(json!({ "studentId": student_id, "exams": exams }))
}

fn exam_stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let Some(doc) = load_exam(conn, &exam_id)? else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    let stats = calc::exam_stats(&doc.marks, doc.max_marks);
    let stats =
        serde_json::to_value(&stats).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({
        "examId": doc.id,
        "name": doc.name,
        "subject": doc.subject,
        "maxMarks": doc.max_marks,
        "stats": stats
    }))
}

fn subject_figures(docs: &[ExamDoc]) -> Vec<ExamFigure> {
    docs.iter()
        .map(|doc| ExamFigure {
            subject: doc.subject.clone(),
            average_percent: calc::exam_stats(&doc.marks, doc.max_marks).average_percent,
        })
        .collect()
}

fn subject_averages(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_id = required_str(params, "classSectionId")?;
    let docs = load_exams_where(conn, Some("class_section_id"), &section_id)?;
    let subjects = calc::subject_averages(&subject_figures(&docs));
    let subjects =
        serde_json::to_value(&subjects).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({ "classSectionId": section_id, "subjects": subjects }))
}

/// Per-subject mean of this student's own percentage across all exams. One
/// mark per exam per student, so this is a single-level mean.
fn student_subject_averages(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let mut figures: Vec<ExamFigure> = Vec::new();
    for doc in load_exams_where(conn, None, "")? {
        let Some(entry) = doc.marks.iter().find(|m| m.student_id == student_id) else {
            continue;
        };
        if doc.max_marks <= 0 {
            continue;
        }
        figures.push(ExamFigure {
            subject: doc.subject.clone(),
            average_percent: 100.0 * entry.marks / doc.max_marks as f64,
        });
    }
    let subjects = calc::subject_averages(&figures);
    let subjects =
        serde_json::to_value(&subjects).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    Ok(json!({ "studentId": student_id, "subjects": subjects }))
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
        "exams.create" => Some(handle(state, req, create_exam)),
        "exams.update" => Some(handle(state, req, update_exam)),
        "exams.get" => Some(handle(state, req, get_exam)),
        "exams.delete" => Some(handle(state, req, delete_exam)),
        "exams.listForClass" => Some(handle(state, req, list_for_class)),
        "exams.listForTeacher" => Some(handle(state, req, list_for_teacher)),
        "exams.listForStudent" => Some(handle(state, req, list_for_student)),
        "exams.stats" => Some(handle(state, req, exam_stats)),
        "exams.subjectAverages" => Some(handle(state, req, subject_averages)),
        "exams.studentSubjectAverages" => Some(handle(state, req, student_subject_averages)),
        _ => None,
    }
}

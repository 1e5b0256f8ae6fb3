use serde_json::json;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolportald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolportald");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

/// Workspace with one section and a five-student roster; returns the section
/// id and the student ids in roster order.
fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, Vec<String>) {
    request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let section = request_ok(
        stdin,
        reader,
        "setup-section",
        "sections.create",
        json!({ "name": "5-A" }),
    );
    let section_id = section["sectionId"].as_str().expect("sectionId").to_string();

    let mut student_ids = Vec::new();
    for i in 1..=5 {
        let added = request_ok(
            stdin,
            reader,
            &format!("setup-student-{}", i),
            "roster.add",
            json!({
                "classSectionId": section_id,
                "name": format!("Student {}", i),
                "rollNo": i
            }),
        );
        student_ids.push(added["studentId"].as_str().expect("studentId").to_string());
    }
    (section_id, student_ids)
}

fn statuses(student_ids: &[String], present_count: usize) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (i, id) in student_ids.iter().enumerate() {
        let status = if i < present_count { "present" } else { "absent" };
        map.insert(id.clone(), json!(status));
    }
    serde_json::Value::Object(map)
}

fn record_status_map(records: &serde_json::Value) -> BTreeMap<String, String> {
    records
        .as_array()
        .expect("records array")
        .iter()
        .map(|r| {
            (
                r["studentId"].as_str().expect("studentId").to_string(),
                r["status"].as_str().expect("status").to_string(),
            )
        })
        .collect()
}

#[test]
fn open_defaults_every_enrolled_student_to_present() {
    let workspace = temp_dir("portal-attendance-open");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let draft = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.open",
        json!({ "classSectionId": section_id, "date": "2024-03-01" }),
    );
    assert!(draft["sessionId"].is_null());
    let students = draft["students"].as_array().expect("students");
    assert_eq!(students.len(), 5);
    assert!(students.iter().all(|s| s["status"].as_str() == Some("present")));

    // Withdrawn students drop out of the draft roster.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roster.setActive",
        json!({ "studentId": student_ids[4], "active": false }),
    );
    let draft = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.open",
        json!({ "classSectionId": section_id, "date": "2024-03-01" }),
    );
    assert_eq!(draft["students"].as_array().map(|s| s.len()), Some(4));
}

#[test]
fn mark_all_draft_overwrites_the_working_map() {
    let workspace = temp_dir("portal-attendance-markall");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, _student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let draft = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.open",
        json!({ "classSectionId": section_id, "date": "2024-03-01" }),
    );
    let mut working = serde_json::Map::new();
    for student in draft["students"].as_array().expect("students") {
        working.insert(
            student["studentId"].as_str().expect("studentId").to_string(),
            student["status"].clone(),
        );
    }

    let flipped = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.markAll",
        json!({ "statuses": working, "status": "absent" }),
    );
    let statuses = flipped["statuses"].as_object().expect("statuses");
    assert_eq!(statuses.len(), 5);
    assert!(statuses.values().all(|v| v.as_str() == Some("absent")));

    // Submitting the flipped draft lands as a fully absent session.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-01",
            "statuses": flipped["statuses"]
        }),
    );
    assert_eq!(marked["presentCount"].as_i64(), Some(0));
    assert_eq!(marked["absentCount"].as_i64(), Some(5));
}

#[test]
fn marking_keeps_counts_and_records_in_step() {
    let workspace = temp_dir("portal-attendance-mark");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    // First mark: 3 present, 2 absent, exactly 5 records.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-01",
            "statuses": statuses(&student_ids, 3)
        }),
    );
    assert_eq!(marked["presentCount"].as_i64(), Some(3));
    assert_eq!(marked["absentCount"].as_i64(), Some(2));
    assert_eq!(marked["recordCount"].as_i64(), Some(5));
    let session_id = marked["sessionId"].as_str().expect("sessionId").to_string();

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.records",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(records["records"].as_array().map(|r| r.len()), Some(5));

    // Re-mark the same day: same session, counts flip, still 5 records.
    let remarked = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-01",
            "statuses": statuses(&student_ids, 1)
        }),
    );
    assert_eq!(remarked["sessionId"].as_str(), Some(session_id.as_str()));
    assert_eq!(remarked["presentCount"].as_i64(), Some(1));
    assert_eq!(remarked["absentCount"].as_i64(), Some(4));

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.records",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(records["records"].as_array().map(|r| r.len()), Some(5));

    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.sessionsForClass",
        json!({ "classSectionId": section_id }),
    );
    assert_eq!(sessions["sessions"].as_array().map(|s| s.len()), Some(1));
    assert_eq!(sessions["sessions"][0]["presentCount"].as_i64(), Some(1));

    // A different day is a different session.
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-02",
            "statuses": statuses(&student_ids, 5)
        }),
    );
    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.sessionsForClass",
        json!({ "classSectionId": section_id }),
    );
    assert_eq!(sessions["sessions"].as_array().map(|s| s.len()), Some(2));
}

#[test]
fn remarking_with_the_same_statuses_is_idempotent() {
    let workspace = temp_dir("portal-attendance-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let payload = json!({
        "teacherId": "T1",
        "classSectionId": section_id,
        "date": "2024-03-01",
        "statuses": statuses(&student_ids, 2)
    });
    let first = request_ok(&mut stdin, &mut reader, "1", "attendance.mark", payload.clone());
    let session_id = first["sessionId"].as_str().expect("sessionId").to_string();
    let records = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.records",
        json!({ "sessionId": session_id }),
    );
    let before = record_status_map(&records["records"]);

    let second = request_ok(&mut stdin, &mut reader, "3", "attendance.mark", payload);
    assert_eq!(second["sessionId"].as_str(), Some(session_id.as_str()));
    let records = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.records",
        json!({ "sessionId": session_id }),
    );
    let after = record_status_map(&records["records"]);
    assert_eq!(before, after);
}

#[test]
fn delete_session_checks_ownership_and_removes_records() {
    let workspace = temp_dir("portal-attendance-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-01",
            "statuses": statuses(&student_ids, 4)
        }),
    );
    let session_id = marked["sessionId"].as_str().expect("sessionId").to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.deleteSession",
        json!({ "sessionId": session_id, "teacherId": "T2" }),
    );
    assert_eq!(error_code(&resp), "forbidden");

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.deleteSession",
        json!({ "sessionId": session_id, "teacherId": "T1" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.records",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.sessionsForClass",
        json!({ "classSectionId": section_id }),
    );
    assert_eq!(sessions["sessions"].as_array().map(|s| s.len()), Some(0));
}

#[test]
fn malformed_marks_are_rejected_whole() {
    let workspace = temp_dir("portal-attendance-badinput");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "03/01/2024",
            "statuses": statuses(&student_ids, 3)
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let mut bad_status = serde_json::Map::new();
    bad_status.insert(student_ids[0].clone(), json!("tardy"));
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-01",
            "statuses": bad_status
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "teacherId": "T1",
            "classSectionId": section_id,
            "date": "2024-03-01",
            "statuses": {}
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    // Nothing was written along the way.
    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.sessionsForClass",
        json!({ "classSectionId": section_id }),
    );
    assert_eq!(sessions["sessions"].as_array().map(|s| s.len()), Some(0));
}

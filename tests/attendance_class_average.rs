use serde_json::json;
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

fn class_average(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    section_id: &str,
) -> (usize, f64) {
    let result = request_ok(
        stdin,
        reader,
        id,
        "attendance.classAverage",
        json!({ "classSectionId": section_id }),
    );
    (
        result["sessionCount"].as_u64().expect("sessionCount") as usize,
        result["averageAttendance"].as_f64().expect("averageAttendance"),
    )
}

#[test]
fn class_average_steps_through_the_running_mean() {
    let workspace = temp_dir("portal-class-average");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let (count, avg) = class_average(&mut stdin, &mut reader, "0", &section_id);
    assert_eq!(count, 0);
    assert_eq!(avg, 0.0);

    // Session percentages land at 80, 100, 60 in date order; the running
    // mean steps 80 -> 90 -> 80.
    for (i, (date, present)) in [
        ("2024-03-01", 4usize),
        ("2024-03-02", 5),
        ("2024-03-03", 3),
    ]
    .iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            json!({
                "teacherId": "T1",
                "classSectionId": section_id,
                "date": date,
                "statuses": statuses(&student_ids, *present)
            }),
        );
    }

    let (count, avg) = class_average(&mut stdin, &mut reader, "avg", &section_id);
    assert_eq!(count, 3);
    assert!((avg - 80.0).abs() < 1e-9, "got {}", avg);
}

#[test]
fn class_average_after_each_session_matches_the_formula() {
    let workspace = temp_dir("portal-class-average-steps");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    let steps = [
        ("2024-03-01", 4usize, 80.0),
        ("2024-03-02", 5, 90.0),
        ("2024-03-03", 3, 80.0),
    ];
    for (i, (date, present, expected)) in steps.iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            json!({
                "teacherId": "T1",
                "classSectionId": section_id,
                "date": date,
                "statuses": statuses(&student_ids, *present)
            }),
        );
        let (_, avg) = class_average(&mut stdin, &mut reader, &format!("avg-{}", i), &section_id);
        assert!((avg - expected).abs() < 1e-9, "step {}: got {}", i, avg);
    }
}

#[test]
fn student_summary_rounds_personal_percentage() {
    let workspace = temp_dir("portal-student-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    // Student 5 (the last roster entry) is present on one of three days.
    for (i, (date, present)) in [
        ("2024-03-01", 5usize),
        ("2024-03-02", 4),
        ("2024-03-03", 4),
    ]
    .iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            json!({
                "teacherId": "T1",
                "classSectionId": section_id,
                "date": date,
                "statuses": statuses(&student_ids, *present)
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "summary",
        "attendance.studentSummary",
        json!({ "studentId": student_ids[4] }),
    );
    assert_eq!(summary["presentCount"].as_i64(), Some(1));
    assert_eq!(summary["absentCount"].as_i64(), Some(2));
    // 1/3 rounds to 33 percent.
    assert_eq!(summary["percentage"].as_i64(), Some(33));
    assert_eq!(summary["records"].as_array().map(|r| r.len()), Some(3));

    // A student with no records reads as zero, not an error.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "summary-none",
        "attendance.studentSummary",
        json!({ "studentId": "ghost" }),
    );
    assert_eq!(summary["percentage"].as_i64(), Some(0));
    assert_eq!(summary["records"].as_array().map(|r| r.len()), Some(0));
}

#[test]
fn teacher_session_listing_is_date_ordered() {
    let workspace = temp_dir("portal-teacher-sessions");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (section_id, student_ids) = setup_class(&mut stdin, &mut reader, &workspace);

    // Marked out of calendar order on purpose.
    for (i, date) in ["2024-03-05", "2024-03-01", "2024-03-03"].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            json!({
                "teacherId": "T1",
                "classSectionId": section_id,
                "date": date,
                "statuses": statuses(&student_ids, 5)
            }),
        );
    }

    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "attendance.sessionsForTeacher",
        json!({ "teacherId": "T1" }),
    );
    let dates: Vec<&str> = sessions["sessions"]
        .as_array()
        .expect("sessions")
        .iter()
        .map(|s| s["date"].as_str().expect("date"))
        .collect();
    assert_eq!(dates, vec!["2024-03-01", "2024-03-03", "2024-03-05"]);
    assert_eq!(
        sessions["sessions"][0]["classSectionName"].as_str(),
        Some("5-A")
    );
}

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
    let exe = env!("CARGO_BIN_EXE_tuitiond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tuitiond");
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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "name": name,
            "category": "School (8-10th)",
            "course": "10th Science",
            "year": 10,
            "enrollmentDate": "2024-01-10"
        }),
    );
    created
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

fn row_for<'a>(rows: &'a [serde_json::Value], student_id: &str) -> &'a serde_json::Value {
    rows.iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .expect("summary row for student")
}

#[test]
fn per_student_rates_follow_present_share() {
    let workspace = temp_dir("tuition-attendance-rates");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let full = create_student(&mut stdin, &mut reader, "2", "Always Present");
    let partial = create_student(&mut stdin, &mut reader, "3", "Mostly Present");
    let empty = create_student(&mut stdin, &mut reader, "4", "Never Marked");

    // Three sessions in March: full P,P,P; partial P,P,A.
    let days = ["2024-03-04", "2024-03-05", "2024-03-06"];
    for (i, day) in days.iter().enumerate() {
        let partial_status = if i == 2 { "Absent" } else { "Present" };
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("m{}", i),
            "attendance.bulkMark",
            json!({
                "date": day,
                "subject": "Mathematics",
                "entries": [
                    { "studentId": full, "status": "Present" },
                    { "studentId": partial, "status": partial_status }
                ]
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.summary",
        json!({ "month": "2024-03" }),
    );
    let rows = summary
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows");
    assert_eq!(rows.len(), 3);

    let full_row = row_for(rows, &full);
    assert_eq!(full_row.get("totalClasses"), Some(&json!(3)));
    assert_eq!(full_row.get("rate"), Some(&json!(100)));
    assert_eq!(
        full_row.get("lastDate").and_then(|v| v.as_str()),
        Some("2024-03-06")
    );

    let partial_row = row_for(rows, &partial);
    assert_eq!(partial_row.get("presentClasses"), Some(&json!(2)));
    assert_eq!(partial_row.get("rate"), Some(&json!(67)));
    assert_eq!(
        partial_row.get("lastStatus").and_then(|v| v.as_str()),
        Some("Absent")
    );

    let empty_row = row_for(rows, &empty);
    assert_eq!(empty_row.get("totalClasses"), Some(&json!(0)));
    assert_eq!(empty_row.get("rate"), Some(&json!(0)));
    assert!(empty_row.get("lastDate").map(|v| v.is_null()).unwrap_or(false));

    // Overall averages the two marked students: (100 + 67) / 2 -> 84.
    assert_eq!(summary.get("overallRate"), Some(&json!(84)));
    assert_eq!(summary.get("recordCount"), Some(&json!(6)));

    let month = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.studentMonth",
        json!({ "studentId": partial, "month": "2024-03" }),
    );
    assert_eq!(month.pointer("/totals/classes"), Some(&json!(3)));
    assert_eq!(month.pointer("/totals/present"), Some(&json!(2)));
    assert_eq!(month.pointer("/totals/absent"), Some(&json!(1)));
    assert_eq!(month.get("rate"), Some(&json!(67)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn remark_overwrites_instead_of_duplicating() {
    let workspace = temp_dir("tuition-attendance-remark");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = create_student(&mut stdin, &mut reader, "2", "Flip Flop");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "studentId": student,
            "date": "2024-03-04",
            "subject": "Physics",
            "status": "Absent"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({
            "studentId": student,
            "date": "2024-03-04",
            "subject": "Physics",
            "status": "Present"
        }),
    );

    let month = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.studentMonth",
        json!({ "studentId": student, "month": "2024-03" }),
    );
    assert_eq!(month.pointer("/totals/classes"), Some(&json!(1)));
    assert_eq!(month.pointer("/totals/present"), Some(&json!(1)));
    assert_eq!(month.get("rate"), Some(&json!(100)));

    // A different subject on the same day is a separate session.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.mark",
        json!({
            "studentId": student,
            "date": "2024-03-04",
            "subject": "Chemistry",
            "status": "Late"
        }),
    );
    let month = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.studentMonth",
        json!({ "studentId": student, "month": "2024-03" }),
    );
    assert_eq!(month.pointer("/totals/classes"), Some(&json!(2)));
    assert_eq!(month.pointer("/totals/late"), Some(&json!(1)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_mark_rejects_whole_batch_on_any_bad_entry() {
    let workspace = temp_dir("tuition-attendance-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = create_student(&mut stdin, &mut reader, "2", "Solo Student");

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.bulkMark",
        json!({
            "date": "2024-03-04",
            "subject": "Physics",
            "entries": [
                { "studentId": student, "status": "Present" },
                { "studentId": student, "status": "Sleeping" }
            ]
        }),
    );
    assert_eq!(bad_status.get("ok"), Some(&json!(false)));
    assert_eq!(
        bad_status.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let missing_student = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.bulkMark",
        json!({
            "date": "2024-03-04",
            "subject": "Physics",
            "entries": [
                { "studentId": student, "status": "Present" },
                { "studentId": "ghost", "status": "Present" }
            ]
        }),
    );
    assert_eq!(missing_student.get("ok"), Some(&json!(false)));
    assert_eq!(
        missing_student
            .pointer("/error/code")
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    // Neither rejected batch should have left a row behind.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.summary",
        json!({ "month": "2024-03" }),
    );
    assert_eq!(summary.get("recordCount"), Some(&json!(0)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn subject_filter_narrows_summary() {
    let workspace = temp_dir("tuition-attendance-subject");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = create_student(&mut stdin, &mut reader, "2", "Subject Split");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "studentId": student,
            "date": "2024-03-04",
            "subject": "Physics",
            "status": "Present"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({
            "studentId": student,
            "date": "2024-03-05",
            "subject": "Chemistry",
            "status": "Absent"
        }),
    );

    let physics = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.summary",
        json!({ "month": "2024-03", "subject": "Physics" }),
    );
    let rows = physics.get("rows").and_then(|v| v.as_array()).expect("rows");
    let row = row_for(rows, &student);
    assert_eq!(row.get("totalClasses"), Some(&json!(1)));
    assert_eq!(row.get("rate"), Some(&json!(100)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

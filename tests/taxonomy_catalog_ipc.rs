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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok"), Some(&json!(false)), "expected error: {}", value);
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
}

fn category_names(listing: &serde_json::Value) -> Vec<String> {
    listing
        .get("categories")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn courses_in<'a>(listing: &'a serde_json::Value, category: &str) -> Vec<&'a serde_json::Value> {
    listing
        .get("categories")
        .and_then(|v| v.as_array())
        .and_then(|a| {
            a.iter()
                .find(|c| c.get("name").and_then(|v| v.as_str()) == Some(category))
        })
        .and_then(|c| c.get("courses").and_then(|v| v.as_array()))
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

#[test]
fn seeded_catalog_lists_in_enrolment_form_order() {
    let workspace = temp_dir("tuition-taxonomy-seed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let listing = request_ok(&mut stdin, &mut reader, "2", "taxonomy.list", json!({}));
    assert_eq!(
        category_names(&listing),
        vec![
            "School (8-10th)",
            "Junior College (11-12th)",
            "Diploma",
            "Degree",
            "JEE",
            "NEET",
            "MHCET",
        ]
    );

    let school = courses_in(&listing, "School (8-10th)");
    let school_names: Vec<&str> = school
        .iter()
        .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(school_names, vec!["10th Science", "9th Science"]);
    let tenth = school[0];
    assert_eq!(tenth.get("yearMin"), Some(&json!(10)));
    assert_eq!(tenth.get("yearMax"), Some(&json!(10)));
    assert_eq!(
        tenth.get("subjects"),
        Some(&json!(["Physics", "Chemistry", "Biology", "Mathematics"]))
    );

    let batches = listing
        .get("batches")
        .and_then(|v| v.as_array())
        .expect("batches");
    assert_eq!(batches.len(), 5);
    assert!(batches[0].get("timing").and_then(|v| v.as_str()).is_some());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn courses_can_be_added_edited_and_upserted() {
    let workspace = temp_dir("tuition-taxonomy-save");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "taxonomy.saveCourse",
        json!({
            "category": "School (8-10th)",
            "name": "8th Foundation",
            "subjects": ["Mathematics", "Science"],
            "duration": "12 months",
            "fee": 9000.0,
            "yearMin": 8,
            "yearMax": 8
        }),
    );
    let course_id = saved
        .pointer("/course/id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();
    assert_eq!(saved.pointer("/course/fee"), Some(&json!(9000.0)));

    let listing = request_ok(&mut stdin, &mut reader, "3", "taxonomy.list", json!({}));
    let school = courses_in(&listing, "School (8-10th)");
    let names: Vec<&str> = school
        .iter()
        .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(names, vec!["10th Science", "8th Foundation", "9th Science"]);

    // Editing by id keeps the untouched fields.
    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "taxonomy.saveCourse",
        json!({ "id": course_id, "category": "School (8-10th)", "name": "8th Foundation", "fee": 9500.0 }),
    );
    assert_eq!(edited.pointer("/course/fee"), Some(&json!(9500.0)));
    assert_eq!(
        edited.pointer("/course/subjects"),
        Some(&json!(["Mathematics", "Science"]))
    );
    assert_eq!(
        edited.pointer("/course/duration").and_then(|v| v.as_str()),
        Some("12 months")
    );

    // Saving the same category and name without an id lands on that row.
    let upserted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "taxonomy.saveCourse",
        json!({
            "category": "School (8-10th)",
            "name": "8th Foundation",
            "fee": 9900.0,
            "yearMin": 8,
            "yearMax": 8
        }),
    );
    assert_eq!(
        upserted.pointer("/course/id").and_then(|v| v.as_str()),
        Some(course_id.as_str())
    );
    assert_eq!(upserted.pointer("/course/fee"), Some(&json!(9900.0)));
    let listing = request_ok(&mut stdin, &mut reader, "6", "taxonomy.list", json!({}));
    assert_eq!(courses_in(&listing, "School (8-10th)").len(), 3);

    // A category outside the standard roster goes to the end of the list.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "taxonomy.saveCourse",
        json!({ "category": "Olympiad", "name": "Math Olympiad", "yearMin": 1, "yearMax": 3 }),
    );
    let listing = request_ok(&mut stdin, &mut reader, "8", "taxonomy.list", json!({}));
    let names = category_names(&listing);
    assert_eq!(names.last().map(|s| s.as_str()), Some("Olympiad"));

    let negative_fee = request(
        &mut stdin,
        &mut reader,
        "9",
        "taxonomy.saveCourse",
        json!({ "category": "Olympiad", "name": "Physics Olympiad", "fee": -5.0 }),
    );
    assert_eq!(error_code(&negative_fee), "bad_params");
    let inverted_years = request(
        &mut stdin,
        &mut reader,
        "10",
        "taxonomy.saveCourse",
        json!({ "category": "Olympiad", "name": "Physics Olympiad", "yearMin": 3, "yearMax": 1 }),
    );
    assert_eq!(error_code(&inverted_years), "bad_params");
    let unknown_id = request(
        &mut stdin,
        &mut reader,
        "11",
        "taxonomy.saveCourse",
        json!({ "id": "missing", "category": "Olympiad", "name": "Physics Olympiad" }),
    );
    assert_eq!(error_code(&unknown_id), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn course_deletion_is_blocked_while_students_are_enrolled() {
    let workspace = temp_dir("tuition-taxonomy-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "taxonomy.saveCourse",
        json!({
            "category": "School (8-10th)",
            "name": "8th Foundation",
            "yearMin": 8,
            "yearMax": 8
        }),
    );
    let course_id = saved
        .pointer("/course/id")
        .and_then(|v| v.as_str())
        .expect("course id")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "name": "Young Scholar",
            "category": "School (8-10th)",
            "course": "8th Foundation",
            "year": 8,
            "enrollmentDate": "2024-01-10"
        }),
    );
    let student_id = created
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();

    let blocked = request(
        &mut stdin,
        &mut reader,
        "4",
        "taxonomy.deleteCourse",
        json!({ "id": course_id }),
    );
    assert_eq!(error_code(&blocked), "conflict");
    assert_eq!(blocked.pointer("/error/details/students"), Some(&json!(1)));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.delete",
        json!({ "id": student_id }),
    );
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "taxonomy.deleteCourse",
        json!({ "id": course_id }),
    );
    assert_eq!(
        deleted.get("deleted").and_then(|v| v.as_str()),
        Some(course_id.as_str())
    );
    let again = request(
        &mut stdin,
        &mut reader,
        "7",
        "taxonomy.deleteCourse",
        json!({ "id": course_id }),
    );
    assert_eq!(error_code(&again), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    total_fee: f64,
    installments: i64,
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
            "enrollmentDate": "2024-06-01",
            "totalFee": total_fee,
            "installments": installments
        }),
    );
    created
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

#[test]
fn payments_accumulate_until_settled() {
    let workspace = temp_dir("tuition-fees-accumulate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "2", "Asha Patil", 15000.0, 3);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 5000.0,
            "method": "cash",
            "date": "2024-06-05"
        }),
    );
    assert_eq!(first.pointer("/summary/amountPaid"), Some(&json!(5000.0)));
    assert_eq!(
        first.pointer("/summary/status").and_then(|v| v.as_str()),
        Some("Partial")
    );

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 4000.0,
            "method": "upi",
            "date": "2024-07-05",
            "description": "second installment"
        }),
    );
    assert_eq!(second.pointer("/summary/amountPaid"), Some(&json!(9000.0)));
    assert_eq!(second.pointer("/summary/amountDue"), Some(&json!(6000.0)));

    let last = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 6000.0,
            "method": "card",
            "date": "2024-08-05"
        }),
    );
    assert_eq!(
        last.pointer("/summary/status").and_then(|v| v.as_str()),
        Some("Paid")
    );
    assert_eq!(last.pointer("/summary/amountDue"), Some(&json!(0.0)));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.payments",
        json!({ "studentId": student_id }),
    );
    assert_eq!(history.get("count"), Some(&json!(3)));
    assert_eq!(history.get("totalPaid"), Some(&json!(15000.0)));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "id": student_id }),
    );
    assert_eq!(fetched.pointer("/student/paidFee"), Some(&json!(15000.0)));
    assert_eq!(
        fetched
            .pointer("/student/feeSummary/status")
            .and_then(|v| v.as_str()),
        Some("Paid")
    );

    let check = request_ok(&mut stdin, &mut reader, "8", "fees.checkLedger", json!({}));
    assert_eq!(check.get("consistent"), Some(&json!(true)));
    assert_eq!(check.get("checked"), Some(&json!(1)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn overpayment_is_rejected_and_leaves_ledger_untouched() {
    let workspace = temp_dir("tuition-fees-overpay");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "2", "Rohan Mehta", 10000.0, 2);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 9000.0,
            "method": "cash",
            "date": "2024-06-05"
        }),
    );

    let over = request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 1500.0,
            "method": "cash",
            "date": "2024-07-05"
        }),
    );
    assert_eq!(over.get("ok"), Some(&json!(false)));
    assert_eq!(error_code(&over), "bad_params");
    assert_eq!(
        over.pointer("/error/details/remainingDue"),
        Some(&json!(1000.0))
    );

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.payments",
        json!({ "studentId": student_id }),
    );
    assert_eq!(history.get("count"), Some(&json!(1)));
    assert_eq!(history.get("totalPaid"), Some(&json!(9000.0)));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.get",
        json!({ "id": student_id }),
    );
    assert_eq!(fetched.pointer("/student/paidFee"), Some(&json!(9000.0)));
    assert_eq!(
        fetched
            .pointer("/student/feeStatus")
            .and_then(|v| v.as_str()),
        Some("Partial")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_payments_are_rejected_up_front() {
    let workspace = temp_dir("tuition-fees-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "2", "Kiran Joshi", 8000.0, 2);

    let zero = request(
        &mut stdin,
        &mut reader,
        "3",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 0.0,
            "method": "cash",
            "date": "2024-06-05"
        }),
    );
    assert_eq!(error_code(&zero), "bad_params");

    let bad_method = request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 100.0,
            "method": "barter",
            "date": "2024-06-05"
        }),
    );
    assert_eq!(error_code(&bad_method), "bad_params");

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "5",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 100.0,
            "method": "cash",
            "date": "05-06-2024"
        }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "6",
        "fees.recordPayment",
        json!({
            "studentId": "no-such-student",
            "amount": 100.0,
            "method": "cash",
            "date": "2024-06-05"
        }),
    );
    assert_eq!(error_code(&missing), "not_found");

    // Nothing above should have written a ledger row.
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fees.payments",
        json!({ "studentId": student_id }),
    );
    assert_eq!(history.get("count"), Some(&json!(0)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn accepted_methods_setting_restricts_payments() {
    let workspace = temp_dir("tuition-fees-methods");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = create_student(&mut stdin, &mut reader, "2", "Meera Nair", 5000.0, 1);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "payment", "patch": { "acceptedMethods": ["cash", "upi"] } }),
    );

    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 1000.0,
            "method": "cheque",
            "date": "2024-06-05"
        }),
    );
    assert_eq!(error_code(&refused), "bad_params");
    assert_eq!(
        refused.pointer("/error/details/accepted"),
        Some(&json!(["cash", "upi"]))
    );

    let allowed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.recordPayment",
        json!({
            "studentId": student_id,
            "amount": 1000.0,
            "method": "upi",
            "date": "2024-06-05"
        }),
    );
    assert_eq!(allowed.pointer("/summary/amountPaid"), Some(&json!(1000.0)));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn plan_preview_matches_requested_split() {
    let workspace = temp_dir("tuition-fees-plan");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fees.plan",
        json!({ "totalFee": 15000.0, "installments": 3, "startDate": "2024-01-31" }),
    );
    assert_eq!(plan.pointer("/plan/installments"), Some(&json!(3)));
    assert_eq!(plan.pointer("/plan/installmentAmt"), Some(&json!(5000.0)));
    assert_eq!(
        plan.pointer("/plan/dates"),
        Some(&json!(["2024-01-31", "2024-02-29", "2024-03-31"]))
    );

    let clamped = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.plan",
        json!({ "totalFee": 1200.0, "installments": 99, "startDate": "2024-01-01" }),
    );
    assert_eq!(clamped.pointer("/plan/installments"), Some(&json!(24)));

    let mismatch = request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.plan",
        json!({
            "totalFee": 9000.0,
            "installments": 3,
            "dates": ["2024-01-01", "2024-02-01"]
        }),
    );
    assert_eq!(error_code(&mismatch), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ledger::LedgerError> for HandlerErr {
    fn from(e: ledger::LedgerError) -> Self {
        HandlerErr {
            code: "bad_params",
            message: e.message,
            details: e.details,
        }
    }
}

fn query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key)))?;
            Ok(Some(s.trim().to_string()))
        }
    }
}

fn get_opt_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

fn get_opt_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

fn get_opt_date_list(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))?;
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                let s = item.as_str().ok_or_else(|| {
                    HandlerErr::bad_params(format!("{} must be an array of dates", key))
                })?;
                out.push(s.trim().to_string());
            }
            Ok(Some(out))
        }
    }
}

fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn dates_from_json(text: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(text).unwrap_or_default()
}

struct StudentRow {
    id: String,
    name: String,
    email: String,
    phone: String,
    address: String,
    dob: String,
    category: String,
    course: String,
    year: i64,
    enrollment_date: String,
    total_fee: f64,
    paid_fee: f64,
    installments: i64,
    installment_amt: f64,
    installment_dates: String,
    fee_status: String,
}

const STUDENT_COLS: &str = "id, name, email, phone, address, dob, category, course, year, \
     enrollment_date, total_fee, paid_fee, installments, installment_amt, installment_dates, \
     fee_status";

fn row_to_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        phone: r.get(3)?,
        address: r.get(4)?,
        dob: r.get(5)?,
        category: r.get(6)?,
        course: r.get(7)?,
        year: r.get(8)?,
        enrollment_date: r.get(9)?,
        total_fee: r.get(10)?,
        paid_fee: r.get(11)?,
        installments: r.get(12)?,
        installment_amt: r.get(13)?,
        installment_dates: r.get(14)?,
        fee_status: r.get(15)?,
    })
}

fn student_json(s: &StudentRow) -> serde_json::Value {
    let summary = ledger::fee_summary_row(s.total_fee, s.paid_fee);
    json!({
        "id": s.id,
        "name": s.name,
        "email": s.email,
        "phone": s.phone,
        "address": s.address,
        "dob": s.dob,
        "category": s.category,
        "course": s.course,
        "year": s.year,
        "enrollmentDate": s.enrollment_date,
        "totalFee": s.total_fee,
        "paidFee": s.paid_fee,
        "installments": s.installments,
        "installmentAmt": s.installment_amt,
        "installmentDates": dates_from_json(&s.installment_dates),
        "feeStatus": s.fee_status,
        "feeSummary": summary,
    })
}

fn load_student(conn: &Connection, id: &str) -> Result<StudentRow, HandlerErr> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLS);
    conn.query_row(&sql, [id], |r| row_to_student(r))
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        })
}

struct CourseRule {
    year_min: i64,
    year_max: i64,
}

fn check_taxonomy(
    conn: &Connection,
    category: &str,
    course: &str,
    year: i64,
) -> Result<(), HandlerErr> {
    let rule = conn
        .query_row(
            "SELECT year_min, year_max FROM courses WHERE category = ? AND name = ?",
            (category, course),
            |r| {
                Ok(CourseRule {
                    year_min: r.get(0)?,
                    year_max: r.get(1)?,
                })
            },
        )
        .optional()
        .map_err(query_err)?;
    let Some(rule) = rule else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "unknown course for category".to_string(),
            details: Some(json!({ "category": category, "course": course })),
        });
    };
    if year < rule.year_min || year > rule.year_max {
        return Err(HandlerErr {
            code: "bad_params",
            message: "year out of range for course".to_string(),
            details: Some(json!({ "yearMin": rule.year_min, "yearMax": rule.year_max })),
        });
    }
    Ok(())
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let category = get_required_str(params, "category")?;
    let course = get_required_str(params, "course")?;
    let year =
        get_opt_i64(params, "year")?.ok_or_else(|| HandlerErr::bad_params("missing year"))?;
    check_taxonomy(conn, &category, &course, year)?;

    let email = get_opt_str(params, "email")?.unwrap_or_default();
    let phone = get_opt_str(params, "phone")?.unwrap_or_default();
    let address = get_opt_str(params, "address")?.unwrap_or_default();
    let dob = get_opt_str(params, "dob")?.unwrap_or_default();
    if !dob.is_empty() {
        ledger::parse_iso_date(&dob)?;
    }
    let enrollment_date = match get_opt_str(params, "enrollmentDate")? {
        Some(s) => {
            ledger::parse_iso_date(&s)?;
            s
        }
        None => today().format(ledger::DATE_FMT).to_string(),
    };

    let total_fee = get_opt_f64(params, "totalFee")?.unwrap_or(0.0);
    let installments = get_opt_i64(params, "installments")?.unwrap_or(1);
    let dates = get_opt_date_list(params, "installmentDates")?;
    let start = ledger::parse_iso_date(&enrollment_date)?;
    let plan = ledger::derive_installment_plan(total_fee, installments, dates.as_deref(), start)?;
    let fee_status = ledger::fee_status(total_fee, 0.0).as_str();

    let id = Uuid::new_v4().to_string();
    let ts = now_ts();
    let dates_json = serde_json::to_string(&plan.dates).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: None,
    })?;
    conn.execute(
        "INSERT INTO students(id, name, email, phone, address, dob, category, course, year,
            enrollment_date, total_fee, paid_fee, installments, installment_amt,
            installment_dates, fee_status, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            name,
            email,
            phone,
            address,
            dob,
            category,
            course,
            year,
            enrollment_date,
            total_fee,
            plan.installments,
            plan.installment_amt,
            dates_json,
            fee_status,
            ts,
            ts,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    let row = load_student(conn, &id)?;
    Ok(json!({ "student": student_json(&row) }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let existing = load_student(conn, &id)?;

    let name = get_opt_str(params, "name")?.unwrap_or(existing.name);
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let email = get_opt_str(params, "email")?.unwrap_or(existing.email);
    let phone = get_opt_str(params, "phone")?.unwrap_or(existing.phone);
    let address = get_opt_str(params, "address")?.unwrap_or(existing.address);
    let dob = get_opt_str(params, "dob")?.unwrap_or(existing.dob);
    if !dob.is_empty() {
        ledger::parse_iso_date(&dob)?;
    }
    let category = get_opt_str(params, "category")?.unwrap_or(existing.category);
    let course = get_opt_str(params, "course")?.unwrap_or(existing.course);
    let year = get_opt_i64(params, "year")?.unwrap_or(existing.year);
    check_taxonomy(conn, &category, &course, year)?;
    let enrollment_date = match get_opt_str(params, "enrollmentDate")? {
        Some(s) => {
            ledger::parse_iso_date(&s)?;
            s
        }
        None => existing.enrollment_date,
    };

    let total_fee = get_opt_f64(params, "totalFee")?.unwrap_or(existing.total_fee);
    let installments = get_opt_i64(params, "installments")?.unwrap_or(existing.installments);
    let given_dates = get_opt_date_list(params, "installmentDates")?;

    // Explicit dates win; otherwise the stored sequence is kept while it still
    // matches the installment count, and regenerated when the count changed.
    let existing_dates = dates_from_json(&existing.installment_dates);
    let start = ledger::parse_iso_date(&enrollment_date)?;
    let plan = match given_dates {
        Some(dates) => {
            ledger::derive_installment_plan(total_fee, installments, Some(&dates), start)?
        }
        None => {
            let clamped = ledger::clamp_installments(installments);
            if existing_dates.len() as i64 == clamped {
                ledger::derive_installment_plan(
                    total_fee,
                    installments,
                    Some(&existing_dates),
                    start,
                )?
            } else {
                ledger::derive_installment_plan(total_fee, installments, None, start)?
            }
        }
    };
    // Only payments move paid_fee; edits re-derive the status against it.
    let fee_status = ledger::fee_status(total_fee, existing.paid_fee).as_str();

    let dates_json = serde_json::to_string(&plan.dates).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;
    conn.execute(
        "UPDATE students SET name = ?, email = ?, phone = ?, address = ?, dob = ?,
            category = ?, course = ?, year = ?, enrollment_date = ?, total_fee = ?,
            installments = ?, installment_amt = ?, installment_dates = ?, fee_status = ?,
            updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            name,
            email,
            phone,
            address,
            dob,
            category,
            course,
            year,
            enrollment_date,
            total_fee,
            plan.installments,
            plan.installment_amt,
            dates_json,
            fee_status,
            now_ts(),
            id,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    let row = load_student(conn, &id)?;
    Ok(json!({ "student": student_json(&row) }))
}

fn students_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let row = load_student(conn, &id)?;

    let (total_paid, payment_count): (f64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM payments WHERE student_id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(query_err)?;
    let last_payment: Option<String> = conn
        .query_row(
            "SELECT payment_date FROM payments WHERE student_id = ?
             ORDER BY payment_date DESC, created_at DESC LIMIT 1",
            [&id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;

    let (attended, present): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'Present' THEN 1 ELSE 0 END), 0)
             FROM attendance WHERE student_id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(query_err)?;

    let mut stmt = conn
        .prepare("SELECT percentage FROM performance WHERE student_id = ?")
        .map_err(query_err)?;
    let percentages: Vec<f64> = stmt
        .query_map([&id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let perf = ledger::aggregate_performance(&percentages);

    Ok(json!({
        "student": student_json(&row),
        "payments": {
            "totalPaid": total_paid,
            "count": payment_count,
            "lastPaymentDate": last_payment,
        },
        "attendance": {
            "totalClasses": attended,
            "presentClasses": present,
            "rate": ledger::attendance_rate(present, attended),
        },
        "performance": {
            "examsTaken": percentages.len(),
            "stats": perf,
        },
    }))
}

fn push_student_filters(
    params: &serde_json::Value,
    where_parts: &mut Vec<String>,
    binds: &mut Vec<Value>,
) -> Result<(), HandlerErr> {
    if let Some(category) = get_opt_str(params, "category")?.filter(|s| s != "All") {
        where_parts.push("category = ?".to_string());
        binds.push(Value::Text(category));
    }
    if let Some(course) = get_opt_str(params, "course")?.filter(|s| s != "All") {
        where_parts.push("course = ?".to_string());
        binds.push(Value::Text(course));
    }
    if let Some(year) = get_opt_i64(params, "year")? {
        where_parts.push("year = ?".to_string());
        binds.push(Value::Integer(year));
    }
    if let Some(status) = get_opt_str(params, "status")?.filter(|s| s != "All") {
        if ledger::FeeStatus::parse(&status).is_none() {
            return Err(HandlerErr::bad_params(
                "status must be Paid, Partial or Unpaid",
            ));
        }
        where_parts.push("fee_status = ?".to_string());
        binds.push(Value::Text(status));
    }
    if let Some(search) = get_opt_str(params, "search")?.filter(|s| !s.is_empty()) {
        where_parts.push(
            "(LOWER(name) LIKE '%' || ? || '%' OR LOWER(email) LIKE '%' || ? || '%')".to_string(),
        );
        let needle = search.to_lowercase();
        binds.push(Value::Text(needle.clone()));
        binds.push(Value::Text(needle));
    }
    Ok(())
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    push_student_filters(params, &mut where_parts, &mut binds)?;

    let mut sql = format!("SELECT {} FROM students", STUDENT_COLS);
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| row_to_student(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let students: Vec<serde_json::Value> = rows.iter().map(student_json).collect();
    let count = students.len();
    Ok(json!({ "students": students, "count": count }))
}

fn students_group(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    push_student_filters(params, &mut where_parts, &mut binds)?;

    let mut sql = format!("SELECT {} FROM students", STUDENT_COLS);
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY category, course, year, name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| row_to_student(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    // category -> course -> year -> students, emitted as ordered arrays.
    let mut categories: Vec<serde_json::Value> = Vec::new();
    let mut total = 0usize;
    for s in &rows {
        total += 1;
        let student = student_json(s);
        let need_category = categories
            .last()
            .map(|c| c["category"] != s.category.as_str())
            .unwrap_or(true);
        if need_category {
            categories.push(json!({ "category": s.category, "courses": [] }));
        }
        let courses = categories
            .last_mut()
            .and_then(|c| c["courses"].as_array_mut())
            .ok_or_else(|| HandlerErr::bad_params("grouping failed"))?;
        let need_course = courses
            .last()
            .map(|c| c["course"] != s.course.as_str())
            .unwrap_or(true);
        if need_course {
            courses.push(json!({ "course": s.course, "years": [] }));
        }
        let years = courses
            .last_mut()
            .and_then(|c| c["years"].as_array_mut())
            .ok_or_else(|| HandlerErr::bad_params("grouping failed"))?;
        let need_year = years.last().map(|y| y["year"] != s.year).unwrap_or(true);
        if need_year {
            years.push(json!({ "year": s.year, "students": [] }));
        }
        if let Some(list) = years.last_mut().and_then(|y| y["students"].as_array_mut()) {
            list.push(student);
        }
    }

    Ok(json!({ "groups": categories, "count": total }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    load_student(conn, &id)?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut deleted = serde_json::Map::new();
    for table in ["payments", "attendance", "performance"] {
        let sql = format!("DELETE FROM {} WHERE student_id = ?", table);
        let n = tx.execute(&sql, [&id]).map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        })?;
        deleted.insert(table.to_string(), json!(n));
    }
    tx.execute("DELETE FROM students WHERE id = ?", [&id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "deleted": deleted }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle(state, req, students_create)),
        "students.update" => Some(handle(state, req, students_update)),
        "students.get" => Some(handle(state, req, students_get)),
        "students.list" => Some(handle(state, req, students_list)),
        "students.group" => Some(handle(state, req, students_group)),
        "students.delete" => Some(handle(state, req, students_delete)),
        _ => None,
    }
}

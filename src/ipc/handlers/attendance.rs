use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
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

fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

// Month filters arrive as YYYY-MM; the return value is the normalized
// prefix used against the date column.
fn parse_month_key(month: &str) -> Result<String, HandlerErr> {
    let t = month.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(HandlerErr::bad_params("month must be YYYY-MM"));
    };
    let year = y
        .parse::<i32>()
        .map_err(|_| HandlerErr::bad_params("month year must be numeric"))?;
    let month_num = m
        .parse::<u32>()
        .map_err(|_| HandlerErr::bad_params("month must be YYYY-MM"))?;
    if !(1..=12).contains(&month_num) {
        return Err(HandlerErr::bad_params("month must be between 01 and 12"));
    }
    Ok(format!("{:04}-{:02}", year, month_num))
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(query_err)
}

fn parse_status(raw: &str) -> Result<ledger::AttendanceStatus, HandlerErr> {
    ledger::AttendanceStatus::parse(raw).ok_or_else(|| {
        let statuses: Vec<&str> = ledger::AttendanceStatus::ALL
            .iter()
            .map(|s| s.as_str())
            .collect();
        HandlerErr {
            code: "bad_params",
            message: format!("unknown attendance status: {}", raw),
            details: Some(json!({ "statuses": statuses })),
        }
    })
}

fn upsert_record(
    conn: &Connection,
    student_id: &str,
    date: &str,
    subject: &str,
    status: ledger::AttendanceStatus,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance(id, student_id, date, subject, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date, subject) DO UPDATE SET
           status = excluded.status",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_id,
            date,
            subject,
            status.as_str(),
            now_ts()
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;
    Ok(())
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_str(params, "date")?;
    let subject = get_required_str(params, "subject")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    ledger::parse_iso_date(&date)?;

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }
    upsert_record(conn, &student_id, &date, &subject, status)?;

    Ok(json!({
        "record": {
            "studentId": student_id,
            "date": date,
            "subject": subject,
            "status": status.as_str(),
        }
    }))
}

fn attendance_bulk_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_str(params, "date")?;
    let subject = get_required_str(params, "subject")?;
    ledger::parse_iso_date(&date)?;
    let Some(entries_json) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    if entries_json.is_empty() {
        return Err(HandlerErr::bad_params("entries must not be empty"));
    }

    // Every entry is validated before any row is written; one bad entry
    // rejects the whole batch.
    let mut entries: Vec<(String, ledger::AttendanceStatus)> = Vec::with_capacity(entries_json.len());
    for (idx, entry) in entries_json.iter().enumerate() {
        let student_id = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params(format!("entry {} missing studentId", idx)))?;
        let raw_status = entry
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("entry {} missing status", idx)))?;
        entries.push((student_id, parse_status(raw_status)?));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for (student_id, status) in &entries {
        let exists = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(query_err)?
            .is_some();
        if !exists {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        upsert_record(&tx, student_id, &date, &subject, *status)?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "date": date, "subject": subject, "marked": entries.len() }))
}

fn attendance_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let month_prefix = match get_opt_str(params, "month")?.filter(|s| !s.is_empty()) {
        Some(m) => Some(parse_month_key(&m)?),
        None => None,
    };
    let subject = get_opt_str(params, "subject")?.filter(|s| s != "All" && !s.is_empty());

    let mut join_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(prefix) = &month_prefix {
        join_parts.push("a.date LIKE ? || '-%'");
        binds.push(Value::Text(prefix.clone()));
    }
    if let Some(subject) = &subject {
        join_parts.push("a.subject = ?");
        binds.push(Value::Text(subject.clone()));
    }

    let mut sql = "SELECT s.id, s.name, s.category, s.course, s.year, COUNT(a.id), \
                   SUM(CASE WHEN a.status = 'Present' THEN 1 ELSE 0 END)
         FROM students s LEFT JOIN attendance a ON a.student_id = s.id"
        .to_string();
    for part in &join_parts {
        sql.push_str(" AND ");
        sql.push_str(part);
    }

    let mut where_parts: Vec<&str> = Vec::new();
    if let Some(category) = get_opt_str(params, "category")?.filter(|s| s != "All" && !s.is_empty())
    {
        where_parts.push("s.category = ?");
        binds.push(Value::Text(category));
    }
    if let Some(course) = get_opt_str(params, "course")?.filter(|s| s != "All" && !s.is_empty()) {
        where_parts.push("s.course = ?");
        binds.push(Value::Text(course));
    }
    if let Some(year) = get_opt_i64(params, "year")? {
        where_parts.push("s.year = ?");
        binds.push(Value::Integer(year));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" GROUP BY s.id ORDER BY s.name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, Option<i64>>(6)?.unwrap_or(0),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut last_stmt = conn
        .prepare(
            "SELECT date, status FROM attendance WHERE student_id = ?
             ORDER BY date DESC, created_at DESC LIMIT 1",
        )
        .map_err(query_err)?;

    let mut out = Vec::with_capacity(rows.len());
    let mut rate_sum: i64 = 0;
    let mut rated_students: i64 = 0;
    let mut record_count: i64 = 0;
    for (id, name, category, course, year, total, present) in rows {
        let rate = ledger::attendance_rate(present, total);
        if total > 0 {
            rate_sum += rate;
            rated_students += 1;
        }
        record_count += total;
        let last: Option<(String, String)> = last_stmt
            .query_row([&id], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()
            .map_err(query_err)?;
        let (last_date, last_status) = match last {
            Some((d, s)) => (json!(d), json!(s)),
            None => (serde_json::Value::Null, serde_json::Value::Null),
        };
        out.push(json!({
            "studentId": id,
            "name": name,
            "category": category,
            "course": course,
            "year": year,
            "totalClasses": total,
            "presentClasses": present,
            "rate": rate,
            "lastDate": last_date,
            "lastStatus": last_status,
        }));
    }

    let overall_rate = if rated_students > 0 {
        ledger::round_whole(rate_sum as f64 / rated_students as f64) as i64
    } else {
        0
    };

    let student_count = out.len();
    Ok(json!({
        "rows": out,
        "overallRate": overall_rate,
        "studentCount": student_count,
        "recordCount": record_count,
    }))
}

fn attendance_student_month(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let month_prefix = parse_month_key(&get_required_str(params, "month")?)?;

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT date, subject, status FROM attendance
             WHERE student_id = ? AND date LIKE ? || '-%'
             ORDER BY date, subject",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((&student_id, &month_prefix), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut present = 0i64;
    let mut absent = 0i64;
    let mut late = 0i64;
    let mut excused = 0i64;
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|(date, subject, status)| {
            match status.as_str() {
                "Present" => present += 1,
                "Absent" => absent += 1,
                "Late" => late += 1,
                _ => excused += 1,
            }
            json!({ "date": date, "subject": subject, "status": status })
        })
        .collect();

    let total = rows.len() as i64;
    Ok(json!({
        "studentId": student_id,
        "month": month_prefix,
        "records": records,
        "totals": {
            "classes": total,
            "present": present,
            "absent": absent,
            "late": late,
            "excused": excused,
        },
        "rate": ledger::attendance_rate(present, total),
    }))
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
        "attendance.mark" => Some(handle(state, req, attendance_mark)),
        "attendance.bulkMark" => Some(handle(state, req, attendance_bulk_mark)),
        "attendance.summary" => Some(handle(state, req, attendance_summary)),
        "attendance.studentMonth" => Some(handle(state, req, attendance_student_month)),
        _ => None,
    }
}

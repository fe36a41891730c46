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

fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
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

fn performance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let exam_name = get_required_str(params, "examName")?;
    let subject = get_required_str(params, "subject")?;
    let marks = get_required_f64(params, "marks")?;
    let total_marks = get_required_f64(params, "totalMarks")?;
    let exam_date = get_required_str(params, "examDate")?;
    ledger::parse_iso_date(&exam_date)?;

    if marks < 0.0 {
        return Err(HandlerErr::bad_params("marks must not be negative"));
    }
    if marks > total_marks {
        return Err(HandlerErr {
            code: "bad_params",
            message: "marks exceed total marks".to_string(),
            details: Some(json!({ "marks": marks, "totalMarks": total_marks })),
        });
    }
    let percentage = ledger::exam_percentage(marks, total_marks)?;

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(query_err)?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    // Re-recording the same exam replaces the earlier result.
    conn.execute(
        "INSERT INTO performance(id, student_id, exam_name, subject, marks, total_marks, percentage, exam_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, exam_name) DO UPDATE SET
           subject = excluded.subject,
           marks = excluded.marks,
           total_marks = excluded.total_marks,
           percentage = excluded.percentage,
           exam_date = excluded.exam_date",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_id,
            exam_name,
            subject,
            marks,
            total_marks,
            percentage,
            exam_date,
            now_ts()
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "performance" })),
    })?;

    Ok(json!({
        "record": {
            "studentId": student_id,
            "examName": exam_name,
            "subject": subject,
            "marks": marks,
            "totalMarks": total_marks,
            "percentage": percentage,
            "examDate": exam_date,
        }
    }))
}

fn performance_student_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(query_err)?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT exam_name, subject, marks, total_marks, percentage, exam_date
             FROM performance WHERE student_id = ?
             ORDER BY exam_date DESC, created_at DESC",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "examName": r.get::<_, String>(0)?,
                "subject": r.get::<_, String>(1)?,
                "marks": r.get::<_, f64>(2)?,
                "totalMarks": r.get::<_, f64>(3)?,
                "percentage": r.get::<_, f64>(4)?,
                "examDate": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let percentages: Vec<f64> = rows
        .iter()
        .filter_map(|r| r["percentage"].as_f64())
        .collect();
    let stats = ledger::aggregate_performance(&percentages);
    let latest_exam = rows
        .first()
        .and_then(|r| r["examName"].as_str())
        .map(|s| json!(s))
        .unwrap_or(serde_json::Value::Null);

    Ok(json!({
        "studentId": student_id,
        "records": rows,
        "stats": stats,
        "latestExam": latest_exam,
    }))
}

fn performance_overview(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = "SELECT s.id, s.name, s.category, s.course, s.year
         FROM students s"
        .to_string();
    let mut where_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
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
    sql.push_str(" ORDER BY s.name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let students = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut pct_stmt = conn
        .prepare("SELECT percentage FROM performance WHERE student_id = ?")
        .map_err(query_err)?;

    let mut out = Vec::with_capacity(students.len());
    let mut average_sum: i64 = 0;
    let mut examined_students: i64 = 0;
    let mut top: Option<(String, String, i64)> = None;
    for (id, name, category, course, year) in students {
        let percentages: Vec<f64> = pct_stmt
            .query_map([&id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        let stats = ledger::aggregate_performance(&percentages);
        if stats.exams_taken > 0 {
            average_sum += stats.average;
            examined_students += 1;
            let better = match &top {
                Some((_, _, best)) => stats.average > *best,
                None => true,
            };
            if better {
                top = Some((id.clone(), name.clone(), stats.average));
            }
        }
        out.push(json!({
            "studentId": id,
            "name": name,
            "category": category,
            "course": course,
            "year": year,
            "stats": stats,
        }));
    }

    let overall_average = if examined_students > 0 {
        ledger::round_whole(average_sum as f64 / examined_students as f64) as i64
    } else {
        0
    };
    let top_performer = match top {
        Some((id, name, average)) => json!({
            "studentId": id,
            "name": name,
            "average": average,
        }),
        None => serde_json::Value::Null,
    };

    Ok(json!({
        "rows": out,
        "overallAverage": overall_average,
        "topPerformer": top_performer,
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
        "performance.record" => Some(handle(state, req, performance_record)),
        "performance.studentSummary" => Some(handle(state, req, performance_student_summary)),
        "performance.overview" => Some(handle(state, req, performance_overview)),
        _ => None,
    }
}

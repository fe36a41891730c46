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

fn check_taxonomy(
    conn: &Connection,
    category: &str,
    course: &str,
    year: i64,
) -> Result<(), HandlerErr> {
    let rule: Option<(i64, i64)> = conn
        .query_row(
            "SELECT year_min, year_max FROM courses WHERE category = ? AND name = ?",
            (category, course),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((year_min, year_max)) = rule else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "unknown course for category".to_string(),
            details: Some(json!({ "category": category, "course": course })),
        });
    };
    if year < year_min || year > year_max {
        return Err(HandlerErr {
            code: "bad_params",
            message: "year out of range for course".to_string(),
            details: Some(json!({ "yearMin": year_min, "yearMax": year_max })),
        });
    }
    Ok(())
}

fn exam_json(
    id: &str,
    name: &str,
    exam_date: &str,
    category: &str,
    course: &str,
    year: i64,
    subject: &str,
    total_marks: f64,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "date": exam_date,
        "category": category,
        "course": course,
        "year": year,
        "subject": subject,
        "totalMarks": total_marks,
    })
}

fn exams_schedule(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let date = get_required_str(params, "date")?;
    let category = get_required_str(params, "category")?;
    let course = get_required_str(params, "course")?;
    let year =
        get_opt_i64(params, "year")?.ok_or_else(|| HandlerErr::bad_params("missing year"))?;
    let subject = get_required_str(params, "subject")?;
    let total_marks = params
        .get("totalMarks")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("missing totalMarks"))?;

    ledger::parse_iso_date(&date)?;
    if !(total_marks > 0.0) {
        return Err(HandlerErr::bad_params("totalMarks must be positive"));
    }
    check_taxonomy(conn, &category, &course, year)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, name, exam_date, category, course, year, subject, total_marks, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![id, name, date, category, course, year, subject, total_marks, now_ts()],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exams" })),
    })?;

    Ok(json!({
        "exam": exam_json(&id, &name, &date, &category, &course, year, &subject, total_marks)
    }))
}

fn exams_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = "SELECT id, name, exam_date, category, course, year, subject, total_marks
         FROM exams"
        .to_string();
    let mut where_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(category) = get_opt_str(params, "category")?.filter(|s| s != "All" && !s.is_empty())
    {
        where_parts.push("category = ?");
        binds.push(Value::Text(category));
    }
    if let Some(course) = get_opt_str(params, "course")?.filter(|s| s != "All" && !s.is_empty()) {
        where_parts.push("course = ?");
        binds.push(Value::Text(course));
    }
    if let Some(year) = get_opt_i64(params, "year")? {
        where_parts.push("year = ?");
        binds.push(Value::Integer(year));
    }
    if let Some(from) = get_opt_str(params, "from")?.filter(|s| !s.is_empty()) {
        ledger::parse_iso_date(&from)?;
        where_parts.push("exam_date >= ?");
        binds.push(Value::Text(from));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY exam_date, name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let exams = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(exam_json(
                &r.get::<_, String>(0)?,
                &r.get::<_, String>(1)?,
                &r.get::<_, String>(2)?,
                &r.get::<_, String>(3)?,
                &r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
                &r.get::<_, String>(6)?,
                r.get::<_, f64>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let count = exams.len();
    Ok(json!({ "exams": exams, "count": count }))
}

fn exams_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn
        .execute("DELETE FROM exams WHERE id = ?", [&id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "exams" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "deleted": id }))
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
        "exams.schedule" => Some(handle(state, req, exams_schedule)),
        "exams.list" => Some(handle(state, req, exams_list)),
        "exams.delete" => Some(handle(state, req, exams_delete)),
        _ => None,
    }
}

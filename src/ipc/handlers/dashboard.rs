use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use chrono::Datelike;
use rusqlite::Connection;
use serde_json::json;

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

fn month_attendance_rate(conn: &Connection, prefix: &str) -> Result<i64, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT COUNT(*), SUM(CASE WHEN status = 'Present' THEN 1 ELSE 0 END)
             FROM attendance WHERE date LIKE ? || '-%'
             GROUP BY student_id",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([prefix], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, Option<i64>>(1)?.unwrap_or(0)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    if rows.is_empty() {
        return Ok(0);
    }
    let sum: i64 = rows
        .iter()
        .map(|&(total, present)| ledger::attendance_rate(present, total))
        .sum();
    Ok(ledger::round_whole(sum as f64 / rows.len() as f64) as i64)
}

fn overall_performance_average(conn: &Connection) -> Result<i64, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT AVG(percentage) FROM performance GROUP BY student_id")
        .map_err(query_err)?;
    let averages = stmt
        .query_map([], |r| r.get::<_, f64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    if averages.is_empty() {
        return Ok(0);
    }
    let sum: f64 = averages.iter().map(|&a| ledger::round_whole(a)).sum();
    Ok(ledger::round_whole(sum / averages.len() as f64) as i64)
}

fn dashboard_stats(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let month_prefix = match get_opt_str(params, "month")?.filter(|s| !s.is_empty()) {
        Some(m) => parse_month_key(&m)?,
        None => chrono::Local::now().format("%Y-%m").to_string(),
    };

    let total_students: i64 = conn
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
        .map_err(query_err)?;

    let fee_collection: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE payment_date LIKE ? || '-%'",
            [&month_prefix],
            |r| r.get(0),
        )
        .map_err(query_err)?;

    let pending_fees: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(CASE WHEN total_fee > paid_fee THEN total_fee - paid_fee ELSE 0 END), 0)
             FROM students",
            [],
            |r| r.get(0),
        )
        .map_err(query_err)?;

    Ok(json!({
        "month": month_prefix,
        "totalStudents": total_students,
        "feeCollection": fee_collection,
        "pendingFees": pending_fees,
        "attendanceRate": month_attendance_rate(conn, &month_prefix)?,
        "averagePerformance": overall_performance_average(conn)?,
    }))
}

struct ReminderToggles {
    birthdays: bool,
    fees_due: bool,
    exams_today: bool,
}

fn reminder_toggles(conn: &Connection) -> ReminderToggles {
    let stored = db::settings_get_json(conn, "setup.reminders")
        .ok()
        .flatten()
        .unwrap_or(serde_json::Value::Null);
    let flag = |key: &str| stored.get(key).and_then(|v| v.as_bool()).unwrap_or(true);
    ReminderToggles {
        birthdays: flag("birthdays"),
        fees_due: flag("feesDue"),
        exams_today: flag("examsToday"),
    }
}

fn birthday_rows(conn: &Connection, month_day: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, dob, category, course FROM students
             WHERE length(dob) = 10 AND substr(dob, 6, 5) = ?
             ORDER BY name",
        )
        .map_err(query_err)?;
    stmt.query_map([month_day], |r| {
        Ok(json!({
            "studentId": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "dob": r.get::<_, String>(2)?,
            "category": r.get::<_, String>(3)?,
            "course": r.get::<_, String>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

// An installment is "due today" when its day-of-month matches, every month
// until the balance clears.
fn fees_due_rows(conn: &Connection, day: u32) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, total_fee, paid_fee, installment_dates FROM students
             WHERE total_fee > paid_fee
             ORDER BY name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut out = Vec::new();
    for (id, name, total_fee, paid_fee, dates_text) in rows {
        let dates: Vec<String> = serde_json::from_str(&dates_text).unwrap_or_default();
        let due_date = dates.iter().find(|d| {
            ledger::parse_iso_date(d)
                .map(|parsed| parsed.day() == day)
                .unwrap_or(false)
        });
        if let Some(due_date) = due_date {
            out.push(json!({
                "studentId": id,
                "name": name,
                "amountDue": total_fee - paid_fee,
                "dueDate": due_date,
            }));
        }
    }
    Ok(out)
}

fn exams_today_rows(conn: &Connection, date: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, subject, category, course, year FROM exams
             WHERE exam_date = ? ORDER BY name",
        )
        .map_err(query_err)?;
    stmt.query_map([date], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "subject": r.get::<_, String>(2)?,
            "category": r.get::<_, String>(3)?,
            "course": r.get::<_, String>(4)?,
            "year": r.get::<_, i64>(5)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

fn dashboard_reminders(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let today = match get_opt_str(params, "today")?.filter(|s| !s.is_empty()) {
        Some(s) => ledger::parse_iso_date(&s)?,
        None => chrono::Local::now().date_naive(),
    };
    let today_str = today.format(ledger::DATE_FMT).to_string();
    let month_day = today.format("%m-%d").to_string();
    let toggles = reminder_toggles(conn);

    let birthdays = if toggles.birthdays {
        birthday_rows(conn, &month_day)?
    } else {
        Vec::new()
    };
    let fees_due = if toggles.fees_due {
        fees_due_rows(conn, today.day())?
    } else {
        Vec::new()
    };
    let exams_today = if toggles.exams_today {
        exams_today_rows(conn, &today_str)?
    } else {
        Vec::new()
    };

    Ok(json!({
        "today": today_str,
        "birthdays": birthdays,
        "feesDue": fees_due,
        "examsToday": exams_today,
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
        "dashboard.stats" => Some(handle(state, req, dashboard_stats)),
        "dashboard.reminders" => Some(handle(state, req, dashboard_reminders)),
        _ => None,
    }
}

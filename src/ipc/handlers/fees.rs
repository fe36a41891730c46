use crate::db;
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

fn accepted_methods(conn: &Connection) -> Vec<String> {
    let stored = db::settings_get_json(conn, "setup.payment")
        .ok()
        .flatten()
        .and_then(|v| v.get("acceptedMethods").cloned());
    match stored.and_then(|v| {
        v.as_array().map(|arr| {
            arr.iter()
                .filter_map(|m| m.as_str().map(|s| s.to_string()))
                .collect::<Vec<_>>()
        })
    }) {
        Some(list) if !list.is_empty() => list,
        _ => ledger::PaymentMethod::ALL
            .iter()
            .map(|m| m.as_str().to_string())
            .collect(),
    }
}

fn fees_plan(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _ = conn;
    let total_fee = get_required_f64(params, "totalFee")?;
    let installments = params
        .get("installments")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing installments"))?;
    let dates: Option<Vec<String>> = match params.get("dates") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| HandlerErr::bad_params("dates must be an array"))?;
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                let s = item
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("dates must be an array of dates"))?;
                out.push(s.trim().to_string());
            }
            Some(out)
        }
    };
    let start = match get_opt_str(params, "startDate")? {
        Some(s) => ledger::parse_iso_date(&s)?,
        None => chrono::Local::now().date_naive(),
    };
    let plan = ledger::derive_installment_plan(total_fee, installments, dates.as_deref(), start)?;
    Ok(json!({ "plan": plan }))
}

struct FeeState {
    total_fee: f64,
    paid_fee: f64,
}

fn fees_record_payment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let amount = get_required_f64(params, "amount")?;
    let method = get_required_str(params, "method")?;
    let date = get_required_str(params, "date")?;
    let description = get_opt_str(params, "description")?.unwrap_or_default();

    if ledger::PaymentMethod::parse(&method).is_none() {
        let methods: Vec<&str> = ledger::PaymentMethod::ALL.iter().map(|m| m.as_str()).collect();
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown payment method: {}", method),
            details: Some(json!({ "methods": methods })),
        });
    }
    let accepted = accepted_methods(conn);
    if !accepted.iter().any(|m| m == &method) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("payment method not accepted: {}", method),
            details: Some(json!({ "accepted": accepted })),
        });
    }
    ledger::parse_iso_date(&date)?;

    // The balance read, the ledger append and the cached-total rewrite commit
    // or roll back together.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let state = tx
        .query_row(
            "SELECT total_fee, paid_fee FROM students WHERE id = ?",
            [&student_id],
            |r| {
                Ok(FeeState {
                    total_fee: r.get(0)?,
                    paid_fee: r.get(1)?,
                })
            },
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        })?;

    let (new_paid, status) = ledger::apply_payment(state.total_fee, state.paid_fee, amount)?;

    let payment_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    tx.execute(
        "INSERT INTO payments(id, student_id, amount, payment_date, method, description, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![payment_id, student_id, amount, date, method, description, ts],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "payments" })),
    })?;

    tx.execute(
        "UPDATE students SET paid_fee = ?, fee_status = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![new_paid, status.as_str(), ts, student_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "payment": {
            "id": payment_id,
            "studentId": student_id,
            "amount": amount,
            "paymentDate": date,
            "method": method,
            "description": description,
        },
        "summary": ledger::fee_summary_row(state.total_fee, new_paid),
    }))
}

fn fees_payments(
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
            "SELECT id, amount, payment_date, method, description
             FROM payments WHERE student_id = ?
             ORDER BY payment_date DESC, created_at DESC",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "amount": r.get::<_, f64>(1)?,
                "paymentDate": r.get::<_, String>(2)?,
                "method": r.get::<_, String>(3)?,
                "description": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let total_paid: f64 = rows
        .iter()
        .filter_map(|p| p["amount"].as_f64())
        .sum();
    let count = rows.len();

    Ok(json!({
        "payments": rows,
        "totalPaid": total_paid,
        "count": count,
    }))
}

fn fees_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(category) = get_opt_str(params, "category")?.filter(|s| s != "All" && !s.is_empty())
    {
        where_parts.push("category = ?".to_string());
        binds.push(Value::Text(category));
    }
    if let Some(course) = get_opt_str(params, "course")?.filter(|s| s != "All" && !s.is_empty()) {
        where_parts.push("course = ?".to_string());
        binds.push(Value::Text(course));
    }
    if let Some(year) = get_opt_i64(params, "year")? {
        where_parts.push("year = ?".to_string());
        binds.push(Value::Integer(year));
    }
    if let Some(status) = get_opt_str(params, "status")?.filter(|s| s != "All" && !s.is_empty()) {
        if ledger::FeeStatus::parse(&status).is_none() {
            return Err(HandlerErr::bad_params(
                "status must be Paid, Partial or Unpaid",
            ));
        }
        where_parts.push("fee_status = ?".to_string());
        binds.push(Value::Text(status));
    }
    if let Some(search) = get_opt_str(params, "search")?.filter(|s| !s.is_empty()) {
        where_parts.push("LOWER(name) LIKE '%' || ? || '%'".to_string());
        binds.push(Value::Text(search.to_lowercase()));
    }

    let mut sql = "SELECT id, name, category, course, year, total_fee, paid_fee, installments, \
                   installment_amt, installment_dates FROM students"
        .to_string();
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let total_fee: f64 = r.get(5)?;
            let paid_fee: f64 = r.get(6)?;
            let dates_text: String = r.get(9)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                total_fee,
                paid_fee,
                r.get::<_, i64>(7)?,
                r.get::<_, f64>(8)?,
                dates_text,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut out = Vec::with_capacity(rows.len());
    let mut total_fees = 0.0f64;
    let mut total_collected = 0.0f64;
    for (id, name, category, course, year, total_fee, paid_fee, installments, installment_amt, dates_text) in
        rows
    {
        total_fees += total_fee;
        total_collected += paid_fee;
        let summary = ledger::fee_summary_row(total_fee, paid_fee);
        let dates: Vec<String> = serde_json::from_str(&dates_text).unwrap_or_default();
        out.push(json!({
            "studentId": id,
            "name": name,
            "category": category,
            "course": course,
            "year": year,
            "installments": installments,
            "installmentAmt": installment_amt,
            "installmentDates": dates,
            "summary": summary,
        }));
    }

    let total_pending = (total_fees - total_collected).max(0.0);
    let collection_rate = if total_fees > 0.0 {
        ledger::round_whole(100.0 * total_collected / total_fees) as i64
    } else {
        0
    };

    Ok(json!({
        "rows": out,
        "totals": {
            "totalFees": total_fees,
            "totalCollected": total_collected,
            "totalPending": total_pending,
            "collectionRate": collection_rate,
        },
    }))
}

fn fees_check_ledger(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_opt_str(params, "studentId")?.filter(|s| !s.is_empty());

    let mut sql = "SELECT s.id, s.name, s.paid_fee, COALESCE(SUM(p.amount), 0)
         FROM students s LEFT JOIN payments p ON p.student_id = s.id"
        .to_string();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(id) = &student_id {
        sql.push_str(" WHERE s.id = ?");
        binds.push(Value::Text(id.clone()));
    }
    sql.push_str(" GROUP BY s.id ORDER BY s.name");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    if student_id.is_some() && rows.is_empty() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let checked = rows.len();
    let mut mismatches = Vec::new();
    for (id, name, paid_fee, ledger_sum) in rows {
        if (paid_fee - ledger_sum).abs() > 1e-6 {
            mismatches.push(json!({
                "studentId": id,
                "name": name,
                "paidFee": paid_fee,
                "ledgerSum": ledger_sum,
                "difference": paid_fee - ledger_sum,
            }));
        }
    }

    Ok(json!({
        "checked": checked,
        "consistent": mismatches.is_empty(),
        "mismatches": mismatches,
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
        "fees.plan" => Some(handle(state, req, fees_plan)),
        "fees.recordPayment" => Some(handle(state, req, fees_record_payment)),
        "fees.payments" => Some(handle(state, req, fees_payments)),
        "fees.summary" => Some(handle(state, req, fees_summary)),
        "fees.checkLedger" => Some(handle(state, req, fees_check_ledger)),
        _ => None,
    }
}

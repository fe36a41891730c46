use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use rusqlite::types::Value;
use rusqlite::params_from_iter;
use serde_json::json;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn parse_month_key(month: &str) -> Option<String> {
    let t = month.trim();
    let (y, m) = t.split_once('-')?;
    let year = y.parse::<i32>().ok()?;
    let month_num = m.parse::<u32>().ok()?;
    if !(1..=12).contains(&month_num) {
        return None;
    }
    Some(format!("{:04}-{:02}", year, month_num))
}

fn write_csv(out_path: &str, csv: String) -> Result<(), (String, serde_json::Value)> {
    let out = PathBuf::from(out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return Err((e.to_string(), json!({ "path": out_path })));
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return Err((e.to_string(), json!({ "path": out_path })));
    }
    Ok(())
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }
    if let Err(e) = std::fs::create_dir_all(&workspace_path) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

fn handle_exchange_export_students_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let opt_filter = |key: &str| {
        req.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| s != "All" && !s.is_empty())
    };
    let mut where_parts: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(category) = opt_filter("category") {
        where_parts.push("category = ?");
        binds.push(Value::Text(category));
    }
    if let Some(course) = opt_filter("course") {
        where_parts.push("course = ?");
        binds.push(Value::Text(course));
    }
    if let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) {
        where_parts.push("year = ?");
        binds.push(Value::Integer(year));
    }
    if let Some(status) = opt_filter("status") {
        if ledger::FeeStatus::parse(&status).is_none() {
            return err(
                &req.id,
                "bad_params",
                "status must be Paid, Partial or Unpaid",
                None,
            );
        }
        where_parts.push("fee_status = ?");
        binds.push(Value::Text(status));
    }

    let mut sql = "SELECT name, email, phone, category, course, year, enrollment_date,
                total_fee, paid_fee FROM students"
        .to_string();
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, f64>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut csv = String::from(
        "Name,Email,Phone,Category,Course,Year,Enrollment Date,Total Fee,Paid Fee,Due Amount,Fee Status\n",
    );
    let rows_exported = rows.len();
    for (name, email, phone, category, course, year, enrollment_date, total_fee, paid_fee) in rows {
        let summary = ledger::fee_summary_row(total_fee, paid_fee);
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&name),
            csv_quote(&email),
            csv_quote(&phone),
            csv_quote(&category),
            csv_quote(&course),
            year,
            csv_quote(&enrollment_date),
            total_fee,
            paid_fee,
            summary.amount_due,
            summary.status
        ));
    }

    if let Err((msg, details)) = write_csv(&out_path, csv) {
        return err(&req.id, "io_failed", msg, Some(details));
    }
    ok(
        &req.id,
        json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }),
    )
}

fn handle_exchange_export_attendance_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let month_prefix = match req
        .params
        .get("month")
        .and_then(|v| v.as_str())
        .and_then(parse_month_key)
    {
        Some(m) => m,
        None => return err(&req.id, "bad_params", "month must be YYYY-MM", None),
    };
    let subject = req
        .params
        .get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| s != "All" && !s.is_empty());

    let mut sql = "SELECT s.name, a.date, a.subject, a.status
         FROM attendance a JOIN students s ON s.id = a.student_id
         WHERE a.date LIKE ? || '-%'"
        .to_string();
    let mut binds: Vec<Value> = vec![Value::Text(month_prefix)];
    if let Some(subject) = subject {
        sql.push_str(" AND a.subject = ?");
        binds.push(Value::Text(subject));
    }
    sql.push_str(" ORDER BY a.date, s.name, a.subject");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut csv = String::from("Student,Date,Subject,Status\n");
    let rows_exported = rows.len();
    for (name, date, subject, status) in rows {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            csv_quote(&name),
            csv_quote(&date),
            csv_quote(&subject),
            csv_quote(&status)
        ));
    }

    if let Err((msg, details)) = write_csv(&out_path, csv) {
        return err(&req.id, "io_failed", msg, Some(details));
    }
    ok(
        &req.id,
        json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        "exchange.exportStudentsCsv" => Some(handle_exchange_export_students_csv(state, req)),
        "exchange.exportAttendanceCsv" => Some(handle_exchange_export_attendance_csv(state, req)),
        _ => None,
    }
}

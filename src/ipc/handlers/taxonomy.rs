use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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

fn get_opt_subjects(params: &serde_json::Value) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get("subjects") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| HandlerErr::bad_params("subjects must be an array"))?;
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                let s = item
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("subjects must be an array of strings"))?;
                out.push(s.trim().to_string());
            }
            Ok(Some(out))
        }
    }
}

struct CourseRow {
    id: String,
    category: String,
    name: String,
    subjects: String,
    duration: String,
    fee: f64,
    year_min: i64,
    year_max: i64,
}

fn course_json(row: &CourseRow) -> serde_json::Value {
    let subjects: Vec<String> = serde_json::from_str(&row.subjects).unwrap_or_default();
    json!({
        "id": row.id,
        "category": row.category,
        "name": row.name,
        "subjects": subjects,
        "duration": row.duration,
        "fee": row.fee,
        "yearMin": row.year_min,
        "yearMax": row.year_max,
    })
}

// Known categories keep the enrolment-form order; anything custom sorts
// after them alphabetically.
fn category_rank(name: &str) -> (usize, &str) {
    match db::CATEGORIES.iter().position(|c| *c == name) {
        Some(idx) => (idx, ""),
        None => (db::CATEGORIES.len(), name),
    }
}

fn taxonomy_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, category, name, subjects, duration, fee, year_min, year_max
             FROM courses ORDER BY name",
        )
        .map_err(query_err)?;
    let mut courses = stmt
        .query_map([], |r| {
            Ok(CourseRow {
                id: r.get(0)?,
                category: r.get(1)?,
                name: r.get(2)?,
                subjects: r.get(3)?,
                duration: r.get(4)?,
                fee: r.get(5)?,
                year_min: r.get(6)?,
                year_max: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    courses.sort_by(|a, b| {
        category_rank(&a.category)
            .cmp(&category_rank(&b.category))
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut categories: Vec<serde_json::Value> = Vec::new();
    for row in &courses {
        let needs_new = match categories.last() {
            Some(c) => c["name"] != row.category.as_str(),
            None => true,
        };
        if needs_new {
            categories.push(json!({ "name": row.category, "courses": [] }));
        }
        if let Some(list) = categories
            .last_mut()
            .and_then(|c| c["courses"].as_array_mut())
        {
            list.push(course_json(row));
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, course, timing, days, teacher
             FROM batches ORDER BY name",
        )
        .map_err(query_err)?;
    let batches = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "course": r.get::<_, String>(2)?,
                "timing": r.get::<_, String>(3)?,
                "days": r.get::<_, String>(4)?,
                "teacher": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    Ok(json!({ "categories": categories, "batches": batches }))
}

fn load_course(conn: &Connection, id: &str) -> Result<Option<CourseRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, category, name, subjects, duration, fee, year_min, year_max
         FROM courses WHERE id = ?",
        [id],
        |r| {
            Ok(CourseRow {
                id: r.get(0)?,
                category: r.get(1)?,
                name: r.get(2)?,
                subjects: r.get(3)?,
                duration: r.get(4)?,
                fee: r.get(5)?,
                year_min: r.get(6)?,
                year_max: r.get(7)?,
            })
        },
    )
    .optional()
    .map_err(query_err)
}

fn taxonomy_save_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_opt_str(params, "id")?.filter(|s| !s.is_empty());
    let category = get_required_str(params, "category")?;
    let name = get_required_str(params, "name")?;
    let subjects = get_opt_subjects(params)?;
    let duration = get_opt_str(params, "duration")?;
    let fee = get_opt_f64(params, "fee")?;
    let year_min = get_opt_i64(params, "yearMin")?;
    let year_max = get_opt_i64(params, "yearMax")?;

    if let Some(fee) = fee {
        if !(fee >= 0.0) {
            return Err(HandlerErr::bad_params("fee must not be negative"));
        }
    }

    let existing = match &id {
        Some(id) => Some(load_course(conn, id)?.ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        })?),
        None => None,
    };

    let subjects_json = match (subjects, &existing) {
        (Some(list), _) => serde_json::to_string(&list)
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?,
        (None, Some(row)) => row.subjects.clone(),
        (None, None) => "[]".to_string(),
    };
    let duration = duration.unwrap_or_else(|| {
        existing
            .as_ref()
            .map(|r| r.duration.clone())
            .unwrap_or_default()
    });
    let fee = fee.unwrap_or_else(|| existing.as_ref().map(|r| r.fee).unwrap_or(0.0));
    let year_min = year_min.unwrap_or_else(|| existing.as_ref().map(|r| r.year_min).unwrap_or(1));
    let year_max = year_max.unwrap_or_else(|| existing.as_ref().map(|r| r.year_max).unwrap_or(year_min));
    if year_min < 1 || year_max < year_min {
        return Err(HandlerErr {
            code: "bad_params",
            message: "year range must satisfy 1 <= yearMin <= yearMax".to_string(),
            details: Some(json!({ "yearMin": year_min, "yearMax": year_max })),
        });
    }

    let course_id = match existing {
        Some(row) => {
            conn.execute(
                "UPDATE courses SET category = ?, name = ?, subjects = ?, duration = ?, fee = ?,
                        year_min = ?, year_max = ?
                 WHERE id = ?",
                rusqlite::params![category, name, subjects_json, duration, fee, year_min, year_max, row.id],
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "courses" })),
            })?;
            row.id
        }
        None => {
            let new_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO courses(id, category, name, subjects, duration, fee, year_min, year_max)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(category, name) DO UPDATE SET
                   subjects = excluded.subjects,
                   duration = excluded.duration,
                   fee = excluded.fee,
                   year_min = excluded.year_min,
                   year_max = excluded.year_max",
                rusqlite::params![new_id, category, name, subjects_json, duration, fee, year_min, year_max],
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "courses" })),
            })?;
            // The upsert may have landed on a pre-existing row.
            conn.query_row(
                "SELECT id FROM courses WHERE category = ? AND name = ?",
                (&category, &name),
                |r| r.get::<_, String>(0),
            )
            .map_err(query_err)?
        }
    };

    let saved = load_course(conn, &course_id)?.ok_or_else(|| HandlerErr {
        code: "db_query_failed",
        message: "saved course disappeared".to_string(),
        details: None,
    })?;
    Ok(json!({ "course": course_json(&saved) }))
}

fn taxonomy_delete_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let Some(course) = load_course(conn, &id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    };

    let enrolled: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE category = ? AND course = ?",
            (&course.category, &course.name),
            |r| r.get(0),
        )
        .map_err(query_err)?;
    if enrolled > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "course still has enrolled students".to_string(),
            details: Some(json!({ "students": enrolled })),
        });
    }

    conn.execute("DELETE FROM courses WHERE id = ?", [&id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "courses" })),
        })?;
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
        "taxonomy.list" => Some(handle(state, req, taxonomy_list)),
        "taxonomy.saveCourse" => Some(handle(state, req, taxonomy_save_course)),
        "taxonomy.deleteCourse" => Some(handle(state, req, taxonomy_delete_course)),
        _ => None,
    }
}

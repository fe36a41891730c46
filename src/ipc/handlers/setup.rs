use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Profile,
    Institute,
    Payment,
    Reminders,
}

impl SetupSection {
    const ALL: [SetupSection; 4] = [
        Self::Profile,
        Self::Institute,
        Self::Payment,
        Self::Reminders,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "profile" => Some(Self::Profile),
            "institute" => Some(Self::Institute),
            "payment" => Some(Self::Payment),
            "reminders" => Some(Self::Reminders),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Institute => "institute",
            Self::Payment => "payment",
            Self::Reminders => "reminders",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Profile => "setup.profile",
            Self::Institute => "setup.institute",
            Self::Payment => "setup.payment",
            Self::Reminders => "setup.reminders",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Profile => json!({
            "name": "",
            "email": "",
            "phone": ""
        }),
        SetupSection::Institute => json!({
            "name": "",
            "address": "",
            "phone": "",
            "email": ""
        }),
        SetupSection::Payment => json!({
            "currency": "INR",
            "acceptedMethods": ["cash", "card", "upi", "netbanking", "cheque"],
            "receiptFooter": ""
        }),
        SetupSection::Reminders => json!({
            "birthdays": true,
            "feesDue": true,
            "examsToday": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_accepted_methods(v: &Value) -> Result<Value, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| "acceptedMethods must be an array".to_string())?;
    if arr.is_empty() {
        return Err("acceptedMethods must not be empty".to_string());
    }
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| "acceptedMethods must be an array of strings".to_string())?;
        if ledger::PaymentMethod::parse(s).is_none() {
            return Err(format!("unknown payment method: {}", s));
        }
        if !out.iter().any(|m| m == s) {
            out.push(s.to_string());
        }
    }
    Ok(json!(out))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Profile => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "email" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "phone" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                _ => return Err(format!("unknown profile field: {}", k)),
            },
            SetupSection::Institute => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 160)?));
                }
                "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 400)?));
                }
                "phone" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                "email" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                _ => return Err(format!("unknown institute field: {}", k)),
            },
            SetupSection::Payment => match k.as_str() {
                "currency" => {
                    let s = parse_string_max(v, k, 8)?;
                    if s.is_empty() {
                        return Err("currency must not be empty".to_string());
                    }
                    obj.insert(k.clone(), Value::String(s.to_ascii_uppercase()));
                }
                "acceptedMethods" => {
                    obj.insert(k.clone(), parse_accepted_methods(v)?);
                }
                "receiptFooter" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 400)?));
                }
                _ => return Err(format!("unknown payment field: {}", k)),
            },
            SetupSection::Reminders => match k.as_str() {
                "birthdays" | "feesDue" | "examsToday" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reminders field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) {
        let Some(section) = SetupSection::parse(section_raw) else {
            return err(&req.id, "bad_params", "unknown section", None);
        };
        return match load_section(conn, section) {
            Ok(v) => ok(&req.id, json!({ section.name(): v })),
            Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
        };
    }

    let mut all = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                all.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(all))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ section.name(): current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

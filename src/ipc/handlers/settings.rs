use crate::calendar::{TermCalendar, WeekStart};
use crate::db;
use crate::ipc::helpers::{get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

pub const TERM_START_MONTHS: &str = "calendar.termStartMonths";
pub const WEEK_START: &str = "calendar.weekStart";

const KNOWN_KEYS: [&str; 2] = [TERM_START_MONTHS, WEEK_START];

fn settings_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

fn parse_term_months(v: &Value) -> Result<Vec<u32>, HandlerErr> {
    let arr = v
        .as_array()
        .ok_or_else(|| HandlerErr::bad_params("termStartMonths must be an array"))?;
    arr.iter()
        .map(|m| {
            m.as_u64()
                .and_then(|m| u32::try_from(m).ok())
                .ok_or_else(|| HandlerErr::bad_params("term start months must be integers"))
        })
        .collect()
}

fn parse_week_start(v: &Value) -> Result<WeekStart, HandlerErr> {
    serde_json::from_value(v.clone())
        .map_err(|_| HandlerErr::bad_params("weekStart must be \"monday\" or \"sunday\""))
}

/// Term layout for quick ranges; falls back to calendar quarters.
pub fn load_term_calendar(conn: &Connection) -> Result<TermCalendar, HandlerErr> {
    let months = match db::settings_get_json(conn, TERM_START_MONTHS).map_err(settings_err)? {
        Some(v) => parse_term_months(&v)?,
        None => TermCalendar::default().start_months().to_vec(),
    };
    let week_start = match db::settings_get_json(conn, WEEK_START).map_err(settings_err)? {
        Some(v) => parse_week_start(&v)?,
        None => WeekStart::default(),
    };
    TermCalendar::new(months, week_start).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

fn default_value(key: &str) -> Value {
    let cal = TermCalendar::default();
    match key {
        TERM_START_MONTHS => json!(cal.start_months()),
        WEEK_START => json!(cal.week_start()),
        _ => Value::Null,
    }
}

fn settings_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "key")?;
    if !KNOWN_KEYS.contains(&key.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown setting: {}", key)));
    }
    let stored = db::settings_get_json(conn, &key).map_err(settings_err)?;
    let is_default = stored.is_none();
    Ok(json!({
        "key": key,
        "value": stored.unwrap_or_else(|| default_value(&key)),
        "isDefault": is_default
    }))
}

fn settings_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "key")?;
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing value"))?;
    match key.as_str() {
        TERM_START_MONTHS => {
            TermCalendar::new(parse_term_months(&value)?, WeekStart::default())
                .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        }
        WEEK_START => {
            parse_week_start(&value)?;
        }
        _ => return Err(HandlerErr::bad_params(format!("unknown setting: {}", key))),
    }
    db::settings_set_json(conn, &key, &value)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
    tracing::info!(key = %key, "setting updated");
    Ok(json!({ "key": key, "value": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "settings.get" => Some(with_db(state, req, settings_get)),
        "settings.set" => Some(with_db(state, req, settings_set)),
        _ => None,
    }
}

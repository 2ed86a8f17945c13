use crate::calendar::{self, QuickRange};
use crate::db;
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::settings::load_term_calendar;
use crate::ipc::helpers::{get_opt_date, get_opt_f64, get_required_str, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    if !state.views.is_empty() {
        tracing::debug!(count = state.views.len(), "dropping views from previous workspace");
        state.views.clear();
    }
    tracing::info!(workspace = %path.display(), "workspace opened");
    Ok(())
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "openViews": state.views.len()
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => {
            tracing::warn!(workspace = %path.display(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

fn quick_range(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let raw = get_required_str(params, "range")?;
    let range = QuickRange::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown range: {}", raw)))?;
    let today = get_opt_date(params, "today")?.unwrap_or_else(calendar::today);
    // Without a workspace the default quarter layout applies.
    let terms = match state.db.as_ref() {
        Some(conn) => load_term_calendar(conn)?,
        None => calendar::TermCalendar::default(),
    };
    let r = calendar::quick_range(range, today, &terms)
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    Ok(json!({
        "range": range,
        "today": today,
        "startDate": r.start_date,
        "endDate": r.end_date,
        "days": r.len_days()
    }))
}

fn handle_calendar_quick_range(state: &mut AppState, req: &Request) -> serde_json::Value {
    match quick_range(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_grading_badge(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let score = match get_opt_f64(&req.params, "score") {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    match to_json(&grading::badge_view(score)) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "calendar.quickRange" => Some(handle_calendar_quick_range(state, req)),
        "grading.badge" => Some(handle_grading_badge(state, req)),
        _ => None,
    }
}

//! Hosted filter chains.
//!
//! A view owns one [`FilterChain`] preset and runs the chain's fetch commands
//! in-process through the REST route table, so a thin client only forwards
//! selector changes and renders snapshots.

use crate::calendar::{self, QuickRange};
use crate::cascade::{CascadeError, Command, FilterChain, FilterField, OptionItem, Resolution};
use crate::ipc::error::{into_result, ok};
use crate::ipc::handlers::settings::load_term_calendar;
use crate::ipc::helpers::{get_opt_date, get_opt_id, get_required_str, to_json, HandlerErr};
use crate::ipc::rest;
use crate::ipc::types::{AppState, Request};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewKind {
    Gradebook,
    Exams,
    Homework,
    Attendance,
    StudentGrades,
}

impl ViewKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gradebook" => Some(ViewKind::Gradebook),
            "exams" => Some(ViewKind::Exams),
            "homework" => Some(ViewKind::Homework),
            "attendance" => Some(ViewKind::Attendance),
            "studentGrades" => Some(ViewKind::StudentGrades),
            _ => None,
        }
    }

    fn fields(self) -> &'static [FilterField] {
        use FilterField::*;
        match self {
            ViewKind::Gradebook | ViewKind::Exams | ViewKind::Homework => {
                &[Branch, AcademicYear, Class, Subject]
            }
            ViewKind::Attendance => &[Branch, AcademicYear, Class],
            ViewKind::StudentGrades => &[Branch, AcademicYear, Class, Student],
        }
    }

    fn dataset_path(self) -> &'static str {
        match self {
            ViewKind::Gradebook => "/api/grades/statistics",
            ViewKind::Exams => "/api/exams",
            ViewKind::Homework => "/api/homework",
            ViewKind::Attendance => "/api/attendance",
            ViewKind::StudentGrades => "/api/grades/student",
        }
    }

    fn required_params(self) -> &'static [&'static str] {
        match self {
            ViewKind::Attendance => &["startDate", "endDate"],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct View {
    pub kind: ViewKind,
    pub chain: FilterChain,
    /// Every URL this view fetched, in issue order.
    pub fetch_log: Vec<String>,
}

impl View {
    fn open(kind: ViewKind) -> Result<(Self, Vec<Command>), HandlerErr> {
        let (mut chain, commands) = FilterChain::new(kind.fields(), kind.dataset_path())
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        for key in kind.required_params() {
            chain.require_param(*key);
        }
        Ok((
            Self {
                kind,
                chain,
                fetch_log: Vec::new(),
            },
            commands,
        ))
    }

    fn snapshot(&self, view_id: &str) -> Result<Value, HandlerErr> {
        let mut v = to_json(&self.chain.snapshot())?;
        v["viewId"] = json!(view_id);
        v["kind"] = to_json(&self.kind)?;
        v["fetchLog"] = json!(self.fetch_log);
        Ok(v)
    }
}

fn option_items(result: Value) -> Result<Vec<OptionItem>, String> {
    let items = result
        .get("items")
        .cloned()
        .ok_or_else(|| "response has no items".to_string())?;
    serde_json::from_value(items).map_err(|e| format!("malformed option list: {}", e))
}

/// Runs commands against the route table and feeds the responses back into the chain.
fn execute(state: &mut AppState, view_id: &str, view: &mut View, commands: Vec<Command>) {
    for cmd in commands {
        let request = cmd.request();
        let url = request.url();
        view.fetch_log.push(url.clone());
        let call_id = format!("{}#{}", view_id, cmd.generation());
        let result = into_result(rest::dispatch(state, &call_id, request));
        if let Err(message) = &result {
            tracing::warn!(view = %view_id, url = %url, error = %message, "fetch failed");
        }

        let resolution = match &cmd {
            Command::FetchOptions {
                field, generation, ..
            } => view
                .chain
                .resolve_options(*field, *generation, result.and_then(option_items))
                .unwrap_or(Resolution::Stale),
            Command::FetchDataset { generation, .. } => {
                view.chain.resolve_dataset(*generation, result)
            }
        };
        if resolution == Resolution::Stale {
            tracing::debug!(view = %view_id, url = %url, "stale response dropped");
        }
    }
}

fn required_view_id(params: &Value) -> Result<String, HandlerErr> {
    get_required_str(params, "viewId")
}

/// Takes the view out of the map, applies `f`, runs the resulting commands and puts it back.
fn with_view(
    state: &mut AppState,
    params: &Value,
    f: impl FnOnce(&AppState, &mut View) -> Result<Vec<Command>, HandlerErr>,
) -> Result<Value, HandlerErr> {
    let view_id = required_view_id(params)?;
    let mut view = state
        .views
        .remove(&view_id)
        .ok_or_else(|| HandlerErr::not_found(format!("view not found: {}", view_id)))?;
    let outcome = f(state, &mut view).map(|commands| execute(state, &view_id, &mut view, commands));
    let snapshot = view.snapshot(&view_id);
    state.views.insert(view_id, view);
    outcome?;
    snapshot
}

fn views_open(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    if state.db.is_none() {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    }
    let raw = get_required_str(params, "kind")?;
    let kind = ViewKind::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown view kind: {}", raw)))?;
    let (mut view, mut commands) = View::open(kind)?;

    if let Some(preset) = params.get("params").and_then(|v| v.as_object()) {
        let changes = preset
            .iter()
            .map(|(k, v)| (k.clone(), value_string(v)))
            .collect::<Vec<_>>();
        commands.extend(view.chain.set_params(&changes).map_err(cascade_err)?);
    }

    let view_id = uuid::Uuid::new_v4().to_string();
    execute(state, &view_id, &mut view, commands);
    let snapshot = view.snapshot(&view_id)?;
    tracing::debug!(view = %view_id, kind = ?kind, "view opened");
    state.views.insert(view_id, view);
    Ok(snapshot)
}

fn cascade_err(e: CascadeError) -> HandlerErr {
    HandlerErr::bad_params(e.to_string())
}

fn value_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn views_select(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let raw = get_required_str(params, "field")?;
    let field = FilterField::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown field: {}", raw)))?;
    let value = get_opt_id(params, "value")?;
    with_view(state, params, |_, view| {
        view.chain.select(field, value).map_err(cascade_err)
    })
}

fn views_set_param(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let key = get_required_str(params, "key")?;
    let value = params.get("value").and_then(value_string);
    with_view(state, params, |_, view| {
        view.chain.set_param(&key, value).map_err(cascade_err)
    })
}

fn views_quick_range(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let raw = get_required_str(params, "range")?;
    let range = QuickRange::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown range: {}", raw)))?;
    let today = get_opt_date(params, "today")?.unwrap_or_else(calendar::today);
    with_view(state, params, |state, view| {
        let terms = match state.db.as_ref() {
            Some(conn) => load_term_calendar(conn)?,
            None => calendar::TermCalendar::default(),
        };
        let r = calendar::quick_range(range, today, &terms)
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        view.chain
            .set_params(&[
                ("startDate".to_string(), Some(r.start_date.to_string())),
                ("endDate".to_string(), Some(r.end_date.to_string())),
            ])
            .map_err(cascade_err)
    })
}

fn views_reload(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    with_view(state, params, |_, view| Ok(view.chain.reload()))
}

fn views_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let view_id = required_view_id(params)?;
    state
        .views
        .get(&view_id)
        .ok_or_else(|| HandlerErr::not_found(format!("view not found: {}", view_id)))?
        .snapshot(&view_id)
}

fn views_close(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let view_id = required_view_id(params)?;
    let closed = state.views.remove(&view_id).is_some();
    Ok(json!({ "viewId": view_id, "closed": closed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: fn(&mut AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "views.open" => views_open,
        "views.select" => views_select,
        "views.setParam" => views_set_param,
        "views.quickRange" => views_quick_range,
        "views.reload" => views_reload,
        "views.get" => views_get,
        "views.close" => views_close,
        _ => return None,
    };
    Some(match f(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}

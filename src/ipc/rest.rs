//! Maps REST-shaped calls (`GET /api/exams?classId=5`) onto named methods.

use crate::api::{ApiRequest, HttpMethod};
use crate::ipc::error::err;
use crate::ipc::helpers::{get_opt_str, get_required_str, HandlerErr};
use crate::ipc::router::handle_request;
use crate::ipc::types::{AppState, Request};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub method: &'static str,
    pub params: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route for {0}")]
    NotFound(String),
    #[error("{verb} is not allowed on {path}")]
    MethodNotAllowed { verb: HttpMethod, path: String },
}

type RouteEntry = (Vec<(HttpMethod, &'static str)>, Vec<(&'static str, i64)>);

fn id(s: &str) -> Option<i64> {
    s.parse::<i64>().ok()
}

fn table(segments: &[&str]) -> Option<RouteEntry> {
    use HttpMethod::{Delete, Get, Patch, Post, Put};
    let entry = match segments {
        ["branches"] => (vec![(Get, "branches.list"), (Post, "branches.create")], vec![]),
        ["academic-years"] => (
            vec![(Get, "academicYears.list"), (Post, "academicYears.create")],
            vec![],
        ),
        ["classes"] => (vec![(Get, "classes.list"), (Post, "classes.create")], vec![]),
        ["classes", class_id, "subjects"] => (
            vec![(Get, "subjects.list"), (Post, "classes.assignSubject")],
            vec![("classId", id(class_id)?)],
        ),
        ["subjects"] => (vec![(Get, "subjects.list"), (Post, "subjects.create")], vec![]),
        ["teachers"] => (vec![(Get, "teachers.list"), (Post, "teachers.create")], vec![]),
        ["students"] => (vec![(Get, "students.list"), (Post, "students.create")], vec![]),
        ["exams"] => (vec![(Get, "exams.list"), (Post, "exams.create")], vec![]),
        ["exams", exam_id] => (
            vec![
                (Get, "exams.get"),
                (Put, "exams.update"),
                (Delete, "exams.delete"),
            ],
            vec![("examId", id(exam_id)?)],
        ),
        ["exams", exam_id, "archive"] => {
            (vec![(Patch, "exams.archive")], vec![("examId", id(exam_id)?)])
        }
        ["exams", exam_id, "results"] => {
            (vec![(Post, "exams.setResults")], vec![("examId", id(exam_id)?)])
        }
        ["grades"] => (vec![(Get, "grades.list"), (Post, "grades.record")], vec![]),
        ["grades", "statistics"] => (vec![(Get, "grades.statistics")], vec![]),
        ["grades", "student"] => (vec![(Get, "grades.student")], vec![]),
        ["grades", "export"] => (vec![(Get, "grades.exportCsv")], vec![]),
        ["attendance"] => (
            vec![(Get, "attendance.list"), (Post, "attendance.mark")],
            vec![],
        ),
        ["attendance", "grid"] => (vec![(Get, "attendance.grid")], vec![]),
        ["attendance", "summary"] => (vec![(Get, "attendance.summary")], vec![]),
        ["attendance", "export"] => (vec![(Get, "attendance.exportCsv")], vec![]),
        ["homework"] => (vec![(Get, "homework.list"), (Post, "homework.create")], vec![]),
        ["homework", homework_id] => (
            vec![(Put, "homework.update"), (Delete, "homework.delete")],
            vec![("homeworkId", id(homework_id)?)],
        ),
        _ => return None,
    };
    Some(entry)
}

/// Resolves a request to a method name plus merged params (body, then query, then path ids).
pub fn route(req: &ApiRequest) -> Result<Routed, RouteError> {
    let segments = req.segments();
    let (verbs, path_ids) =
        table(&segments).ok_or_else(|| RouteError::NotFound(req.path.clone()))?;
    let method = verbs
        .iter()
        .find(|(v, _)| *v == req.method)
        .map(|(_, m)| *m)
        .ok_or_else(|| RouteError::MethodNotAllowed {
            verb: req.method,
            path: req.path.clone(),
        })?;

    let mut params = match &req.body {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    for (k, v) in &req.query {
        params.insert(k.clone(), Value::String(v.clone()));
    }
    for (k, id) in path_ids {
        params.insert(k.to_string(), Value::from(id));
    }
    Ok(Routed {
        method,
        params: Value::Object(params),
    })
}

/// Routes and executes an [`ApiRequest`] in-process, answering under `id`.
pub fn dispatch(state: &mut AppState, id: &str, api: &ApiRequest) -> Value {
    match route(api) {
        Ok(routed) => handle_request(
            state,
            Request {
                id: id.to_string(),
                method: routed.method.to_string(),
                params: routed.params,
            },
        ),
        Err(e @ RouteError::NotFound(_)) => err(id, "not_found", e.to_string(), None),
        Err(e @ RouteError::MethodNotAllowed { .. }) => err(id, "bad_params", e.to_string(), None),
    }
}

fn handle_api_request(state: &mut AppState, req: &Request) -> Value {
    let parsed = get_required_str(&req.params, "path").and_then(|path| {
        let verb = get_opt_str(&req.params, "method")?.unwrap_or_else(|| "GET".to_string());
        let method = HttpMethod::parse(&verb)
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
        ApiRequest::parse(method, &path)
            .map_err(|e| HandlerErr::bad_params(e.to_string()))
    });
    let api = match parsed {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let api = match req.params.get("body") {
        None | Some(Value::Null) => api,
        Some(body @ Value::Object(_)) => api.with_body(body.clone()),
        Some(_) => return err(&req.id, "bad_params", "body must be an object", None),
    };
    tracing::debug!(verb = %api.method, url = %api.url(), "api request");
    dispatch(state, &req.id, &api)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "api.request" => Some(handle_api_request(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn routed(method: HttpMethod, target: &str) -> Result<Routed, RouteError> {
        route(&ApiRequest::parse(method, target).expect("parse"))
    }

    #[test]
    fn statistics_route_carries_query_params() {
        let r = routed(
            HttpMethod::Get,
            "/api/grades/statistics?branchId=1&academicYearId=2&classId=5&subjectId=3",
        )
        .expect("route");
        assert_eq!(r.method, "grades.statistics");
        assert_eq!(r.params["classId"], json!("5"));
        assert_eq!(r.params["subjectId"], json!("3"));
    }

    #[test]
    fn path_ids_override_body_fields() {
        let req = ApiRequest::parse(HttpMethod::Patch, "/api/exams/42/archive")
            .expect("parse")
            .with_body(json!({ "examId": 7, "reason": "term over" }));
        let r = route(&req).expect("route");
        assert_eq!(r.method, "exams.archive");
        assert_eq!(r.params["examId"], json!(42));
        assert_eq!(r.params["reason"], json!("term over"));
    }

    #[test]
    fn verbs_select_methods_on_the_same_path() {
        assert_eq!(routed(HttpMethod::Get, "/api/exams/3").expect("get").method, "exams.get");
        assert_eq!(routed(HttpMethod::Put, "/api/exams/3").expect("put").method, "exams.update");
        assert_eq!(
            routed(HttpMethod::Delete, "/api/homework/9").expect("delete").method,
            "homework.delete"
        );
        assert_eq!(
            routed(HttpMethod::Post, "/api/exams/3"),
            Err(RouteError::MethodNotAllowed {
                verb: HttpMethod::Post,
                path: "/api/exams/3".into()
            })
        );
    }

    #[test]
    fn unknown_paths_and_non_numeric_ids_are_not_found() {
        assert!(matches!(
            routed(HttpMethod::Get, "/api/timetables"),
            Err(RouteError::NotFound(_))
        ));
        assert!(matches!(
            routed(HttpMethod::Get, "/api/exams/abc"),
            Err(RouteError::NotFound(_))
        ));
    }
}

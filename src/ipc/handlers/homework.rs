use crate::calendar;
use crate::ipc::helpers::{
    get_opt_date, get_opt_id, get_opt_str, get_required_date, get_required_id, get_required_str,
    iso, query_err, require_row, to_json, with_db, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Homework, HomeworkStatus};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};

const HOMEWORK_SELECT: &str = "SELECT
       h.id, h.title, h.description, h.class_id, h.subject_id, s.name,
       h.teacher_id, h.assigned_date, h.due_date, h.status
     FROM homework h
     JOIN subjects s ON s.id = h.subject_id";

fn parse_status(raw: &str) -> Result<HomeworkStatus, HandlerErr> {
    HomeworkStatus::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown homework status: {}", raw)))
}

fn query_homework(conn: &Connection, filter: &str, args: Vec<SqlValue>) -> Result<Vec<Homework>, HandlerErr> {
    let sql = format!(
        "{} WHERE 1 = 1{} ORDER BY h.due_date, h.id",
        HOMEWORK_SELECT, filter
    );
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let items = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(Homework {
                id: r.get(0)?,
                title: r.get(1)?,
                description: r.get(2)?,
                class_id: r.get(3)?,
                subject_id: r.get(4)?,
                subject_name: r.get(5)?,
                teacher_id: r.get(6)?,
                assigned_date: r.get(7)?,
                due_date: r.get(8)?,
                status: r.get(9)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(items)
}

fn load_one(conn: &Connection, homework_id: i64) -> Result<Homework, HandlerErr> {
    query_homework(conn, " AND h.id = ?", vec![SqlValue::Integer(homework_id)])?
        .into_iter()
        .next()
        .ok_or_else(|| HandlerErr::not_found("homework not found"))
}

fn check_dates(assigned: &str, due: &str) -> Result<(), HandlerErr> {
    if due < assigned {
        return Err(HandlerErr::bad_params("dueDate must not be before assignedDate"));
    }
    Ok(())
}

fn homework_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = String::new();
    let mut args = Vec::new();
    for (key, column) in [
        ("classId", "h.class_id"),
        ("subjectId", "h.subject_id"),
        ("teacherId", "h.teacher_id"),
    ] {
        if let Some(id) = get_opt_id(params, key)? {
            filter.push_str(&format!(" AND {} = ?", column));
            args.push(SqlValue::Integer(id));
        }
    }
    // The hosted views scope by branch and year; those live on the class.
    for (key, column) in [("branchId", "branch_id"), ("academicYearId", "academic_year_id")] {
        if let Some(id) = get_opt_id(params, key)? {
            filter.push_str(&format!(
                " AND h.class_id IN (SELECT id FROM classes WHERE {} = ?)",
                column
            ));
            args.push(SqlValue::Integer(id));
        }
    }
    if let Some(raw) = get_opt_str(params, "status")? {
        filter.push_str(" AND h.status = ?");
        args.push(SqlValue::Text(parse_status(&raw)?.as_str().to_string()));
    }
    let start = get_opt_date(params, "startDate")?;
    let end = get_opt_date(params, "endDate")?;
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(HandlerErr::bad_params("startDate must not be after endDate"));
        }
    }
    if let Some(s) = start {
        filter.push_str(" AND h.due_date >= ?");
        args.push(SqlValue::Text(iso(s)));
    }
    if let Some(e) = end {
        filter.push_str(" AND h.due_date <= ?");
        args.push(SqlValue::Text(iso(e)));
    }
    let items = query_homework(conn, &filter, args)?;
    Ok(json!({ "homework": to_json(&items)? }))
}

fn homework_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let description = get_opt_str(params, "description")?;
    let class_id = get_required_id(params, "classId")?;
    let subject_id = get_required_id(params, "subjectId")?;
    let teacher_id = get_opt_id(params, "teacherId")?;
    let assigned = get_opt_date(params, "assignedDate")?.unwrap_or_else(calendar::today);
    let due = get_required_date(params, "dueDate")?;
    if due < assigned {
        return Err(HandlerErr::bad_params("dueDate must not be before assignedDate"));
    }
    require_row(conn, "classes", class_id, "class")?;
    require_row(conn, "subjects", subject_id, "subject")?;
    if let Some(tid) = teacher_id {
        require_row(conn, "teachers", tid, "teacher")?;
    }

    conn.execute(
        "INSERT INTO homework(title, description, class_id, subject_id, teacher_id, assigned_date, due_date, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &title,
            &description,
            class_id,
            subject_id,
            teacher_id,
            iso(assigned),
            iso(due),
            HomeworkStatus::Active.as_str(),
        ),
    )
    .map_err(write_err("db_insert_failed", "homework"))?;
    let id = conn.last_insert_rowid();
    tracing::info!(homework_id = id, class_id, "homework created");
    to_json(&load_one(conn, id)?)
}

fn homework_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let homework_id = get_required_id(params, "homeworkId")?;
    let patch = params.get("patch").unwrap_or(params);
    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT assigned_date, due_date FROM homework WHERE id = ?",
            [homework_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((mut assigned, mut due)) = current else {
        return Err(HandlerErr::not_found("homework not found"));
    };

    let mut sets: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if patch.get("title").is_some() {
        sets.push("title = ?");
        args.push(SqlValue::Text(get_required_str(patch, "title")?));
    }
    if patch.get("description").is_some() {
        sets.push("description = ?");
        args.push(
            get_opt_str(patch, "description")?
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null),
        );
    }
    if patch.get("assignedDate").is_some() {
        assigned = iso(get_required_date(patch, "assignedDate")?);
        sets.push("assigned_date = ?");
        args.push(SqlValue::Text(assigned.clone()));
    }
    if patch.get("dueDate").is_some() {
        due = iso(get_required_date(patch, "dueDate")?);
        sets.push("due_date = ?");
        args.push(SqlValue::Text(due.clone()));
    }
    if let Some(raw) = get_opt_str(patch, "status")? {
        sets.push("status = ?");
        args.push(SqlValue::Text(parse_status(&raw)?.as_str().to_string()));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no updatable fields"));
    }
    check_dates(&assigned, &due)?;

    let sql = format!("UPDATE homework SET {} WHERE id = ?", sets.join(", "));
    args.push(SqlValue::Integer(homework_id));
    conn.execute(&sql, params_from_iter(args))
        .map_err(write_err("db_update_failed", "homework"))?;
    to_json(&load_one(conn, homework_id)?)
}

fn homework_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let homework_id = get_required_id(params, "homeworkId")?;
    let n = conn
        .execute("DELETE FROM homework WHERE id = ?", [homework_id])
        .map_err(write_err("db_delete_failed", "homework"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("homework not found"));
    }
    Ok(json!({ "homeworkId": homework_id, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "homework.list" => homework_list,
        "homework.create" => homework_create,
        "homework.update" => homework_update,
        "homework.delete" => homework_delete,
        _ => return None,
    };
    Some(with_db(state, req, f))
}

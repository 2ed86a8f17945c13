//! Scoping entities and the option lists the filter chains populate from.
//!
//! Every list answers with `items` (`{id, label}` pairs for a selector) next
//! to the full records.

use crate::cascade::OptionItem;
use crate::ipc::helpers::{
    get_opt_bool, get_opt_date, get_opt_id, get_opt_str, get_required_id, get_required_str,
    iso, query_err, require_row, to_json, with_db, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{AcademicYear, Branch, Class, Student, Subject, Teacher};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};

fn required_name(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let name = get_required_str(params, key)?;
    if name.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(name)
}

/// Appends `AND <column> = ?` for every id filter present in `params`.
fn push_id_filters(
    params: &Value,
    filters: &[(&str, &str)],
    sql: &mut String,
    args: &mut Vec<SqlValue>,
) -> Result<(), HandlerErr> {
    for (key, column) in filters {
        if let Some(id) = get_opt_id(params, key)? {
            sql.push_str(&format!(" AND {} = ?", column));
            args.push(SqlValue::Integer(id));
        }
    }
    Ok(())
}

fn branches_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code FROM branches ORDER BY name, id")
        .map_err(query_err)?;
    let branches = stmt
        .query_map([], |r| {
            Ok(Branch {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let items: Vec<OptionItem> = branches
        .iter()
        .map(|b| OptionItem {
            id: b.id,
            label: b.name.clone(),
        })
        .collect();
    Ok(json!({ "items": to_json(&items)?, "branches": to_json(&branches)? }))
}

fn branches_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_name(params, "name")?;
    let code = get_opt_str(params, "code")?;
    conn.execute(
        "INSERT INTO branches(name, code) VALUES(?, ?)",
        (&name, &code),
    )
    .map_err(write_err("db_insert_failed", "branches"))?;
    let id = conn.last_insert_rowid();
    tracing::info!(branch_id = id, name = %name, "branch created");
    Ok(json!({ "branchId": id, "name": name }))
}

fn academic_years_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, branch_id, name, start_date, end_date FROM academic_years WHERE 1 = 1",
    );
    let mut args = Vec::new();
    push_id_filters(params, &[("branchId", "branch_id")], &mut sql, &mut args)?;
    sql.push_str(" ORDER BY COALESCE(start_date, name) DESC, id DESC");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let years = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(AcademicYear {
                id: r.get(0)?,
                branch_id: r.get(1)?,
                name: r.get(2)?,
                start_date: r.get(3)?,
                end_date: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let items: Vec<OptionItem> = years
        .iter()
        .map(|y| OptionItem {
            id: y.id,
            label: y.name.clone(),
        })
        .collect();
    Ok(json!({ "items": to_json(&items)?, "academicYears": to_json(&years)? }))
}

fn academic_years_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let branch_id = get_required_id(params, "branchId")?;
    let name = required_name(params, "name")?;
    let start = get_opt_date(params, "startDate")?;
    let end = get_opt_date(params, "endDate")?;
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(HandlerErr::bad_params("startDate must not be after endDate"));
        }
    }
    require_row(conn, "branches", branch_id, "branch")?;
    conn.execute(
        "INSERT INTO academic_years(branch_id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (branch_id, &name, start.map(iso), end.map(iso)),
    )
    .map_err(write_err("db_insert_failed", "academic_years"))?;
    Ok(json!({ "academicYearId": conn.last_insert_rowid(), "name": name }))
}

fn classes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT
           c.id,
           c.branch_id,
           c.academic_year_id,
           c.name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count
         FROM classes c
         WHERE 1 = 1",
    );
    let mut args = Vec::new();
    push_id_filters(
        params,
        &[
            ("branchId", "c.branch_id"),
            ("academicYearId", "c.academic_year_id"),
        ],
        &mut sql,
        &mut args,
    )?;
    sql.push_str(" ORDER BY c.name, c.id");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let classes = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(Class {
                id: r.get(0)?,
                branch_id: r.get(1)?,
                academic_year_id: r.get(2)?,
                name: r.get(3)?,
                student_count: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let items: Vec<OptionItem> = classes
        .iter()
        .map(|c| OptionItem {
            id: c.id,
            label: c.name.clone(),
        })
        .collect();
    Ok(json!({ "items": to_json(&items)?, "classes": to_json(&classes)? }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let branch_id = get_required_id(params, "branchId")?;
    let academic_year_id = get_required_id(params, "academicYearId")?;
    let name = required_name(params, "name")?;

    let year_branch: Option<i64> = conn
        .query_row(
            "SELECT branch_id FROM academic_years WHERE id = ?",
            [academic_year_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    match year_branch {
        None => return Err(HandlerErr::not_found("academic year not found")),
        Some(b) if b != branch_id => {
            return Err(HandlerErr::bad_params(
                "academic year belongs to a different branch",
            ))
        }
        Some(_) => {}
    }

    conn.execute(
        "INSERT INTO classes(branch_id, academic_year_id, name) VALUES(?, ?, ?)",
        (branch_id, academic_year_id, &name),
    )
    .map_err(write_err("db_insert_failed", "classes"))?;
    Ok(json!({ "classId": conn.last_insert_rowid(), "name": name }))
}

fn classes_assign_subject(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let subject_id = get_required_id(params, "subjectId")?;
    let teacher_id = get_opt_id(params, "teacherId")?;
    require_row(conn, "classes", class_id, "class")?;
    require_row(conn, "subjects", subject_id, "subject")?;
    if let Some(tid) = teacher_id {
        require_row(conn, "teachers", tid, "teacher")?;
    }
    conn.execute(
        "INSERT INTO class_subjects(class_id, subject_id, teacher_id)
         VALUES(?, ?, ?)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET
           teacher_id = excluded.teacher_id",
        (class_id, subject_id, teacher_id),
    )
    .map_err(write_err("db_update_failed", "class_subjects"))?;
    Ok(json!({ "classId": class_id, "subjectId": subject_id, "teacherId": teacher_id }))
}

fn subjects_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_opt_id(params, "classId")?;
    let subjects = match class_id {
        Some(cid) => {
            let mut stmt = conn
                .prepare(
                    "SELECT s.id, s.name, s.code, cs.teacher_id
                     FROM class_subjects cs
                     JOIN subjects s ON s.id = cs.subject_id
                     WHERE cs.class_id = ?
                     ORDER BY s.name, s.id",
                )
                .map_err(query_err)?;
            let rows = stmt
                .query_map([cid], |r| {
                    Ok(Subject {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        code: r.get(2)?,
                        teacher_id: r.get(3)?,
                    })
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(query_err)?;
            rows
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT id, name, code FROM subjects ORDER BY name, id")
                .map_err(query_err)?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(Subject {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        code: r.get(2)?,
                        teacher_id: None,
                    })
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(query_err)?;
            rows
        }
    };
    let items: Vec<OptionItem> = subjects
        .iter()
        .map(|s| OptionItem {
            id: s.id,
            label: s.name.clone(),
        })
        .collect();
    Ok(json!({ "items": to_json(&items)?, "subjects": to_json(&subjects)? }))
}

fn subjects_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_name(params, "name")?;
    let code = get_opt_str(params, "code")?;
    conn.execute("INSERT INTO subjects(name, code) VALUES(?, ?)", (&name, &code))
        .map_err(write_err("db_insert_failed", "subjects"))?;
    Ok(json!({ "subjectId": conn.last_insert_rowid(), "name": name }))
}

fn teachers_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut sql =
        String::from("SELECT id, branch_id, first_name, last_name, email FROM teachers WHERE 1 = 1");
    let mut args = Vec::new();
    push_id_filters(params, &[("branchId", "branch_id")], &mut sql, &mut args)?;
    sql.push_str(" ORDER BY last_name, first_name, id");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let teachers = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(Teacher {
                id: r.get(0)?,
                branch_id: r.get(1)?,
                first_name: r.get(2)?,
                last_name: r.get(3)?,
                email: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let items: Vec<OptionItem> = teachers
        .iter()
        .map(|t| OptionItem {
            id: t.id,
            label: t.display_name(),
        })
        .collect();
    Ok(json!({ "items": to_json(&items)?, "teachers": to_json(&teachers)? }))
}

fn teachers_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let branch_id = get_required_id(params, "branchId")?;
    let first = required_name(params, "firstName")?;
    let last = required_name(params, "lastName")?;
    let email = get_opt_str(params, "email")?;
    require_row(conn, "branches", branch_id, "branch")?;
    conn.execute(
        "INSERT INTO teachers(branch_id, first_name, last_name, email) VALUES(?, ?, ?, ?)",
        (branch_id, &first, &last, &email),
    )
    .map_err(write_err("db_insert_failed", "teachers"))?;
    Ok(json!({ "teacherId": conn.last_insert_rowid() }))
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT s.id, s.class_id, s.first_name, s.last_name, s.student_no, s.active
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE 1 = 1",
    );
    let mut args = Vec::new();
    push_id_filters(
        params,
        &[
            ("classId", "s.class_id"),
            ("branchId", "c.branch_id"),
            ("academicYearId", "c.academic_year_id"),
        ],
        &mut sql,
        &mut args,
    )?;
    if get_opt_bool(params, "activeOnly")?.unwrap_or(true) {
        sql.push_str(" AND s.active = 1");
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name, s.id");

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let students = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(Student {
                id: r.get(0)?,
                class_id: r.get(1)?,
                first_name: r.get(2)?,
                last_name: r.get(3)?,
                student_no: r.get(4)?,
                active: r.get::<_, i64>(5)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let items: Vec<OptionItem> = students
        .iter()
        .map(|s| OptionItem {
            id: s.id,
            label: s.display_name(),
        })
        .collect();
    Ok(json!({ "items": to_json(&items)?, "students": to_json(&students)? }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let first = required_name(params, "firstName")?;
    let last = required_name(params, "lastName")?;
    let student_no = get_opt_str(params, "studentNo")?;
    let active = get_opt_bool(params, "active")?.unwrap_or(true);
    require_row(conn, "classes", class_id, "class")?;
    conn.execute(
        "INSERT INTO students(class_id, first_name, last_name, student_no, active)
         VALUES(?, ?, ?, ?, ?)",
        (class_id, &first, &last, &student_no, active as i64),
    )
    .map_err(write_err("db_insert_failed", "students"))?;
    Ok(json!({ "studentId": conn.last_insert_rowid() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "branches.list" => branches_list,
        "branches.create" => branches_create,
        "academicYears.list" => academic_years_list,
        "academicYears.create" => academic_years_create,
        "classes.list" => classes_list,
        "classes.create" => classes_create,
        "classes.assignSubject" => classes_assign_subject,
        "subjects.list" => subjects_list,
        "subjects.create" => subjects_create,
        "teachers.list" => teachers_list,
        "teachers.create" => teachers_create,
        "students.list" => students_list,
        "students.create" => students_create,
        _ => return None,
    };
    Some(with_db(state, req, f))
}

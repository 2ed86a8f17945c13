use crate::grading::{self, badge_view};
use crate::ipc::helpers::{
    get_opt_bool, get_opt_date, get_opt_f64, get_opt_id, get_opt_str, get_required_date,
    get_required_id, get_required_str, iso, query_err, require_row, to_json, with_db, write_err,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Exam, ExamResult, ExamStatus, NamedRef};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};

const EXAM_SELECT: &str = "SELECT
       e.id, e.name, e.exam_date, e.max_score, e.status,
       t.id, t.first_name, t.last_name,
       s.id, s.name,
       c.id, c.name,
       b.id, b.name,
       y.id, y.name
     FROM exams e
     JOIN subjects s ON s.id = e.subject_id
     JOIN classes c ON c.id = e.class_id
     JOIN branches b ON b.id = e.branch_id
     JOIN academic_years y ON y.id = e.academic_year_id
     LEFT JOIN teachers t ON t.id = e.teacher_id";

fn parse_status(raw: &str) -> Result<ExamStatus, HandlerErr> {
    ExamStatus::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown exam status: {}", raw)))
}

fn check_max_score(max_score: f64) -> Result<f64, HandlerErr> {
    if max_score.is_nan() || max_score <= 0.0 {
        return Err(HandlerErr::bad_params("maxScore must be greater than 0"));
    }
    Ok(max_score)
}

fn load_results(conn: &Connection, exam_id: i64, max_score: f64) -> Result<Vec<ExamResult>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.student_id, st.last_name, st.first_name, r.score, r.remarks
             FROM exam_results r
             JOIN students st ON st.id = r.student_id
             WHERE r.exam_id = ?
             ORDER BY st.last_name, st.first_name, st.id",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([exam_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            let score: Option<f64> = r.get(4)?;
            let pct = grading::percentage(score, max_score);
            Ok(ExamResult {
                id: r.get(0)?,
                exam_id,
                student_id: r.get(1)?,
                student_name: format!("{}, {}", last, first),
                score,
                percentage: pct.map(grading::round_1),
                badge: badge_view(pct),
                remarks: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

fn load_exams(conn: &Connection, filter: &str, args: Vec<SqlValue>) -> Result<Vec<Exam>, HandlerErr> {
    let sql = format!("{} WHERE 1 = 1{} ORDER BY e.exam_date DESC, e.id DESC", EXAM_SELECT, filter);
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let mut exams = stmt
        .query_map(params_from_iter(args), |r| {
            let teacher_id: Option<i64> = r.get(5)?;
            let teacher = match teacher_id {
                Some(id) => {
                    let first: String = r.get(6)?;
                    let last: String = r.get(7)?;
                    Some(NamedRef {
                        id,
                        name: format!("{} {}", first, last),
                    })
                }
                None => None,
            };
            Ok(Exam {
                id: r.get(0)?,
                name: r.get(1)?,
                exam_date: r.get(2)?,
                max_score: r.get(3)?,
                status: r.get(4)?,
                teacher,
                subject: NamedRef { id: r.get(8)?, name: r.get(9)? },
                class: NamedRef { id: r.get(10)?, name: r.get(11)? },
                branch: NamedRef { id: r.get(12)?, name: r.get(13)? },
                academic_year: NamedRef { id: r.get(14)?, name: r.get(15)? },
                average_percentage: None,
                exam_results: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    for exam in &mut exams {
        exam.exam_results = load_results(conn, exam.id, exam.max_score)?;
        let pcts: Vec<f64> = exam
            .exam_results
            .iter()
            .filter_map(|r| grading::percentage(r.score, exam.max_score))
            .collect();
        exam.average_percentage = grading::mean(&pcts).map(grading::round_1);
    }
    Ok(exams)
}

fn load_exam(conn: &Connection, exam_id: i64) -> Result<Exam, HandlerErr> {
    load_exams(conn, " AND e.id = ?", vec![SqlValue::Integer(exam_id)])?
        .into_iter()
        .next()
        .ok_or_else(|| HandlerErr::not_found("exam not found"))
}

fn exams_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = String::new();
    let mut args = Vec::new();
    for (key, column) in [
        ("branchId", "e.branch_id"),
        ("academicYearId", "e.academic_year_id"),
        ("classId", "e.class_id"),
        ("subjectId", "e.subject_id"),
        ("teacherId", "e.teacher_id"),
    ] {
        if let Some(id) = get_opt_id(params, key)? {
            filter.push_str(&format!(" AND {} = ?", column));
            args.push(SqlValue::Integer(id));
        }
    }
    let status = get_opt_str(params, "status")?
        .map(|s| parse_status(&s))
        .transpose()?;
    let include_archived = get_opt_bool(params, "includeArchived")?.unwrap_or(false);
    match status {
        Some(s) => {
            filter.push_str(" AND e.status = ?");
            args.push(SqlValue::Text(s.as_str().to_string()));
        }
        None if !include_archived => filter.push_str(" AND e.status <> 'archived'"),
        None => {}
    }
    if let Some(from) = get_opt_date(params, "startDate")? {
        filter.push_str(" AND e.exam_date >= ?");
        args.push(SqlValue::Text(iso(from)));
    }
    if let Some(to) = get_opt_date(params, "endDate")? {
        filter.push_str(" AND e.exam_date <= ?");
        args.push(SqlValue::Text(iso(to)));
    }

    let exams = load_exams(conn, &filter, args)?;
    Ok(json!({ "exams": to_json(&exams)? }))
}

fn exams_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_id(params, "examId")?;
    to_json(&load_exam(conn, exam_id)?)
}

fn exams_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let exam_date = get_required_date(params, "examDate")?;
    let max_score = check_max_score(
        get_opt_f64(params, "maxScore")?.ok_or_else(|| HandlerErr::bad_params("missing maxScore"))?,
    )?;
    let branch_id = get_required_id(params, "branchId")?;
    let academic_year_id = get_required_id(params, "academicYearId")?;
    let class_id = get_required_id(params, "classId")?;
    let subject_id = get_required_id(params, "subjectId")?;
    let teacher_id = get_opt_id(params, "teacherId")?;
    let status = get_opt_str(params, "status")?
        .map(|s| parse_status(&s))
        .transpose()?
        .unwrap_or(ExamStatus::Scheduled);

    let scope: Option<(i64, i64)> = conn
        .query_row(
            "SELECT branch_id, academic_year_id FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((class_branch, class_year)) = scope else {
        return Err(HandlerErr::not_found("class not found"));
    };
    if class_branch != branch_id || class_year != academic_year_id {
        return Err(HandlerErr::bad_params(
            "class does not belong to the given branch and academic year",
        ));
    }
    let linked: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_subjects WHERE class_id = ? AND subject_id = ?",
            (class_id, subject_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    if linked.is_none() {
        require_row(conn, "subjects", subject_id, "subject")?;
        return Err(HandlerErr::bad_params("subject is not taught in this class"));
    }
    if let Some(tid) = teacher_id {
        require_row(conn, "teachers", tid, "teacher")?;
    }

    conn.execute(
        "INSERT INTO exams(name, exam_date, max_score, status, branch_id, academic_year_id, class_id, subject_id, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &name,
            iso(exam_date),
            max_score,
            status.as_str(),
            branch_id,
            academic_year_id,
            class_id,
            subject_id,
            teacher_id,
        ),
    )
    .map_err(write_err("db_insert_failed", "exams"))?;
    let exam_id = conn.last_insert_rowid();
    tracing::info!(exam_id, class_id, subject_id, "exam created");
    Ok(json!({ "examId": exam_id }))
}

fn exams_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_id(params, "examId")?;
    let patch = params.get("patch").unwrap_or(params);
    require_row(conn, "exams", exam_id, "exam")?;

    let mut sets: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if patch.get("name").is_some() {
        sets.push("name = ?");
        args.push(SqlValue::Text(get_required_str(patch, "name")?));
    }
    if patch.get("examDate").is_some() {
        sets.push("exam_date = ?");
        args.push(SqlValue::Text(iso(get_required_date(patch, "examDate")?)));
    }
    if let Some(max) = get_opt_f64(patch, "maxScore")? {
        let max = check_max_score(max)?;
        let highest: Option<f64> = conn
            .query_row(
                "SELECT MAX(score) FROM exam_results WHERE exam_id = ?",
                [exam_id],
                |r| r.get(0),
            )
            .map_err(query_err)?;
        if highest.is_some_and(|h| h > max) {
            return Err(HandlerErr::bad_params(
                "maxScore is below an existing result",
            ));
        }
        sets.push("max_score = ?");
        args.push(SqlValue::Real(max));
    }
    if let Some(raw) = get_opt_str(patch, "status")? {
        sets.push("status = ?");
        args.push(SqlValue::Text(parse_status(&raw)?.as_str().to_string()));
    }
    if patch.get("teacherId").is_some() {
        let teacher_id = get_opt_id(patch, "teacherId")?;
        if let Some(tid) = teacher_id {
            require_row(conn, "teachers", tid, "teacher")?;
        }
        sets.push("teacher_id = ?");
        args.push(teacher_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no updatable fields"));
    }

    let sql = format!("UPDATE exams SET {} WHERE id = ?", sets.join(", "));
    args.push(SqlValue::Integer(exam_id));
    conn.execute(&sql, params_from_iter(args))
        .map_err(write_err("db_update_failed", "exams"))?;
    to_json(&load_exam(conn, exam_id)?)
}

fn exams_archive(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_id(params, "examId")?;
    require_row(conn, "exams", exam_id, "exam")?;
    let changed = conn
        .execute(
            "UPDATE exams SET status = 'archived' WHERE id = ? AND status <> 'archived'",
            [exam_id],
        )
        .map_err(write_err("db_update_failed", "exams"))?;
    if changed > 0 {
        tracing::info!(exam_id, "exam archived");
    }
    Ok(json!({ "examId": exam_id, "status": ExamStatus::Archived, "changed": changed > 0 }))
}

fn exams_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_id(params, "examId")?;
    require_row(conn, "exams", exam_id, "exam")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("UPDATE grades SET exam_id = NULL WHERE exam_id = ?", [exam_id])
        .map_err(write_err("db_update_failed", "grades"))?;
    let results = tx
        .execute("DELETE FROM exam_results WHERE exam_id = ?", [exam_id])
        .map_err(write_err("db_delete_failed", "exam_results"))?;
    tx.execute("DELETE FROM exams WHERE id = ?", [exam_id])
        .map_err(write_err("db_delete_failed", "exams"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(exam_id, results, "exam deleted");
    Ok(json!({ "examId": exam_id, "deletedResults": results }))
}

fn exams_set_results(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_id(params, "examId")?;
    let Some(results) = params.get("results").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing results"));
    };

    let exam: Option<(f64, i64, ExamStatus)> = conn
        .query_row(
            "SELECT max_score, class_id, status FROM exams WHERE id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((max_score, class_id, status)) = exam else {
        return Err(HandlerErr::not_found("exam not found"));
    };
    if status == ExamStatus::Archived {
        return Err(HandlerErr::new("conflict", "exam is archived"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut saved = 0usize;
    for (i, entry) in results.iter().enumerate() {
        let student_id = get_required_id(entry, "studentId")?;
        let score = get_opt_f64(entry, "score")?;
        let remarks = get_opt_str(entry, "remarks")?;
        if let Some(s) = score {
            if s.is_nan() || s < 0.0 || s > max_score {
                return Err(HandlerErr::bad_params(format!(
                    "score must be between 0 and {}",
                    max_score
                ))
                .with_details(json!({ "index": i, "studentId": student_id })));
            }
        }
        let student_class: Option<i64> = tx
            .query_row(
                "SELECT class_id FROM students WHERE id = ?",
                [student_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(query_err)?;
        if student_class != Some(class_id) {
            return Err(HandlerErr::bad_params("student is not in the exam's class")
                .with_details(json!({ "index": i, "studentId": student_id })));
        }
        tx.execute(
            "INSERT INTO exam_results(exam_id, student_id, score, remarks)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(exam_id, student_id) DO UPDATE SET
               score = excluded.score,
               remarks = excluded.remarks",
            (exam_id, student_id, score, &remarks),
        )
        .map_err(write_err("db_insert_failed", "exam_results"))?;
        saved += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let exam = load_exam(conn, exam_id)?;
    Ok(json!({ "saved": saved, "exam": to_json(&exam)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "exams.list" => exams_list,
        "exams.get" => exams_get,
        "exams.create" => exams_create,
        "exams.update" => exams_update,
        "exams.archive" => exams_archive,
        "exams.delete" => exams_delete,
        "exams.setResults" => exams_set_results,
        _ => return None,
    };
    Some(with_db(state, req, f))
}

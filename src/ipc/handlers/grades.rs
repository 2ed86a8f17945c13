use crate::export;
use crate::grading::{self, badge_view, BadgeView, ScoreSummary};
use crate::ipc::helpers::{
    get_opt_f64, get_opt_id, get_opt_str, get_required_id, query_err, require_row, to_json,
    with_db, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::models::Grade;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

const GRADE_SELECT: &str = "SELECT
       g.id, g.student_id, st.last_name, st.first_name,
       g.subject_id, s.name, g.class_id, g.branch_id, g.academic_year_id,
       g.exam_id, g.term, g.score, g.remarks, g.recorded_at
     FROM grades g
     JOIN students st ON st.id = g.student_id
     JOIN subjects s ON s.id = g.subject_id";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentAverage {
    student_id: i64,
    student_name: String,
    grade_count: usize,
    exam_count: usize,
    average: Option<f64>,
    badge: BadgeView,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExamAverage {
    id: i64,
    name: String,
    exam_date: String,
    status: String,
    average_percentage: Option<f64>,
}

#[derive(Debug, Clone)]
struct ClassStatistics {
    students: Vec<StudentAverage>,
    exams: Vec<ExamAverage>,
    summary: ScoreSummary,
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    branch_id: i64,
    academic_year_id: i64,
    class_id: i64,
    subject_id: i64,
}

impl Scope {
    fn from_params(params: &Value) -> Result<Self, HandlerErr> {
        Ok(Self {
            branch_id: get_required_id(params, "branchId")?,
            academic_year_id: get_required_id(params, "academicYearId")?,
            class_id: get_required_id(params, "classId")?,
            subject_id: get_required_id(params, "subjectId")?,
        })
    }

    fn check(&self, conn: &Connection) -> Result<(), HandlerErr> {
        let class: Option<(i64, i64)> = conn
            .query_row(
                "SELECT branch_id, academic_year_id FROM classes WHERE id = ?",
                [self.class_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(query_err)?;
        match class {
            None => Err(HandlerErr::not_found("class not found")),
            Some((b, y)) if b != self.branch_id || y != self.academic_year_id => Err(
                HandlerErr::bad_params("class does not belong to the given branch and academic year"),
            ),
            Some(_) => require_row(conn, "subjects", self.subject_id, "subject"),
        }
    }
}

fn grade_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Grade> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    let score: Option<f64> = r.get(11)?;
    Ok(Grade {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: format!("{}, {}", last, first),
        subject_id: r.get(4)?,
        subject_name: r.get(5)?,
        class_id: r.get(6)?,
        branch_id: r.get(7)?,
        academic_year_id: r.get(8)?,
        exam_id: r.get(9)?,
        term: r.get(10)?,
        score,
        badge: badge_view(score),
        remarks: r.get(12)?,
        recorded_at: r.get(13)?,
    })
}

fn query_grades(conn: &Connection, filter: &str, args: Vec<SqlValue>) -> Result<Vec<Grade>, HandlerErr> {
    let sql = format!(
        "{} WHERE 1 = 1{} ORDER BY st.last_name, st.first_name, g.recorded_at, g.id",
        GRADE_SELECT, filter
    );
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let grades = stmt
        .query_map(params_from_iter(args), grade_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(grades)
}

fn class_statistics(conn: &Connection, scope: Scope) -> Result<ClassStatistics, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY last_name, first_name, id",
        )
        .map_err(query_err)?;
    let roster: Vec<(i64, String)> = stmt
        .query_map([scope.class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((r.get(0)?, format!("{}, {}", last, first)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut grade_pcts: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, score FROM grades
             WHERE class_id = ? AND subject_id = ? AND academic_year_id = ? AND branch_id = ?
               AND score IS NOT NULL",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map(
            (scope.class_id, scope.subject_id, scope.academic_year_id, scope.branch_id),
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    for (student_id, score) in rows {
        grade_pcts.entry(student_id).or_default().push(score);
    }

    let mut exam_pcts: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT r.student_id, r.score, e.max_score
             FROM exam_results r
             JOIN exams e ON e.id = r.exam_id
             WHERE e.class_id = ? AND e.subject_id = ? AND e.status <> 'archived'
               AND r.score IS NOT NULL",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((scope.class_id, scope.subject_id), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    for (student_id, score, max) in rows {
        if let Some(p) = grading::percentage(Some(score), max) {
            exam_pcts.entry(student_id).or_default().push(p);
        }
    }

    let students: Vec<StudentAverage> = roster
        .into_iter()
        .map(|(student_id, student_name)| {
            let grades = grade_pcts.remove(&student_id).unwrap_or_default();
            let exams = exam_pcts.remove(&student_id).unwrap_or_default();
            let all: Vec<f64> = grades.iter().chain(exams.iter()).copied().collect();
            let average = grading::mean(&all).map(grading::round_1);
            StudentAverage {
                student_id,
                student_name,
                grade_count: grades.len(),
                exam_count: exams.len(),
                average,
                badge: badge_view(average),
            }
        })
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.name, e.exam_date, e.status, AVG(100.0 * r.score / e.max_score)
             FROM exams e
             LEFT JOIN exam_results r ON r.exam_id = e.id AND r.score IS NOT NULL
             WHERE e.class_id = ? AND e.subject_id = ? AND e.status <> 'archived'
             GROUP BY e.id
             ORDER BY e.exam_date, e.id",
        )
        .map_err(query_err)?;
    let exams = stmt
        .query_map((scope.class_id, scope.subject_id), |r| {
            let avg: Option<f64> = r.get(4)?;
            Ok(ExamAverage {
                id: r.get(0)?,
                name: r.get(1)?,
                exam_date: r.get(2)?,
                status: r.get(3)?,
                average_percentage: avg.map(grading::round_1),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let summary = grading::summarize(students.iter().map(|s| s.average));
    Ok(ClassStatistics {
        students,
        exams,
        summary,
    })
}

fn grades_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = String::new();
    let mut args = Vec::new();
    for (key, column) in [
        ("branchId", "g.branch_id"),
        ("academicYearId", "g.academic_year_id"),
        ("classId", "g.class_id"),
        ("subjectId", "g.subject_id"),
        ("studentId", "g.student_id"),
        ("examId", "g.exam_id"),
        ("term", "g.term"),
    ] {
        if let Some(v) = get_opt_id(params, key)? {
            filter.push_str(&format!(" AND {} = ?", column));
            args.push(SqlValue::Integer(v));
        }
    }
    let grades = query_grades(conn, &filter, args)?;
    Ok(json!({ "grades": to_json(&grades)? }))
}

fn grades_record(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_id(params, "studentId")?;
    let subject_id = get_required_id(params, "subjectId")?;
    let score = get_opt_f64(params, "score")?;
    if let Some(s) = score {
        if s.is_nan() || !(0.0..=100.0).contains(&s) {
            return Err(HandlerErr::bad_params("score must be a percentage between 0 and 100"));
        }
    }
    let term = get_opt_id(params, "term")?;
    let exam_id = get_opt_id(params, "examId")?;
    let remarks = get_opt_str(params, "remarks")?;

    let scope: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT c.id, c.branch_id, c.academic_year_id
             FROM students s JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((class_id, branch_id, academic_year_id)) = scope else {
        return Err(HandlerErr::not_found("student not found"));
    };
    require_row(conn, "subjects", subject_id, "subject")?;
    if let Some(eid) = exam_id {
        require_row(conn, "exams", eid, "exam")?;
    }

    let recorded_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO grades(student_id, subject_id, class_id, branch_id, academic_year_id, exam_id, term, score, remarks, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            student_id,
            subject_id,
            class_id,
            branch_id,
            academic_year_id,
            exam_id,
            term,
            score,
            &remarks,
            &recorded_at,
        ),
    )
    .map_err(write_err("db_insert_failed", "grades"))?;
    let grade_id = conn.last_insert_rowid();
    let grade = query_grades(conn, " AND g.id = ?", vec![SqlValue::Integer(grade_id)])?
        .into_iter()
        .next()
        .ok_or_else(|| HandlerErr::not_found("grade not found"))?;
    to_json(&grade)
}

fn grades_statistics(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let scope = Scope::from_params(params)?;
    scope.check(conn)?;
    let stats = class_statistics(conn, scope)?;
    Ok(json!({
        "branchId": scope.branch_id,
        "academicYearId": scope.academic_year_id,
        "classId": scope.class_id,
        "subjectId": scope.subject_id,
        "students": to_json(&stats.students)?,
        "exams": to_json(&stats.exams)?,
        "summary": to_json(&stats.summary)?
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectAverage {
    subject_id: i64,
    subject_name: String,
    average: Option<f64>,
    badge: BadgeView,
}

fn grades_student(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_id(params, "studentId")?;
    let subject_id = get_opt_id(params, "subjectId")?;
    require_row(conn, "students", student_id, "student")?;

    let mut filter = String::from(" AND g.student_id = ?");
    let mut args = vec![SqlValue::Integer(student_id)];
    if let Some(sid) = subject_id {
        filter.push_str(" AND g.subject_id = ?");
        args.push(SqlValue::Integer(sid));
    }
    let grades = query_grades(conn, &filter, args)?;

    let mut by_subject: BTreeMap<(String, i64), Vec<f64>> = BTreeMap::new();
    for g in &grades {
        let entry = by_subject
            .entry((g.subject_name.clone(), g.subject_id))
            .or_default();
        entry.extend(g.score);
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, r.score, e.max_score
             FROM exam_results r
             JOIN exams e ON e.id = r.exam_id
             JOIN subjects s ON s.id = e.subject_id
             WHERE r.student_id = ?1 AND e.status <> 'archived' AND (?2 IS NULL OR s.id = ?2)",
        )
        .map_err(query_err)?;
    let exam_rows = stmt
        .query_map((student_id, subject_id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    for (sid, name, score, max) in exam_rows {
        let entry = by_subject.entry((name, sid)).or_default();
        entry.extend(grading::percentage(score, max));
    }

    let subjects: Vec<SubjectAverage> = by_subject
        .into_iter()
        .map(|((subject_name, subject_id), pcts)| {
            let average = grading::mean(&pcts).map(grading::round_1);
            SubjectAverage {
                subject_id,
                subject_name,
                average,
                badge: badge_view(average),
            }
        })
        .collect();
    let overall = grading::mean(
        &subjects.iter().filter_map(|s| s.average).collect::<Vec<_>>(),
    )
    .map(grading::round_1);

    Ok(json!({
        "studentId": student_id,
        "subjects": to_json(&subjects)?,
        "overallAverage": overall,
        "overallBadge": to_json(&badge_view(overall))?,
        "grades": to_json(&grades)?
    }))
}

#[derive(Serialize)]
struct GradeCsvRow<'a> {
    student: &'a str,
    grades: usize,
    exams: usize,
    average: String,
    band: &'static str,
}

fn grades_export_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let scope = Scope::from_params(params)?;
    scope.check(conn)?;
    let stats = class_statistics(conn, scope)?;
    let rows: Vec<GradeCsvRow<'_>> = stats
        .students
        .iter()
        .map(|s| GradeCsvRow {
            student: &s.student_name,
            grades: s.grade_count,
            exams: s.exam_count,
            average: s.average.map(|a| format!("{:.1}", a)).unwrap_or_default(),
            band: s.badge.label,
        })
        .collect();
    let headers = ["Student", "Grades", "Exams", "Average", "Band"];

    let (class_name, subject_name): (String, String) = conn
        .query_row(
            "SELECT c.name, s.name FROM classes c, subjects s WHERE c.id = ? AND s.id = ?",
            (scope.class_id, scope.subject_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(query_err)?;

    if let Some(out) = get_opt_str(params, "outPath")? {
        let path = PathBuf::from(out);
        let n = export::write_csv_file(&headers, &rows, &path)
            .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
        tracing::info!(path = %path.display(), rows = n, "grades exported");
        return Ok(json!({ "path": path.to_string_lossy(), "rows": n }));
    }
    let content = export::to_csv_string(&headers, &rows)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
    Ok(json!({
        "contentType": "text/csv",
        "fileName": export::download_name("grades", &[&class_name, &subject_name]),
        "content": content,
        "rows": rows.len()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "grades.list" => grades_list,
        "grades.record" => grades_record,
        "grades.statistics" => grades_statistics,
        "grades.student" => grades_student,
        "grades.exportCsv" => grades_export_csv,
        _ => return None,
    };
    Some(with_db(state, req, f))
}

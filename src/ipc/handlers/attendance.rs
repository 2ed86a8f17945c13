use crate::calendar::DateRange;
use crate::export;
use crate::grading;
use crate::ipc::helpers::{
    get_opt_id, get_opt_str, get_required_date, get_required_id, iso, query_err, require_row,
    to_json, with_db, write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{AttendanceRecord, AttendanceStatus};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;

/// Widest range the grid renders, about two months.
const MAX_GRID_DAYS: i64 = 62;

#[derive(Debug, Clone)]
struct RosterStudent {
    id: i64,
    display_name: String,
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown attendance status: {}", raw)))
}

fn required_range(params: &Value) -> Result<DateRange, HandlerErr> {
    let start = get_required_date(params, "startDate")?;
    let end = get_required_date(params, "endDate")?;
    DateRange::new(start, end).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

fn class_roster(conn: &Connection, class_id: i64) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name
             FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY last_name, first_name, id",
        )
        .map_err(query_err)?;
    let roster = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(roster)
}

fn query_records(
    conn: &Connection,
    class_id: i64,
    range: &DateRange,
    extra: &str,
    mut args: Vec<SqlValue>,
) -> Result<Vec<AttendanceRecord>, HandlerErr> {
    let sql = format!(
        "SELECT a.id, a.student_id, st.last_name, st.first_name, a.class_id, a.date, a.status, a.remarks
         FROM attendance a
         JOIN students st ON st.id = a.student_id
         WHERE a.class_id = ? AND a.date >= ? AND a.date <= ?{}
         ORDER BY a.date, st.last_name, st.first_name, a.id",
        extra
    );
    let mut all = vec![
        SqlValue::Integer(class_id),
        SqlValue::Text(iso(range.start_date)),
        SqlValue::Text(iso(range.end_date)),
    ];
    all.append(&mut args);

    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(all), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(AttendanceRecord {
                id: r.get(0)?,
                student_id: r.get(1)?,
                student_name: format!("{}, {}", last, first),
                class_id: r.get(4)?,
                date: r.get(5)?,
                status: r.get(6)?,
                remarks: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

fn attendance_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let range = required_range(params)?;
    require_row(conn, "classes", class_id, "class")?;

    let mut extra = String::new();
    let mut args = Vec::new();
    if let Some(raw) = get_opt_str(params, "status")? {
        extra.push_str(" AND a.status = ?");
        args.push(SqlValue::Text(parse_status(&raw)?.as_str().to_string()));
    }
    if let Some(sid) = get_opt_id(params, "studentId")? {
        extra.push_str(" AND a.student_id = ?");
        args.push(SqlValue::Integer(sid));
    }
    let records = query_records(conn, class_id, &range, &extra, args)?;
    Ok(json!({
        "classId": class_id,
        "startDate": range.start_date,
        "endDate": range.end_date,
        "records": to_json(&records)?
    }))
}

fn attendance_mark(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let date = get_required_date(params, "date")?;
    let Some(entries) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing records"));
    };
    require_row(conn, "classes", class_id, "class")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut marked = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let student_id = get_required_id(entry, "studentId")?;
        let status = parse_status(&get_opt_str(entry, "status")?.unwrap_or_default())?;
        let remarks = get_opt_str(entry, "remarks")?;

        let student_class: Option<i64> = tx
            .query_row(
                "SELECT class_id FROM students WHERE id = ?",
                [student_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(query_err)?;
        if student_class != Some(class_id) {
            return Err(HandlerErr::bad_params("student is not in this class")
                .with_details(json!({ "index": i, "studentId": student_id })));
        }

        tx.execute(
            "INSERT INTO attendance(student_id, class_id, date, status, remarks)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               class_id = excluded.class_id,
               status = excluded.status,
               remarks = excluded.remarks",
            (student_id, class_id, iso(date), status.as_str(), &remarks),
        )
        .map_err(write_err("db_insert_failed", "attendance"))?;
        marked += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::debug!(class_id, date = %date, marked, "attendance marked");
    Ok(json!({ "classId": class_id, "date": date, "marked": marked }))
}

fn attendance_grid(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let range = required_range(params)?;
    if range.len_days() > MAX_GRID_DAYS {
        return Err(HandlerErr::bad_params(format!(
            "grid range is limited to {} days",
            MAX_GRID_DAYS
        ))
        .with_details(json!({ "days": range.len_days() })));
    }
    require_row(conn, "classes", class_id, "class")?;

    let roster = class_roster(conn, class_id)?;
    let dates: Vec<String> = range.days().map(iso).collect();
    let day_index: HashMap<&str, usize> = dates
        .iter()
        .enumerate()
        .map(|(i, d)| (d.as_str(), i))
        .collect();
    let row_index: HashMap<i64, usize> = roster
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id, i))
        .collect();

    let mut codes: Vec<Vec<String>> = vec![vec![String::new(); dates.len()]; roster.len()];
    for rec in query_records(conn, class_id, &range, "", Vec::new())? {
        let (Some(&r), Some(&c)) = (row_index.get(&rec.student_id), day_index.get(rec.date.as_str()))
        else {
            continue;
        };
        codes[r][c] = rec.status.code().to_string();
    }

    let students: Vec<Value> = roster
        .iter()
        .zip(codes)
        .map(|(s, row)| {
            json!({
                "studentId": s.id,
                "studentName": s.display_name,
                "codes": row
            })
        })
        .collect();
    Ok(json!({
        "classId": class_id,
        "dates": dates,
        "students": students
    }))
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentTally {
    student_id: i64,
    student_name: String,
    present: usize,
    absent: usize,
    late: usize,
    excused: usize,
    marked: usize,
    #[serde(skip)]
    attended: usize,
    percentage: Option<f64>,
}

impl StudentTally {
    fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
        if status.counts_as_attended() {
            self.attended += 1;
        }
        self.marked += 1;
    }

    fn finish(&mut self) {
        self.percentage = if self.marked == 0 {
            None
        } else {
            Some(grading::round_1(
                100.0 * self.attended as f64 / self.marked as f64,
            ))
        };
    }
}

fn tally(conn: &Connection, class_id: i64, range: &DateRange) -> Result<Vec<StudentTally>, HandlerErr> {
    let roster = class_roster(conn, class_id)?;
    let mut tallies: Vec<StudentTally> = roster
        .into_iter()
        .map(|s| StudentTally {
            student_id: s.id,
            student_name: s.display_name,
            ..StudentTally::default()
        })
        .collect();
    let index: HashMap<i64, usize> = tallies
        .iter()
        .enumerate()
        .map(|(i, t)| (t.student_id, i))
        .collect();
    for rec in query_records(conn, class_id, range, "", Vec::new())? {
        if let Some(&i) = index.get(&rec.student_id) {
            tallies[i].add(rec.status);
        }
    }
    for t in &mut tallies {
        t.finish();
    }
    Ok(tallies)
}

fn attendance_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let range = required_range(params)?;
    require_row(conn, "classes", class_id, "class")?;
    let students = tally(conn, class_id, &range)?;

    let mut total = StudentTally::default();
    for s in &students {
        total.present += s.present;
        total.absent += s.absent;
        total.late += s.late;
        total.excused += s.excused;
        total.marked += s.marked;
        total.attended += s.attended;
    }
    total.finish();
    Ok(json!({
        "classId": class_id,
        "startDate": range.start_date,
        "endDate": range.end_date,
        "students": to_json(&students)?,
        "totals": {
            "present": total.present,
            "absent": total.absent,
            "late": total.late,
            "excused": total.excused,
            "marked": total.marked,
            "percentage": total.percentage
        }
    }))
}

#[derive(Serialize)]
struct AttendanceCsvRow<'a> {
    student: &'a str,
    present: usize,
    absent: usize,
    late: usize,
    excused: usize,
    marked: usize,
    percentage: String,
}

fn attendance_export_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_id(params, "classId")?;
    let range = required_range(params)?;
    let class_name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()
        .map_err(query_err)?;
    let Some(class_name) = class_name else {
        return Err(HandlerErr::not_found("class not found"));
    };

    let students = tally(conn, class_id, &range)?;
    let rows: Vec<AttendanceCsvRow<'_>> = students
        .iter()
        .map(|s| AttendanceCsvRow {
            student: &s.student_name,
            present: s.present,
            absent: s.absent,
            late: s.late,
            excused: s.excused,
            marked: s.marked,
            percentage: s.percentage.map(|p| format!("{:.1}", p)).unwrap_or_default(),
        })
        .collect();
    let headers = ["Student", "Present", "Absent", "Late", "Excused", "Marked", "Attendance %"];

    if let Some(out) = get_opt_str(params, "outPath")? {
        let path = PathBuf::from(out);
        let n = export::write_csv_file(&headers, &rows, &path)
            .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
        tracing::info!(path = %path.display(), rows = n, "attendance exported");
        return Ok(json!({ "path": path.to_string_lossy(), "rows": n }));
    }
    let content = export::to_csv_string(&headers, &rows)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
    let start = iso(range.start_date);
    let end = iso(range.end_date);
    Ok(json!({
        "contentType": "text/csv",
        "fileName": export::download_name("attendance", &[&class_name, &start, &end]),
        "content": content,
        "rows": rows.len()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "attendance.list" => attendance_list,
        "attendance.mark" => attendance_mark,
        "attendance.grid" => attendance_grid,
        "attendance.summary" => attendance_summary,
        "attendance.exportCsv" => attendance_export_csv,
        _ => return None,
    };
    Some(with_db(state, req, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seeded() -> Connection {
        let conn = db::open_in_memory().expect("db");
        conn.execute_batch(
            "INSERT INTO branches(id, name) VALUES(1, 'North');
             INSERT INTO academic_years(id, branch_id, name) VALUES(2, 1, '2026/27');
             INSERT INTO classes(id, branch_id, academic_year_id, name) VALUES(5, 1, 2, '5B');
             INSERT INTO classes(id, branch_id, academic_year_id, name) VALUES(6, 1, 2, '6A');
             INSERT INTO students(id, class_id, first_name, last_name) VALUES(10, 5, 'Ada', 'Lovelace');
             INSERT INTO students(id, class_id, first_name, last_name) VALUES(11, 5, 'Alan', 'Turing');
             INSERT INTO students(id, class_id, first_name, last_name) VALUES(12, 6, 'Grace', 'Hopper');",
        )
        .expect("seed");
        conn
    }

    fn mark(conn: &Connection, date: &str, records: Value) -> Result<Value, HandlerErr> {
        attendance_mark(conn, &json!({ "classId": 5, "date": date, "records": records }))
    }

    #[test]
    fn marking_twice_upserts_per_student_and_day() {
        let conn = seeded();
        mark(&conn, "2026-09-07", json!([{ "studentId": 10, "status": "absent" }]))
            .ok()
            .expect("mark");
        mark(&conn, "2026-09-07", json!([{ "studentId": 10, "status": "L", "remarks": "bus" }]))
            .ok()
            .expect("remark");
        let listed = attendance_list(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-01", "endDate": "2026-09-30" }),
        )
        .ok()
        .expect("list");
        let records = listed["records"].as_array().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["status"], json!("late"));
        assert_eq!(records[0]["remarks"], json!("bus"));
    }

    #[test]
    fn a_foreign_student_rolls_back_the_day() {
        let conn = seeded();
        let e = mark(
            &conn,
            "2026-09-07",
            json!([{ "studentId": 10, "status": "present" }, { "studentId": 12, "status": "present" }]),
        )
        .err()
        .expect("rejected");
        assert_eq!(e.code, "bad_params");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn list_rejects_inverted_range() {
        let conn = seeded();
        let e = attendance_list(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-30", "endDate": "2026-09-01" }),
        )
        .err()
        .expect("inverted");
        assert_eq!(e.code, "bad_params");
    }

    #[test]
    fn grid_places_codes_and_caps_range() {
        let conn = seeded();
        mark(
            &conn,
            "2026-09-08",
            json!([{ "studentId": 10, "status": "present" }, { "studentId": 11, "status": "excused" }]),
        )
        .ok()
        .expect("mark");
        let grid = attendance_grid(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-07", "endDate": "2026-09-09" }),
        )
        .ok()
        .expect("grid");
        assert_eq!(grid["dates"], json!(["2026-09-07", "2026-09-08", "2026-09-09"]));
        assert_eq!(grid["students"][0]["codes"], json!(["", "P", ""]));
        assert_eq!(grid["students"][1]["codes"], json!(["", "E", ""]));

        let e = attendance_grid(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-01", "endDate": "2026-11-30" }),
        )
        .err()
        .expect("too wide");
        assert_eq!(e.code, "bad_params");
    }

    #[test]
    fn unknown_stored_status_is_a_query_failure() {
        let conn = seeded();
        mark(&conn, "2026-09-07", json!([{ "studentId": 10, "status": "present" }]))
            .ok()
            .expect("mark");
        conn.execute("UPDATE attendance SET status = 'holiday'", []).expect("corrupt");
        let e = attendance_list(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-01", "endDate": "2026-09-30" }),
        )
        .err()
        .expect("rejected");
        assert_eq!(e.code, "db_query_failed");
        assert!(e.message.contains("holiday"));
    }

    #[test]
    fn summary_counts_late_as_attended() {
        let conn = seeded();
        for (date, status) in [
            ("2026-09-07", "present"),
            ("2026-09-08", "late"),
            ("2026-09-09", "absent"),
            ("2026-09-10", "excused"),
        ] {
            mark(&conn, date, json!([{ "studentId": 10, "status": status }]))
                .ok()
                .expect("mark");
        }
        let s = attendance_summary(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-01", "endDate": "2026-09-30" }),
        )
        .ok()
        .expect("summary");
        let ada = &s["students"][0];
        assert_eq!(ada["marked"], json!(4));
        assert_eq!(ada["percentage"], json!(50.0));
        assert_eq!(s["students"][1]["percentage"], Value::Null);
        assert_eq!(s["totals"]["late"], json!(1));

        let csv = attendance_export_csv(
            &conn,
            &json!({ "classId": 5, "startDate": "2026-09-01", "endDate": "2026-09-30" }),
        )
        .ok()
        .expect("export");
        assert_eq!(csv["fileName"], json!("attendance_5B_2026-09-01_2026-09-30.csv"));
        let content = csv["content"].as_str().expect("content");
        assert!(content.starts_with("Student,Present,Absent,Late,Excused,Marked,Attendance %\n"));
        assert!(content.contains("\"Lovelace, Ada\",1,1,1,1,4,50.0"));
    }
}

//! Response records, one shape per endpoint family.

use crate::grading::BadgeView;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use serde::{Deserialize, Serialize};

/// Reads a stored status column; an unknown value is a conversion error, not a default.
fn status_column<T>(value: ValueRef<'_>, what: &str, parse: fn(&str) -> Option<T>) -> FromSqlResult<T> {
    let raw = value.as_str()?;
    parse(raw).ok_or_else(|| FromSqlError::Other(format!("invalid stored {} status: {}", what, raw).into()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    pub id: i64,
    pub branch_id: i64,
    pub name: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: i64,
    pub branch_id: i64,
    pub academic_year_id: i64,
    pub name: String,
    pub student_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
    /// Set when listed for a class that has an assigned teacher.
    pub teacher_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub id: i64,
    pub branch_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

impl Teacher {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: i64,
    pub class_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub student_no: Option<String>,
    pub active: bool,
}

impl Student {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExamStatus {
    Scheduled,
    Completed,
    Archived,
}

impl ExamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStatus::Scheduled => "scheduled",
            ExamStatus::Completed => "completed",
            ExamStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(ExamStatus::Scheduled),
            "completed" => Some(ExamStatus::Completed),
            "archived" => Some(ExamStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    pub id: i64,
    pub exam_id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub score: Option<f64>,
    pub percentage: Option<f64>,
    pub badge: BadgeView,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: i64,
    pub name: String,
    pub exam_date: String,
    pub max_score: f64,
    pub status: ExamStatus,
    pub teacher: Option<NamedRef>,
    pub subject: NamedRef,
    pub class: NamedRef,
    pub branch: NamedRef,
    pub academic_year: NamedRef,
    pub average_percentage: Option<f64>,
    pub exam_results: Vec<ExamResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub subject_id: i64,
    pub subject_name: String,
    pub class_id: i64,
    pub branch_id: i64,
    pub academic_year_id: i64,
    pub exam_id: Option<i64>,
    pub term: Option<i64>,
    pub score: Option<f64>,
    pub badge: BadgeView,
    pub remarks: Option<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 4] = [
        AttendanceStatus::Present,
        AttendanceStatus::Absent,
        AttendanceStatus::Late,
        AttendanceStatus::Excused,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }

    /// Single-letter grid code.
    pub fn code(self) -> char {
        match self {
            AttendanceStatus::Present => 'P',
            AttendanceStatus::Absent => 'A',
            AttendanceStatus::Late => 'L',
            AttendanceStatus::Excused => 'E',
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        Self::ALL.into_iter().find(|st| {
            st.as_str().eq_ignore_ascii_case(t)
                || (t.len() == 1 && t.chars().next().map(|c| c.to_ascii_uppercase()) == Some(st.code()))
        })
    }

    pub fn counts_as_attended(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub class_id: i64,
    pub date: String,
    pub status: AttendanceStatus,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HomeworkStatus {
    Active,
    Closed,
}

impl HomeworkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HomeworkStatus::Active => "active",
            HomeworkStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(HomeworkStatus::Active),
            "closed" => Some(HomeworkStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Homework {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub class_id: i64,
    pub subject_id: i64,
    pub subject_name: String,
    pub teacher_id: Option<i64>,
    pub assigned_date: String,
    pub due_date: String,
    pub status: HomeworkStatus,
}

impl FromSql for ExamStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        status_column(value, "exam", ExamStatus::parse)
    }
}

impl FromSql for AttendanceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        status_column(value, "attendance", AttendanceStatus::parse)
    }
}

impl FromSql for HomeworkStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        status_column(value, "homework", HomeworkStatus::parse)
    }
}

//! CSV rendering for the attendance and grade downloads.

use anyhow::Context;
use csv::WriterBuilder;
use serde::Serialize;
use std::path::Path;

/// Renders `rows` under an explicit header line, so an empty export still has columns.
pub fn to_csv_string<T: Serialize>(headers: &[&str], rows: &[T]) -> anyhow::Result<String> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(vec![]);
    writer
        .write_record(headers)
        .context("failed to write CSV header")?;
    for row in rows {
        writer
            .serialize(row)
            .context("failed to write CSV record")?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush CSV: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

pub fn write_csv_file<T: Serialize>(
    headers: &[&str],
    rows: &[T],
    path: &Path,
) -> anyhow::Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let content = to_csv_string(headers, rows)?;
    std::fs::write(path, content)
        .with_context(|| format!("failed to write {}", path.to_string_lossy()))?;
    Ok(rows.len())
}

/// File name for a download, e.g. `attendance_2026-09-01_2026-09-30.csv`.
pub fn download_name(prefix: &str, parts: &[&str]) -> String {
    let mut name = prefix.to_string();
    for p in parts.iter().filter(|p| !p.is_empty()) {
        name.push('_');
        name.extend(
            p.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' }),
        );
    }
    name.push_str(".csv");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        student: String,
        status: &'static str,
        remarks: Option<String>,
    }

    #[test]
    fn empty_export_still_has_header() {
        let rows: Vec<Row> = Vec::new();
        let csv = to_csv_string(&["student", "status", "remarks"], &rows).expect("csv");
        assert_eq!(csv, "student,status,remarks\n");
    }

    #[test]
    fn values_with_commas_are_quoted() {
        let rows = vec![Row {
            student: "Doe, Jane".to_string(),
            status: "present",
            remarks: None,
        }];
        let csv = to_csv_string(&["student", "status", "remarks"], &rows).expect("csv");
        assert_eq!(csv, "student,status,remarks\n\"Doe, Jane\",present,\n");
    }

    #[test]
    fn download_names_are_filesystem_safe() {
        assert_eq!(
            download_name("attendance", &["Grade 5/B", "2026-09-01"]),
            "attendance_Grade-5-B_2026-09-01.csv"
        );
    }
}

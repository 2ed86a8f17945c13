use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoold-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["result"]["workspacePath"], serde_json::Value::Null);

    let before = request(&mut stdin, &mut reader, "2", "branches.list", json!({}));
    assert_eq!(error_code(&before), Some("no_workspace"));

    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let branch = request(&mut stdin, &mut reader, "4", "branches.create", json!({ "name": "North" }));
    let branch_id = branch["result"]["branchId"].as_i64().expect("branchId");
    let year = request(
        &mut stdin,
        &mut reader,
        "5",
        "academicYears.create",
        json!({ "branchId": branch_id, "name": "2026/27" }),
    );
    let year_id = year["result"]["academicYearId"].as_i64().expect("academicYearId");
    let class = request(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({ "branchId": branch_id, "academicYearId": year_id, "name": "5B" }),
    );
    let class_id = class["result"]["classId"].as_i64().expect("classId");

    let calls = [
        ("teachers.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("subjects.list", json!({ "classId": class_id })),
        ("exams.list", json!({ "classId": class_id })),
        ("grades.list", json!({ "classId": class_id })),
        ("attendance.list", json!({ "classId": class_id, "startDate": "2026-09-01", "endDate": "2026-09-30" })),
        ("homework.list", json!({ "classId": class_id })),
        ("settings.get", json!({ "key": "calendar.termStartMonths" })),
        ("calendar.quickRange", json!({ "range": "thisTerm", "today": "2026-01-15" })),
        ("grading.badge", json!({ "score": 91 })),
        ("api.request", json!({ "method": "GET", "path": "/api/branches" })),
        ("backup.exportWorkspaceBundle", json!({ "outPath": bundle_out.to_string_lossy() })),
    ];
    for (i, (method, params)) in calls.iter().enumerate() {
        let id = format!("c{}", i);
        let resp = request(&mut stdin, &mut reader, &id, method, params.clone());
        assert_eq!(resp["ok"], json!(true), "{} failed: {}", method, resp);
    }

    // Sent raw: `request` treats not_implemented as a failure.
    writeln!(
        stdin,
        "{}",
        json!({ "id": "u1", "method": "timetable.list", "params": {} })
    )
    .expect("write unknown method");
    stdin.flush().expect("flush unknown method");
    let unknown = read_response(&mut reader);
    assert_eq!(unknown["id"], json!("u1"));
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let garbage = read_response(&mut reader);
    assert_eq!(error_code(&garbage), Some("bad_json"));

    let after = request(&mut stdin, &mut reader, "last", "health", json!({}));
    assert_eq!(after["ok"], json!(true));
    assert!(bundle_out.is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn badge_and_quick_range_work_without_a_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let badge = request(&mut stdin, &mut reader, "1", "grading.badge", json!({ "score": null }));
    assert_eq!(badge["result"]["label"], json!("N/A"));
    let badge = request(&mut stdin, &mut reader, "2", "grading.badge", json!({ "score": 74.9 }));
    assert_eq!(badge["result"]["label"], json!("Average"));

    let term = request(
        &mut stdin,
        &mut reader,
        "3",
        "calendar.quickRange",
        json!({ "range": "This Term", "today": "2026-01-15" }),
    );
    assert_eq!(term["result"]["startDate"], json!("2026-01-01"));
    assert_eq!(term["result"]["endDate"], json!("2026-03-31"));

    let bad = request(&mut stdin, &mut reader, "4", "calendar.quickRange", json!({ "range": "fortnight" }));
    assert_eq!(error_code(&bad), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
}

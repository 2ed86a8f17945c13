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

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn post(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    path: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "api.request",
        json!({ "method": "POST", "path": path, "body": body }),
    )
}

fn statistics_fetches(view: &serde_json::Value) -> Vec<String> {
    view["fetchLog"]
        .as_array()
        .expect("fetchLog")
        .iter()
        .filter_map(|u| u.as_str())
        .filter(|u| u.starts_with("/api/grades/statistics"))
        .map(|u| u.to_string())
        .collect()
}

/// Branch 1, academic year 2, class 5 and subject 3, with a few decoys in between.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let b = post(stdin, reader, "s-b", "/api/branches", json!({ "name": "North Campus" }));
    assert_eq!(b["branchId"], json!(1));
    post(stdin, reader, "s-y1", "/api/academic-years", json!({ "branchId": 1, "name": "2025/26" }));
    let y = post(stdin, reader, "s-y2", "/api/academic-years", json!({ "branchId": 1, "name": "2026/27" }));
    assert_eq!(y["academicYearId"], json!(2));
    for (i, name) in ["1A", "2A", "3A", "4A"].iter().enumerate() {
        post(
            stdin,
            reader,
            &format!("s-c{}", i),
            "/api/classes",
            json!({ "branchId": 1, "academicYearId": 2, "name": name }),
        );
    }
    let c = post(stdin, reader, "s-c5", "/api/classes", json!({ "branchId": 1, "academicYearId": 2, "name": "5B" }));
    assert_eq!(c["classId"], json!(5));
    post(stdin, reader, "s-s1", "/api/subjects", json!({ "name": "Art" }));
    post(stdin, reader, "s-s2", "/api/subjects", json!({ "name": "Biology" }));
    let s = post(stdin, reader, "s-s3", "/api/subjects", json!({ "name": "Mathematics" }));
    assert_eq!(s["subjectId"], json!(3));
    post(stdin, reader, "s-cs3", "/api/classes/5/subjects", json!({ "subjectId": 3 }));
    post(stdin, reader, "s-cs2", "/api/classes/5/subjects", json!({ "subjectId": 2 }));
    for (first, last) in [("Ada", "Lovelace"), ("Alan", "Turing")] {
        post(
            stdin,
            reader,
            &format!("s-st-{}", last),
            "/api/students",
            json!({ "classId": 5, "firstName": first, "lastName": last }),
        );
    }
}

#[test]
fn gradebook_fetches_statistics_exactly_once_after_subject() {
    let workspace = temp_dir("schoold-gradebook-cascade");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed(&mut stdin, &mut reader);

    let opened = request_ok(&mut stdin, &mut reader, "open", "views.open", json!({ "kind": "gradebook" }));
    let view_id = opened["viewId"].as_str().expect("viewId").to_string();
    assert_eq!(opened["levels"][0]["options"]["data"][0]["label"], json!("North Campus"));

    let mut last = opened;
    for (i, (field, value)) in [("branch", 1), ("academicYear", 2), ("class", 5)].iter().enumerate() {
        last = request_ok(
            &mut stdin,
            &mut reader,
            &format!("sel{}", i),
            "views.select",
            json!({ "viewId": view_id, "field": field, "value": value }),
        );
    }
    assert_eq!(last["levels"][3]["selected"], serde_json::Value::Null);
    assert_eq!(last["complete"], json!(false));
    assert!(statistics_fetches(&last).is_empty());
    let subject_labels: Vec<&str> = last["levels"][3]["options"]["data"]
        .as_array()
        .expect("subject options")
        .iter()
        .filter_map(|o| o["label"].as_str())
        .collect();
    assert_eq!(subject_labels, vec!["Biology", "Mathematics"]);

    let done = request_ok(
        &mut stdin,
        &mut reader,
        "sel-subject",
        "views.select",
        json!({ "viewId": view_id, "field": "subject", "value": 3 }),
    );
    assert_eq!(
        statistics_fetches(&done),
        vec!["/api/grades/statistics?branchId=1&academicYearId=2&classId=5&subjectId=3".to_string()]
    );
    assert_eq!(done["dataset"]["state"], json!("populated"));
    assert_eq!(done["dataset"]["data"]["students"].as_array().map(|a| a.len()), Some(2));

    // Changing class clears subject and the dataset, with no new statistics fetch.
    let changed = request_ok(
        &mut stdin,
        &mut reader,
        "sel-class-again",
        "views.select",
        json!({ "viewId": view_id, "field": "class", "value": 1 }),
    );
    assert_eq!(changed["levels"][3]["selected"], serde_json::Value::Null);
    assert_eq!(changed["levels"][3]["options"]["data"], json!([]));
    assert_eq!(changed["dataset"]["state"], json!("idle"));
    assert_eq!(statistics_fetches(&changed).len(), 1);

    let closed = request_ok(&mut stdin, &mut reader, "close", "views.close", json!({ "viewId": view_id }));
    assert_eq!(closed["closed"], json!(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn failed_dataset_fetch_leaves_error_state_until_reload() {
    let workspace = temp_dir("schoold-gradebook-reload");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed(&mut stdin, &mut reader);

    let opened = request_ok(&mut stdin, &mut reader, "open", "views.open", json!({ "kind": "exams" }));
    let view_id = opened["viewId"].as_str().expect("viewId").to_string();
    for (i, (field, value)) in [("branch", 1), ("academicYear", 2), ("class", 5), ("subject", 3)]
        .iter()
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("sel{}", i),
            "views.select",
            json!({ "viewId": view_id, "field": field, "value": value }),
        );
    }

    // An unknown status makes the exams endpoint reject the request.
    let failed = request_ok(
        &mut stdin,
        &mut reader,
        "bad-status",
        "views.setParam",
        json!({ "viewId": view_id, "key": "status", "value": "cancelled" }),
    );
    assert_eq!(failed["dataset"]["state"], json!("error"));
    assert!(failed["dataset"]["message"]
        .as_str()
        .unwrap_or("")
        .starts_with("bad_params"));

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "clear-status",
        "views.setParam",
        json!({ "viewId": view_id, "key": "status", "value": null }),
    );
    assert_eq!(cleared["dataset"]["state"], json!("populated"));
    assert_eq!(cleared["dataset"]["data"]["exams"], json!([]));

    let fetches_before = cleared["fetchLog"].as_array().map(|a| a.len()).unwrap_or(0);
    let reloaded = request_ok(&mut stdin, &mut reader, "reload", "views.reload", json!({ "viewId": view_id }));
    assert_eq!(
        reloaded["fetchLog"].as_array().map(|a| a.len()),
        Some(fetches_before + 1)
    );
    assert_eq!(
        reloaded["fetchLog"].as_array().and_then(|a| a.last()),
        Some(&json!("/api/exams?branchId=1&academicYearId=2&classId=5&subjectId=3"))
    );

    // A selector's query key cannot be smuggled in as a view parameter.
    let overridden = request(
        &mut stdin,
        &mut reader,
        "override-class",
        "views.setParam",
        json!({ "viewId": view_id, "key": "classId", "value": "1" }),
    );
    assert_eq!(overridden["error"]["code"], json!("bad_params"));
    let after = request_ok(&mut stdin, &mut reader, "get", "views.get", json!({ "viewId": view_id }));
    assert_eq!(after["fetchLog"], reloaded["fetchLog"]);
    assert_eq!(after["levels"][2]["selected"], json!(5));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

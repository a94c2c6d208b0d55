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
    let exe = env!("CARGO_BIN_EXE_counseld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn counseld");
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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn login_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let captcha = request_ok(stdin, reader, "cap", "auth.captcha.new", json!({}));
    let login = request_ok(
        stdin,
        reader,
        "login",
        "auth.adminLogin",
        json!({
            "username": "admin",
            "password": "password123",
            "captchaId": captcha["captchaId"],
            "captchaAnswer": captcha["code"],
        }),
    );
    login["user"]["id"].as_str().expect("admin id").to_string()
}

fn login_member(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    contact: &str,
) -> String {
    let captcha = request_ok(stdin, reader, "cap", "auth.captcha.new", json!({}));
    let sent = request_ok(
        stdin,
        reader,
        "otp-req",
        "auth.otp.request",
        json!({
            "contact": contact,
            "captchaId": captcha["captchaId"],
            "captchaAnswer": captcha["code"],
        }),
    );
    let code = sent["devCode"].as_str().expect("devCode echoed").to_string();
    let verified = request_ok(
        stdin,
        reader,
        "otp-verify",
        "auth.otp.verify",
        json!({ "contact": contact, "otp": code }),
    );
    verified["user"]["id"].as_str().expect("member id").to_string()
}

fn setup_two_members(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    login_admin(stdin, reader);
    let _ = request_ok(
        stdin,
        reader,
        "m1",
        "members.create",
        json!({ "name": "Asha Patil", "mobile": "9876543201", "username": "asha" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "m2",
        "members.create",
        json!({ "name": "Ravi Kulkarni", "mobile": "9876543202", "username": "ravi" }),
    );
    let _ = request_ok(stdin, reader, "out", "auth.logout", json!({}));
}

#[test]
fn reports_validate_fields_per_type() {
    let workspace = temp_dir("counseld-reports-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_two_members(&mut stdin, &mut reader, &workspace);
    login_member(&mut stdin, &mut reader, "9876543201");

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "1",
            "reports.create",
            json!({ "type": "Workshop", "schoolName": "MES", "content": "x" }),
        ),
        "bad_params"
    );
    // Counselling needs a student and standard.
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "reports.create",
            json!({ "type": "Counselling", "schoolName": "MES", "content": "x", "topic": "Exams" }),
        ),
        "bad_params"
    );
    // Session needs a non-negative attendee count.
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "reports.create",
            json!({ "type": "Session", "schoolName": "MES", "content": "x", "topic": "Exams", "attendees": -3 }),
        ),
        "bad_params"
    );

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.create",
        json!({
            "type": "Session",
            "schoolName": "MES High School",
            "content": "Stress management talk",
            "topic": "Exam stress",
            "attendees": "42",
            "studentName": "leftover from the other tab",
        }),
    );
    let report = &session["report"];
    assert_eq!(report["type"], json!("Session"));
    assert_eq!(report["attendees"], json!(42));
    assert!(report["studentName"].is_null());
    assert_eq!(report["date"].as_str().map(|d| d.len()), Some(10));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reports_are_owned_by_their_author() {
    let workspace = temp_dir("counseld-reports-owner");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_two_members(&mut stdin, &mut reader, &workspace);

    let asha_id = login_member(&mut stdin, &mut reader, "9876543201");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.create",
        json!({
            "type": "Counselling",
            "schoolName": "MES High School",
            "content": "Discussed career options",
            "studentName": "Rohan Sharma",
            "standard": "10",
        }),
    );
    let report_id = created["report"]["id"].as_str().expect("id").to_string();
    assert_eq!(created["report"]["createdBy"], json!(asha_id));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.create",
        json!({
            "type": "Session",
            "schoolName": "MES High School",
            "content": "Group session",
            "topic": "Study habits",
            "attendees": 30,
        }),
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.update",
        json!({
            "reportId": report_id,
            "type": "Counselling",
            "schoolName": "MES High School",
            "content": "Discussed career options, follow-up in a week",
            "studentName": "Rohan Sharma",
            "standard": "10",
        }),
    );
    assert!(updated["report"]["content"]
        .as_str()
        .unwrap_or("")
        .contains("follow-up"));
    assert!(updated["report"]["updatedAt"].is_string());

    let _ = request_ok(&mut stdin, &mut reader, "4", "auth.logout", json!({}));
    login_member(&mut stdin, &mut reader, "9876543202");

    let mine = request_ok(&mut stdin, &mut reader, "5", "reports.list", json!({}));
    assert_eq!(mine["reports"].as_array().map(|a| a.len()), Some(0));
    // A member can't peek at someone else's reports by passing memberId.
    let peek = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.list",
        json!({ "memberId": asha_id }),
    );
    assert_eq!(peek["reports"].as_array().map(|a| a.len()), Some(0));

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "reports.update",
            json!({
                "reportId": report_id,
                "type": "Counselling",
                "schoolName": "x",
                "content": "x",
                "studentName": "x",
                "standard": "x",
            }),
        ),
        "forbidden"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "reports.delete",
            json!({ "reportId": report_id }),
        ),
        "forbidden"
    );

    let _ = request_ok(&mut stdin, &mut reader, "9", "auth.logout", json!({}));
    login_admin(&mut stdin, &mut reader);

    let all = request_ok(&mut stdin, &mut reader, "10", "reports.list", json!({}));
    assert_eq!(all["reports"].as_array().map(|a| a.len()), Some(2));
    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.list",
        json!({ "memberId": asha_id }),
    );
    assert_eq!(filtered["reports"].as_array().map(|a| a.len()), Some(2));

    let stats = request_ok(&mut stdin, &mut reader, "12", "reports.stats", json!({}));
    let rows = stats["members"].as_array().cloned().unwrap_or_default();
    assert_eq!(rows.len(), 2);
    let asha = rows
        .iter()
        .find(|r| r["memberId"] == json!(asha_id))
        .expect("asha stats");
    assert_eq!(asha["total"], json!(2));
    assert_eq!(asha["counselling"], json!(1));
    assert_eq!(asha["session"], json!(1));
    let ravi = rows
        .iter()
        .find(|r| r["name"] == json!("Ravi Kulkarni"))
        .expect("ravi stats");
    assert_eq!(ravi["total"], json!(0));

    // Admins may delete any report.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "reports.delete",
        json!({ "reportId": report_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "14",
            "reports.delete",
            json!({ "reportId": report_id }),
        ),
        "not_found"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

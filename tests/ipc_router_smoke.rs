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
    let exe = env!("CARGO_BIN_EXE_tinytalkd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tinytalkd");
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("tinytalk-router-smoke");
    let bundle_out = workspace.join("smoke-backup.ttbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "displayName": "Smoke Student", "speechLevel": "non_verbal" }),
    );
    let student_id = created
        .get("result")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": student_id, "patch": { "displayName": "Updated" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.profile",
        json!({ "studentId": student_id }),
    );

    let chapter = request(
        &mut stdin,
        &mut reader,
        "7",
        "chapters.create",
        json!({ "title": "Sounds", "sortOrder": 1 }),
    );
    let chapter_id = chapter
        .get("result")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("chapterId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "8", "chapters.list", json!({}));

    let lesson = request(
        &mut stdin,
        &mut reader,
        "9",
        "lessons.create",
        json!({ "chapterId": chapter_id, "title": "Animals" }),
    );
    let lesson_id = lesson
        .get("result")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("lessonId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "lessons.list",
        json!({ "chapterId": chapter_id }),
    );

    let activity = request(
        &mut stdin,
        &mut reader,
        "11",
        "activities.create",
        json!({
            "lessonId": lesson_id,
            "activityType": "mcq",
            "layout": "choose",
            "data": { "prompt_en": "Which one barks?", "correct_key_en": "dog" }
        }),
    );
    let activity_id = activity
        .get("result")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("activityId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "activities.list",
        json!({ "lessonId": lesson_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "lesson.activities",
        json!({ "studentId": student_id, "lessonId": lesson_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "attempt.submit",
        json!({
            "studentId": student_id,
            "activityId": activity_id,
            "submission": { "choiceKey": "dog" }
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "attempts.list",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "lesson.complete",
        json!({ "studentId": student_id, "lessonId": lesson_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "dashboard.open",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "graduation.status",
        json!({ "studentId": student_id }),
    );

    let session = request(
        &mut stdin,
        &mut reader,
        "19",
        "session.create",
        json!({ "studentId": student_id, "minutes": 5 }),
    );
    let session_id = session
        .get("result")
        .and_then(|v| v.get("session"))
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "session.activate",
        json!({ "studentId": student_id, "sessionId": session_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "session.status",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "session.end",
        json!({ "studentId": student_id, "sessionId": session_id }),
    );

    let _ = request(&mut stdin, &mut reader, "23", "scoring.config.get", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "scoring.config.set",
        json!({ "passMark": 70 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "asr.transcribe",
        json!({ "audioB64": "aGVsbG8=" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "emotion.analyze",
        json!({ "imageB64": "bm90IGpzb24=" }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "activities.softDelete",
        json!({ "activityId": activity_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_methods_and_bad_json_get_stable_errors() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let payload = json!({ "id": "x1", "method": "no.such.method", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "not_implemented");

    // A line that is not JSON at all still gets an answer.
    writeln!(stdin, "this is not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "bad_json");

    // Data ops without a workspace are rejected, not crashed.
    let payload = json!({ "id": "x2", "method": "students.list", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "no_workspace");

    drop(stdin);
    let _ = child.wait();
}

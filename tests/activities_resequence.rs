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

fn seed_lesson_with_activities(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, Vec<String>) {
    let chapter = request_ok(
        stdin,
        reader,
        "s1",
        "chapters.create",
        json!({ "title": "Shapes", "sortOrder": 1 }),
    );
    let chapter_id = chapter["id"].as_str().expect("chapter id");
    let lesson = request_ok(
        stdin,
        reader,
        "s2",
        "lessons.create",
        json!({ "chapterId": chapter_id, "title": "Circles" }),
    );
    let lesson_id = lesson["id"].as_str().expect("lesson id").to_string();

    let mut ids = Vec::new();
    for (i, key) in ["red", "green", "blue"].iter().enumerate() {
        let activity = request_ok(
            stdin,
            reader,
            &format!("s3-{}", i),
            "activities.create",
            json!({
                "lessonId": lesson_id,
                "activityType": "mcq",
                "layout": "choose",
                "data": { "prompt_en": format!("Pick {}", key), "correct_key_en": key }
            }),
        );
        ids.push(activity["id"].as_str().expect("activity id").to_string());
    }
    (lesson_id, ids)
}

fn active_order(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    lesson_id: &str,
) -> Vec<(String, i64)> {
    let listed = request_ok(
        stdin,
        reader,
        id,
        "activities.list",
        json!({ "lessonId": lesson_id }),
    );
    listed["activities"]
        .as_array()
        .expect("activities")
        .iter()
        .map(|a| {
            (
                a["id"].as_str().expect("id").to_string(),
                a["sortOrder"].as_i64().expect("sortOrder"),
            )
        })
        .collect()
}

#[test]
fn soft_delete_closes_the_gap() {
    let workspace = temp_dir("tinytalk-resequence");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (lesson_id, ids) = seed_lesson_with_activities(&mut stdin, &mut reader);

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "activities.softDelete",
        json!({ "activityId": ids[1] }),
    );
    assert_eq!(deleted["ok"], true);
    assert_eq!(deleted["alreadyDeleted"], false);
    assert_eq!(deleted["resequenced"], 1);

    // Survivors pack down to 1..N with no hole where the middle one sat.
    let order = active_order(&mut stdin, &mut reader, "3", &lesson_id);
    assert_eq!(
        order,
        vec![(ids[0].clone(), 1), (ids[2].clone(), 2)]
    );

    // Deleting again reports the earlier delete instead of failing.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.softDelete",
        json!({ "activityId": ids[1] }),
    );
    assert_eq!(again["alreadyDeleted"], true);
    assert!(again.get("resequenced").is_none());

    // The full listing still shows the tombstone.
    let full = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "activities.list",
        json!({ "lessonId": lesson_id, "includeInactive": true }),
    );
    let all = full["activities"].as_array().expect("activities");
    assert_eq!(all.len(), 3);
    let tombstone = all
        .iter()
        .find(|a| a["id"] == json!(ids[1]))
        .expect("tombstone row");
    assert_eq!(tombstone["isActive"], false);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reorder_requires_the_exact_active_set() {
    let workspace = temp_dir("tinytalk-reorder");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (lesson_id, ids) = seed_lesson_with_activities(&mut stdin, &mut reader);

    // Leaving one out is rejected before anything moves.
    let short = request(
        &mut stdin,
        &mut reader,
        "2",
        "activities.reorder",
        json!({ "lessonId": lesson_id, "activityIds": [ids[2], ids[0]] }),
    );
    assert_eq!(short["error"]["code"], "bad_params");

    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "activities.reorder",
        json!({ "lessonId": lesson_id, "activityIds": [ids[0], ids[0], ids[1]] }),
    );
    assert_eq!(dup["error"]["code"], "bad_params");

    let order = active_order(&mut stdin, &mut reader, "4", &lesson_id);
    assert_eq!(order[0].0, ids[0]);

    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "activities.reorder",
        json!({ "lessonId": lesson_id, "activityIds": [ids[2], ids[0], ids[1]] }),
    );
    assert_eq!(moved["count"], 3);
    let order = active_order(&mut stdin, &mut reader, "6", &lesson_id);
    assert_eq!(
        order,
        vec![
            (ids[2].clone(), 1),
            (ids[0].clone(), 2),
            (ids[1].clone(), 3)
        ]
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn lessons_reorder_mirrors_the_activity_rules() {
    let workspace = temp_dir("tinytalk-lesson-reorder");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let chapter = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "chapters.create",
        json!({ "title": "Stories", "sortOrder": 1 }),
    );
    let chapter_id = chapter["id"].as_str().expect("chapter id").to_string();
    let mut lesson_ids = Vec::new();
    for title in ["One", "Two", "Three"] {
        let lesson = request_ok(
            &mut stdin,
            &mut reader,
            &format!("3-{}", title),
            "lessons.create",
            json!({ "chapterId": chapter_id, "title": title }),
        );
        lesson_ids.push(lesson["id"].as_str().expect("lesson id").to_string());
    }

    let wrong = request(
        &mut stdin,
        &mut reader,
        "4",
        "lessons.reorder",
        json!({ "chapterId": chapter_id, "lessonIds": [lesson_ids[0]] }),
    );
    assert_eq!(wrong["error"]["code"], "bad_params");

    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "lessons.reorder",
        json!({
            "chapterId": chapter_id,
            "lessonIds": [lesson_ids[1], lesson_ids[2], lesson_ids[0]]
        }),
    );
    assert_eq!(moved["count"], 3);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "lessons.list",
        json!({ "chapterId": chapter_id }),
    );
    let lessons = listed["lessons"].as_array().expect("lessons");
    assert_eq!(lessons[0]["id"], json!(lesson_ids[1]));
    assert_eq!(lessons[0]["sortOrder"], 1);
    assert_eq!(lessons[2]["id"], json!(lesson_ids[0]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

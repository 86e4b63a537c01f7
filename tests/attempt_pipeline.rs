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

struct World {
    student_id: String,
    lesson_id: String,
    mcq_id: String,
    asr_id: String,
}

fn seed_world(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> World {
    let student = request_ok(
        stdin,
        reader,
        "s1",
        "students.create",
        json!({ "displayName": "Ana", "speechLevel": "non_verbal" }),
    );
    let student_id = student["id"].as_str().expect("student id").to_string();

    let chapter = request_ok(
        stdin,
        reader,
        "s2",
        "chapters.create",
        json!({ "title": "First Words", "sortOrder": 1 }),
    );
    let chapter_id = chapter["id"].as_str().expect("chapter id").to_string();

    let lesson = request_ok(
        stdin,
        reader,
        "s3",
        "lessons.create",
        json!({ "chapterId": chapter_id, "title": "Animals" }),
    );
    let lesson_id = lesson["id"].as_str().expect("lesson id").to_string();

    let mcq = request_ok(
        stdin,
        reader,
        "s4",
        "activities.create",
        json!({
            "lessonId": lesson_id,
            "activityType": "mcq",
            "layout": "choose",
            "data": { "prompt_en": "Which one barks?", "correct_key_en": "dog" }
        }),
    );
    let asr = request_ok(
        stdin,
        reader,
        "s5",
        "activities.create",
        json!({
            "lessonId": lesson_id,
            "activityType": "asr",
            "layout": "sound",
            "data": { "expected_speech_en": "the dog is barking" }
        }),
    );

    World {
        student_id,
        lesson_id,
        mcq_id: mcq["id"].as_str().expect("mcq id").to_string(),
        asr_id: asr["id"].as_str().expect("asr id").to_string(),
    }
}

#[test]
fn submit_scores_records_and_completes() {
    let workspace = temp_dir("tinytalk-attempt-pipeline");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let w = seed_world(&mut stdin, &mut reader);

    // Wrong choice scores zero and does not pass.
    let miss = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attempt.submit",
        json!({
            "studentId": w.student_id,
            "activityId": w.mcq_id,
            "submission": { "choiceKey": "cat" }
        }),
    );
    assert_eq!(miss["score"], 0.0);
    assert_eq!(miss["passed"], false);
    assert_eq!(miss["inlineAchievements"], json!([]));

    // Correct choice passes and earns first_correct.
    let hit = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attempt.submit",
        json!({
            "studentId": w.student_id,
            "activityId": w.mcq_id,
            "submission": { "choiceKey": "dog" }
        }),
    );
    assert_eq!(hit["score"], 100.0);
    assert_eq!(hit["passed"], true);
    assert!(hit["attemptId"].as_str().is_some());
    assert_eq!(hit["inlineAchievements"], json!(["first_correct"]));

    // One activity still untouched: the lesson is not complete.
    let partial = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "lesson.complete",
        json!({ "studentId": w.student_id, "lessonId": w.lesson_id }),
    );
    assert_eq!(partial["completed"], false);

    // Heard text close to the expected phrase clears the speech activity.
    let spoken = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attempt.submit",
        json!({
            "studentId": w.student_id,
            "activityId": w.asr_id,
            "submission": { "heardText": "the dog is barking" }
        }),
    );
    assert_eq!(spoken["passed"], true);

    let done = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "lesson.complete",
        json!({ "studentId": w.student_id, "lessonId": w.lesson_id }),
    );
    assert_eq!(done["completed"], true);
    // The only lesson in the chapter just passed, so the chapter gate is
    // satisfied; with no next chapter there is nothing to unlock.
    assert_eq!(done["chapterCompleted"], true);
    assert_eq!(done["nextLessonId"], serde_json::Value::Null);
    assert_eq!(done["nextChapterUnlocked"], false);

    // Ledger reads newest-first and keeps every attempt, misses included.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.list",
        json!({ "studentId": w.student_id }),
    );
    let attempts = listed["attempts"].as_array().expect("attempts");
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0]["activityId"], json!(w.asr_id));
    assert_eq!(attempts[2]["score"], 0.0);

    let scoped = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attempts.list",
        json!({ "studentId": w.student_id, "activityId": w.mcq_id, "limit": 1 }),
    );
    assert_eq!(scoped["attempts"].as_array().expect("attempts").len(), 1);
    assert_eq!(scoped["attempts"][0]["score"], 100.0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn skip_records_a_zero_score_attempt() {
    let workspace = temp_dir("tinytalk-attempt-skip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let w = seed_world(&mut stdin, &mut reader);

    let skipped = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attempt.submit",
        json!({
            "studentId": w.student_id,
            "activityId": w.mcq_id,
            "submission": { "action": "skip" }
        }),
    );
    assert_eq!(skipped["score"], 0.0);
    assert_eq!(skipped["passed"], false);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attempts.list",
        json!({ "studentId": w.student_id }),
    );
    let attempts = listed["attempts"].as_array().expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["meta"]["skipped"], true);
    assert_eq!(attempts[0]["meta"]["action"], "skip");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn base64_audio_rides_the_builtin_transcriber() {
    let workspace = temp_dir("tinytalk-attempt-audio");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let w = seed_world(&mut stdin, &mut reader);

    // "the dog is barking" in base64; the built-in transcriber echoes it.
    let spoken = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attempt.submit",
        json!({
            "studentId": w.student_id,
            "activityId": w.asr_id,
            "submission": { "audioB64": "dGhlIGRvZyBpcyBiYXJraW5n" }
        }),
    );
    assert_eq!(spoken["passed"], true);

    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "attempt.submit",
        json!({
            "studentId": w.student_id,
            "activityId": w.asr_id,
            "submission": { "audioB64": "%%%" }
        }),
    );
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

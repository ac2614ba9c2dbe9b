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
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct School {
    exam_id: i64,
    class_east: i64,
    alice: i64,
    bob: i64,
    math: i64,
    english: i64,
}

fn setup_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let seeded = request_ok(stdin, reader, "s1", "grading.seedDefault", json!({}));
    let system_id = seeded["systemId"].as_i64().expect("systemId");
    let class_east = request_ok(
        stdin,
        reader,
        "s2",
        "classes.upsert",
        json!({ "name": "Form 4", "stream": "East" }),
    )["classId"]
        .as_i64()
        .expect("classId");
    let math = request_ok(
        stdin,
        reader,
        "s3",
        "subjects.upsert",
        json!({ "name": "Mathematics", "code": "MAT" }),
    )["subjectId"]
        .as_i64()
        .expect("subjectId");
    let english = request_ok(
        stdin,
        reader,
        "s4",
        "subjects.upsert",
        json!({ "name": "English", "code": "ENG" }),
    )["subjectId"]
        .as_i64()
        .expect("subjectId");
    request_ok(
        stdin,
        reader,
        "s5",
        "classSubjects.set",
        json!({ "classId": class_east, "subjectIds": [math, english] }),
    );
    let bob = request_ok(
        stdin,
        reader,
        "s6",
        "students.upsert",
        json!({ "fullName": "Bob Otieno", "admissionNumber": "1002", "classId": class_east }),
    )["studentId"]
        .as_i64()
        .expect("studentId");
    let alice = request_ok(
        stdin,
        reader,
        "s7",
        "students.upsert",
        json!({ "fullName": "Alice Wanjiku", "admissionNumber": "1001", "classId": class_east }),
    )["studentId"]
        .as_i64()
        .expect("studentId");
    let exam_id = request_ok(
        stdin,
        reader,
        "s8",
        "exams.upsert",
        json!({ "name": "Term 1 Opener", "gradeSystemId": system_id }),
    )["examId"]
        .as_i64()
        .expect("examId");
    School {
        exam_id,
        class_east,
        alice,
        bob,
        math,
        english,
    }
}

fn cell<'a>(cells: &'a serde_json::Value, student_id: i64, subject_id: i64) -> Option<&'a serde_json::Value> {
    cells.as_array().and_then(|cells| {
        cells.iter().find(|c| {
            c["studentId"].as_i64() == Some(student_id) && c["subjectId"].as_i64() == Some(subject_id)
        })
    })
}

#[test]
fn save_creates_then_updates_and_deletes() {
    let workspace = temp_dir("resultsd-matrix-save");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup_school(&mut stdin, &mut reader);

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "matrix.open",
        json!({ "examId": s.exam_id, "level": "Form 4", "classId": s.class_east }),
    );
    let names: Vec<&str> = opened["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|v| v["fullName"].as_str())
        .collect();
    assert_eq!(names, vec!["Alice Wanjiku", "Bob Otieno"]);
    assert_eq!(opened["subjects"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(opened["cells"].as_array().map(|a| a.len()), Some(0));

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "85" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "matrix.setScore",
        json!({ "studentId": s.bob, "subjectId": s.math, "value": 62 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "matrix.setScore",
        json!({ "studentId": s.bob, "subjectId": s.english, "value": "" }),
    );

    let saved = request_ok(&mut stdin, &mut reader, "6", "matrix.save", json!({}));
    assert_eq!(saved["created"].as_u64(), Some(2));
    assert_eq!(saved["skipped"].as_u64(), Some(1));
    assert_eq!(saved["failures"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(saved["report"]["applied"].as_u64(), Some(2));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.list",
        json!({ "examId": s.exam_id }),
    );
    let rows = listed["results"].as_array().expect("results");
    assert_eq!(rows.len(), 2);
    let alice_row = rows
        .iter()
        .find(|r| r["studentId"].as_i64() == Some(s.alice))
        .expect("alice row");
    assert_eq!(alice_row["grade"].as_str(), Some("A"));
    assert_eq!(alice_row["formLevel"].as_str(), Some("Form 4"));
    assert_eq!(alice_row["classStream"].as_str(), Some("East"));
    let alice_id = alice_row["id"].as_i64().expect("id");

    let got = request_ok(&mut stdin, &mut reader, "8", "matrix.get", json!({}));
    let alice_cell = cell(&got["cells"], s.alice, s.math).expect("alice cell");
    assert_eq!(alice_cell["persistedId"].as_i64(), Some(alice_id));
    assert_eq!(alice_cell["saved"].as_bool(), Some(true));

    // Blanking a saved cell deletes exactly that row.
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "matrix.setScore",
        json!({ "studentId": s.bob, "subjectId": s.math, "value": "71" }),
    );
    let plan = request_ok(&mut stdin, &mut reader, "11", "matrix.plan", json!({}));
    let ops = plan["plan"]["ops"].as_array().expect("ops");
    let delete = ops
        .iter()
        .find(|op| op["kind"].as_str() == Some("delete"))
        .expect("delete op");
    assert_eq!(delete["persistedId"].as_i64(), Some(alice_id));

    let saved = request_ok(&mut stdin, &mut reader, "12", "matrix.save", json!({}));
    assert_eq!(saved["deleted"].as_u64(), Some(1));
    assert_eq!(saved["updated"].as_u64(), Some(1));

    let got = request_ok(&mut stdin, &mut reader, "13", "matrix.get", json!({}));
    let alice_cell = cell(&got["cells"], s.alice, s.math).expect("alice cell");
    assert!(alice_cell["persistedId"].is_null());
    assert_eq!(alice_cell["score"].as_str(), Some(""));
    let bob_cell = cell(&got["cells"], s.bob, s.math).expect("bob cell");
    assert_eq!(bob_cell["grade"].as_str(), Some("B+"));

    // Nothing blank and unsaved ever reaches the store.
    let again = request_ok(&mut stdin, &mut reader, "14", "matrix.save", json!({}));
    assert_eq!(again["created"].as_u64(), Some(0));
    assert_eq!(again["deleted"].as_u64(), Some(0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "results.list",
        json!({ "examId": s.exam_id }),
    );
    let rows = listed["results"].as_array().expect("results");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["score"].as_f64(), Some(71.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn partial_failure_keeps_the_failed_cell_unsaved() {
    let workspace = temp_dir("resultsd-matrix-partial");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup_school(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "matrix.open",
        json!({ "examId": s.exam_id, "classId": s.class_east.to_string() }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "55" }),
    );
    // No such student; the store rejects this one row.
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "matrix.setScore",
        json!({ "studentId": 9999, "subjectId": s.math, "value": "65" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "matrix.setScore",
        json!({ "studentId": s.bob, "subjectId": s.english, "value": "75" }),
    );

    let saved = request_ok(&mut stdin, &mut reader, "6", "matrix.save", json!({}));
    assert_eq!(saved["succeeded"].as_u64(), Some(2));
    let failures = saved["failures"].as_array().expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["studentId"].as_i64(), Some(9999));
    assert_eq!(failures[0]["action"].as_str(), Some("create"));
    assert_eq!(failures[0]["code"].as_str(), Some("db_insert_failed"));

    let got = request_ok(&mut stdin, &mut reader, "7", "matrix.get", json!({}));
    let failed = cell(&got["cells"], 9999, s.math).expect("failed cell");
    assert_eq!(failed["score"].as_str(), Some("65"));
    assert_eq!(failed["saved"].as_bool(), Some(false));
    assert_eq!(
        cell(&got["cells"], s.bob, s.english).and_then(|c| c["saved"].as_bool()),
        Some(true)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_scores_are_reported_not_saved() {
    let workspace = temp_dir("resultsd-matrix-malformed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup_school(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "matrix.open",
        json!({ "examId": s.exam_id, "classId": s.class_east }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "8o" }),
    );

    let saved = request_ok(&mut stdin, &mut reader, "4", "matrix.save", json!({}));
    assert_eq!(saved["created"].as_u64(), Some(0));
    let warnings = saved["warnings"].as_array().expect("warnings");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0]["raw"].as_str(), Some("8o"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reconcile_from_a_reloaded_matrix_is_dropped() {
    let workspace = temp_dir("resultsd-matrix-stale");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup_school(&mut stdin, &mut reader);
    let open = json!({ "examId": s.exam_id, "level": "Form 4", "classId": "all" });
    request_ok(&mut stdin, &mut reader, "2", "matrix.open", open.clone());
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "50" }),
    );
    let plan = request_ok(&mut stdin, &mut reader, "4", "matrix.plan", json!({}));
    let generation = plan["plan"]["generation"].as_u64().expect("generation");

    let reopened = request_ok(&mut stdin, &mut reader, "5", "matrix.open", open);
    assert_eq!(reopened["generation"].as_u64(), Some(generation + 1));
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "70" }),
    );

    let reconciled = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "matrix.reconcile",
        json!({
            "generation": generation,
            "outcomes": [
                { "studentId": s.alice, "subjectId": s.math, "outcome": "created", "newId": 42 }
            ],
        }),
    );
    assert_eq!(reconciled["report"]["droppedStale"].as_u64(), Some(1));
    assert_eq!(reconciled["report"]["applied"].as_u64(), Some(0));

    let got = request_ok(&mut stdin, &mut reader, "8", "matrix.get", json!({}));
    let c = cell(&got["cells"], s.alice, s.math).expect("cell");
    assert!(c["persistedId"].is_null());
    assert_eq!(c["score"].as_str(), Some("70"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn locked_exam_is_read_only() {
    let workspace = temp_dir("resultsd-matrix-locked");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup_school(&mut stdin, &mut reader);

    let no_matrix = request(&mut stdin, &mut reader, "2", "matrix.get", json!({}));
    assert_eq!(error_code(&no_matrix), "no_matrix");

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exams.upsert",
        json!({ "id": s.exam_id, "name": "Term 1 Opener", "isActive": false }),
    );
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "matrix.open",
        json!({ "examId": s.exam_id, "classId": s.class_east }),
    );
    assert_eq!(opened["locked"].as_bool(), Some(true));

    let set = request(
        &mut stdin,
        &mut reader,
        "5",
        "matrix.setScore",
        json!({ "studentId": s.alice, "subjectId": s.math, "value": "90" }),
    );
    assert_eq!(error_code(&set), "exam_locked");
    let save = request(&mut stdin, &mut reader, "6", "matrix.save", json!({}));
    assert_eq!(error_code(&save), "exam_locked");
    request_ok(&mut stdin, &mut reader, "7", "matrix.get", json!({}));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn single_and_per_student_deletes() {
    let workspace = temp_dir("resultsd-matrix-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup_school(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "matrix.open",
        json!({ "examId": s.exam_id, "classId": s.class_east }),
    );
    for (i, (student, subject, value)) in [
        (s.alice, s.math, "81"),
        (s.alice, s.english, "64"),
        (s.bob, s.math, "47"),
        (s.bob, s.english, "52"),
    ]
    .into_iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("set-{}", i),
            "matrix.setScore",
            json!({ "studentId": student, "subjectId": subject, "value": value }),
        );
    }
    request_ok(&mut stdin, &mut reader, "3", "matrix.save", json!({}));

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "matrix.deleteEntry",
        json!({ "studentId": s.alice, "subjectId": s.math }),
    );
    assert!(removed["deletedId"].as_i64().is_some());
    let again = request(
        &mut stdin,
        &mut reader,
        "5",
        "matrix.deleteEntry",
        json!({ "studentId": s.alice, "subjectId": s.math }),
    );
    assert_eq!(error_code(&again), "not_found");

    let wiped = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.deleteStudent",
        json!({ "examId": s.exam_id, "studentId": s.bob }),
    );
    assert_eq!(wiped["deleted"].as_u64(), Some(2));
    let none_left = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.deleteStudent",
        json!({ "examId": s.exam_id, "studentId": s.bob }),
    );
    assert_eq!(none_left["deleted"].as_u64(), Some(0));
    assert!(none_left["warning"].is_string());

    let got = request_ok(&mut stdin, &mut reader, "8", "matrix.get", json!({}));
    assert!(cell(&got["cells"], s.bob, s.math).is_none());
    assert!(cell(&got["cells"], s.alice, s.math).is_none());

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.list",
        json!({ "examId": s.exam_id }),
    );
    let rows = listed["results"].as_array().expect("results");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["subjectId"].as_i64(), Some(s.english));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

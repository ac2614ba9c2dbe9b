use crate::ipc::error::{err, ok, repo_err};
use crate::ipc::helpers::{db_conn, load_exam, required_id};
use crate::ipc::types::{AppState, Request};
use crate::repo::{ResultsRepository, SqliteResults};
use serde_json::json;
use tracing::warn;

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match SqliteResults::new(conn).list(exam_id) {
        Ok(rows) => ok(&req.id, json!({ "results": rows })),
        Err(e) => repo_err(&req.id, &e),
    }
}

/// Deletes every stored result of one student in one exam. Each delete is
/// independent; failures are reported, not rolled back.
fn handle_results_delete_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match load_exam(conn, req, exam_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if exam.is_locked() {
        return err(
            &req.id,
            "exam_locked",
            "results entry is locked for this exam",
            Some(json!({ "examId": exam_id })),
        );
    }

    let mut repo = SqliteResults::new(conn);
    let rows = match repo.list(exam_id) {
        Ok(rows) => rows,
        Err(e) => return repo_err(&req.id, &e),
    };
    let targets: Vec<(i64, i64)> = rows
        .iter()
        .filter(|r| r.student_id == student_id)
        .map(|r| (r.id, r.subject_id))
        .collect();
    if targets.is_empty() {
        return ok(
            &req.id,
            json!({ "deleted": 0, "failures": [], "warning": "no results found to delete" }),
        );
    }

    let mut deleted_subjects = Vec::new();
    let mut failures = Vec::new();
    for (result_id, subject_id) in &targets {
        match repo.delete(*result_id) {
            Ok(()) => deleted_subjects.push(*subject_id),
            Err(e) => {
                warn!(result_id, error = %e, "result delete failed");
                failures.push(json!({
                    "resultId": result_id,
                    "subjectId": subject_id,
                    "code": e.code(),
                    "message": e.to_string(),
                }));
            }
        }
    }

    // Cells in the open matrix must not keep ids that no longer exist.
    let matrix_open_on_exam = state
        .session
        .as_ref()
        .map(|s| s.exam.id == exam_id)
        .unwrap_or(false);
    if matrix_open_on_exam {
        for subject_id in &deleted_subjects {
            state.matrix.clear_entry(student_id, *subject_id);
        }
    }

    ok(
        &req.id,
        json!({
            "deleted": deleted_subjects.len(),
            "failures": failures,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.list" => Some(handle_results_list(state, req)),
        "results.deleteStudent" => Some(handle_results_delete_student(state, req)),
        _ => None,
    }
}

use crate::db;
use crate::grading;
use crate::ipc::error::{db_err, err, ok, repo_err};
use crate::ipc::helpers::{db_conn, load_exam, load_systems, optional_str, parse_id, required_id};
use crate::ipc::types::{AppState, ClassScope, MatrixSession, Request};
use crate::matrix::{self, CellOutcome, ExamScope};
use crate::model::{GradingSystem, Student, Subject};
use crate::repo::{ResultsRepository, SqliteResults};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info};

fn parse_class_scope(req: &Request) -> Result<ClassScope, serde_json::Value> {
    match req.params.get("classId") {
        Some(serde_json::Value::String(s)) if s.trim().eq_ignore_ascii_case("all") => {
            Ok(ClassScope::AllStreams)
        }
        v => match parse_id(v) {
            Ok(Some(id)) => Ok(ClassScope::Class(id)),
            Ok(None) => Err(err(&req.id, "bad_params", "missing classId", None)),
            Err(()) => Err(err(
                &req.id,
                "bad_params",
                "classId must be an integer id or \"all\"",
                None,
            )),
        },
    }
}

fn session_guard<'a>(state: &'a AppState, req: &Request) -> Result<&'a MatrixSession, serde_json::Value> {
    match state.session.as_ref() {
        Some(s) if state.matrix.is_loaded() => Ok(s),
        _ => Err(err(&req.id, "no_matrix", "open a results matrix first", None)),
    }
}

fn writable_guard<'a>(state: &'a AppState, req: &Request) -> Result<&'a MatrixSession, serde_json::Value> {
    let session = session_guard(state, req)?;
    if session.exam.is_locked() {
        return Err(err(
            &req.id,
            "exam_locked",
            "results entry is locked for this exam",
            Some(json!({ "examId": session.exam.id })),
        ));
    }
    Ok(session)
}

fn cells_json(state: &AppState, systems: &[GradingSystem]) -> Vec<serde_json::Value> {
    let system_id = state.matrix.scope().and_then(|s| s.grade_system_id);
    state
        .matrix
        .cells()
        .map(|(&(student_id, subject_id), entry)| {
            json!({
                "studentId": student_id,
                "subjectId": subject_id,
                "score": entry.score,
                "persistedId": entry.persisted_id,
                "saved": entry.is_saved(),
                "grade": grading::resolve_optional(matrix::parse_score(&entry.score), systems, system_id),
            })
        })
        .collect()
}

/// Opens the grid for one exam and class scope. Any previous grid is
/// replaced and its in-flight plans become stale.
fn handle_matrix_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = optional_str(req, "level");
    let class_scope = match parse_class_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if class_scope == ClassScope::AllStreams && level.is_none() {
        return err(&req.id, "bad_params", "level is required when classId is \"all\"", None);
    }

    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match load_exam(conn, req, exam_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classes = match db::list_classes(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    let in_scope: HashSet<i64> = match class_scope {
        ClassScope::Class(class_id) => {
            if !classes.iter().any(|c| c.id == class_id) {
                return err(&req.id, "not_found", "class not found", Some(json!({ "classId": class_id })));
            }
            HashSet::from([class_id])
        }
        ClassScope::AllStreams => classes
            .iter()
            .filter(|c| Some(c.name.as_str()) == level.as_deref())
            .map(|c| c.id)
            .collect(),
    };

    let mut roster: Vec<Student> = match db::list_students(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    roster.retain(|s| s.class_id.map_or(false, |c| in_scope.contains(&c)));
    let mut seen = HashSet::new();
    roster.retain(|s| seen.insert(s.id));
    roster.sort_by(Student::cmp_by_name);
    let student_ids: HashSet<i64> = roster.iter().map(|s| s.id).collect();

    let all_subjects = match db::list_subjects(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    let subjects: Vec<Subject> = match class_scope {
        ClassScope::Class(class_id) => {
            let assigned = match db::class_subject_ids(conn, class_id) {
                Ok(v) => v,
                Err(e) => return db_err(&req.id, e),
            };
            if assigned.is_empty() {
                debug!(class_id, "no subjects assigned; showing all");
                all_subjects
            } else {
                all_subjects
                    .into_iter()
                    .filter(|s| assigned.contains(&s.id))
                    .collect()
            }
        }
        ClassScope::AllStreams => all_subjects,
    };

    let rows = match SqliteResults::new(conn).list(exam_id) {
        Ok(rows) => rows,
        Err(e) => return repo_err(&req.id, &e),
    };
    let rows: Vec<_> = rows
        .into_iter()
        .filter(|r| student_ids.contains(&r.student_id))
        .collect();
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    state.matrix.load(
        ExamScope {
            exam_id,
            grade_system_id: exam.grade_system_id,
        },
        &rows,
    );
    state.session = Some(MatrixSession {
        exam: exam.clone(),
        level,
        class_scope,
        student_ids: roster.iter().map(|s| s.id).collect(),
        subject_ids: subjects.iter().map(|s| s.id).collect(),
    });

    ok(
        &req.id,
        json!({
            "generation": state.matrix.generation(),
            "exam": exam,
            "locked": exam.is_locked(),
            "students": roster,
            "subjects": subjects,
            "cells": cells_json(state, &systems),
        }),
    )
}

fn handle_matrix_set_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = writable_guard(state, req) {
        return e;
    }
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_id(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = match req.params.get("value") {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(_) => return err(&req.id, "bad_params", "value must be a string or number", None),
    };

    state.matrix.set_score(student_id, subject_id, &value);
    let entry = state.matrix.cell(student_id, subject_id).cloned().unwrap_or_default();
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "score": entry.score,
            "persistedId": entry.persisted_id,
            "parsed": matrix::parse_score(&entry.score),
        }),
    )
}

fn handle_matrix_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match session_guard(state, req) {
        Ok(v) => v.clone(),
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match session.class_scope {
        ClassScope::Class(id) => json!(id),
        ClassScope::AllStreams => json!("all"),
    };
    ok(
        &req.id,
        json!({
            "generation": state.matrix.generation(),
            "examId": session.exam.id,
            "locked": session.exam.is_locked(),
            "level": session.level,
            "classId": class_id,
            "studentIds": session.student_ids,
            "subjectIds": session.subject_ids,
            "cells": cells_json(state, &systems),
        }),
    )
}

fn handle_matrix_plan(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = session_guard(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let plan = state.matrix.commit(&systems);
    ok(&req.id, json!({ "plan": plan }))
}

fn handle_matrix_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(generation) = req.params.get("generation").and_then(|v| v.as_u64()) else {
        return err(&req.id, "bad_params", "missing generation", None);
    };
    let outcomes: Vec<CellOutcome> = match req.params.get("outcomes") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(o) => o,
            Err(e) => return err(&req.id, "bad_params", format!("invalid outcomes: {}", e), None),
        },
        None => return err(&req.id, "bad_params", "missing outcomes", None),
    };

    let report = state.matrix.reconcile(generation, &outcomes);
    ok(
        &req.id,
        json!({
            "generation": state.matrix.generation(),
            "report": report,
        }),
    )
}

/// Plans, executes every operation independently and reconciles the ones
/// that succeeded. Failed cells keep their unsaved value for a retry.
fn handle_matrix_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = writable_guard(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let plan = state.matrix.commit(&systems);
    let batch = matrix::execute_plan(&mut SqliteResults::new(conn), &plan);
    let report = state.matrix.reconcile(plan.generation, &batch.outcomes);

    info!(
        batch_id = %batch.batch_id,
        succeeded = batch.outcomes.len(),
        failed = batch.failures.len(),
        "matrix saved"
    );
    ok(
        &req.id,
        json!({
            "batchId": batch.batch_id,
            "generation": plan.generation,
            "created": plan.count("create"),
            "updated": plan.count("update"),
            "deleted": plan.count("delete"),
            "skipped": plan.skipped,
            "warnings": plan.warnings,
            "succeeded": batch.outcomes.len(),
            "failures": batch.failures,
            "report": report,
        }),
    )
}

fn handle_matrix_delete_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = writable_guard(state, req) {
        return e;
    }
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_id(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(persisted_id) = state
        .matrix
        .cell(student_id, subject_id)
        .and_then(|c| c.persisted_id)
    else {
        return err(
            &req.id,
            "not_found",
            "cell has no saved result",
            Some(json!({ "studentId": student_id, "subjectId": subject_id })),
        );
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = SqliteResults::new(conn).delete(persisted_id) {
        return repo_err(&req.id, &e);
    }
    state.matrix.clear_entry(student_id, subject_id);
    ok(&req.id, json!({ "deletedId": persisted_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "matrix.open" => Some(handle_matrix_open(state, req)),
        "matrix.setScore" => Some(handle_matrix_set_score(state, req)),
        "matrix.get" => Some(handle_matrix_get(state, req)),
        "matrix.plan" => Some(handle_matrix_plan(state, req)),
        "matrix.reconcile" => Some(handle_matrix_reconcile(state, req)),
        "matrix.save" => Some(handle_matrix_save(state, req)),
        "matrix.deleteEntry" => Some(handle_matrix_delete_entry(state, req)),
        _ => None,
    }
}

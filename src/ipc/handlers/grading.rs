use crate::db;
use crate::grading;
use crate::ipc::error::{db_err, err, ok};
use crate::ipc::helpers::{
    db_conn, load_systems, optional_id, optional_str, required_f64, required_id, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::model::GradeBoundary;
use serde_json::json;
use tracing::{info, warn};

fn handle_systems_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_systems(conn, req) {
        Ok(systems) => ok(&req.id, json!({ "systems": systems })),
        Err(e) => e,
    }
}

fn handle_systems_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = match optional_id(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = optional_str(req, "description");
    let is_default = req
        .params
        .get("isDefault")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    match db::upsert_grading_system(conn, id, &name, description.as_deref(), is_default) {
        Ok(system_id) => ok(&req.id, json!({ "systemId": system_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "grade_systems" }))),
    }
}

fn handle_systems_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = match required_id(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::delete_grading_system(conn, id) {
        Ok(true) => ok(&req.id, json!({ "deleted": true })),
        Ok(false) => err(&req.id, "not_found", "grading system not found", Some(json!({ "id": id }))),
        Err(e) => db_err(&req.id, e),
    }
}

fn handle_boundaries_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = match optional_id(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let system_id = match required_id(req, "systemId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match required_str(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let min_score = match required_f64(req, "minScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_score = match required_f64(req, "maxScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Overlaps and gaps are allowed; the resolver has a rule for both.
    if min_score > max_score {
        return err(
            &req.id,
            "bad_params",
            "minScore must not exceed maxScore",
            Some(json!({ "minScore": min_score, "maxScore": max_score })),
        );
    }
    let boundary = GradeBoundary {
        id: id.unwrap_or(0),
        system_id,
        grade,
        min_score,
        max_score,
        points: req.params.get("points").and_then(|v| v.as_f64()).unwrap_or(0.0),
        remark: optional_str(req, "remark"),
    };

    match db::upsert_boundary(conn, &boundary, id) {
        Ok(boundary_id) => ok(&req.id, json!({ "boundaryId": boundary_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "grade_boundaries" }))),
    }
}

fn handle_boundaries_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = match required_id(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::delete_boundary(conn, id) {
        Ok(true) => ok(&req.id, json!({ "deleted": true })),
        Ok(false) => err(&req.id, "not_found", "boundary not found", Some(json!({ "id": id }))),
        Err(e) => db_err(&req.id, e),
    }
}

fn handle_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let system_id = match optional_id(req, "systemId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let score = match req.params.get("score") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => return err(&req.id, "bad_params", "score must be a number or null", None),
        },
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let selected = grading::select_system(&systems, system_id).map(|s| s.id);
    ok(
        &req.id,
        json!({
            "grade": grading::resolve_optional(score, &systems, system_id),
            "systemId": selected,
        }),
    )
}

fn handle_seed_default(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::seed_default_grading(conn) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "systemId": summary.system_id,
                "createdSystem": summary.created_system,
                "boundariesCreated": summary.boundaries_created,
            }),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

/// Re-resolves the stored grade of every result against its exam's system.
fn handle_recalculate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match optional_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report = match db::regrade_results(conn, exam_id, &systems) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    for (result_id, message) in &report.failures {
        warn!(result_id, error = %message, "grade rewrite failed");
    }
    info!(
        checked = report.checked,
        changed = report.changes.len(),
        failed = report.failures.len(),
        "grades recalculated"
    );

    let changes: Vec<serde_json::Value> = report
        .changes
        .iter()
        .map(|c| {
            json!({
                "resultId": c.result_id,
                "score": c.score,
                "from": c.from,
                "to": c.to,
            })
        })
        .collect();
    let failures: Vec<serde_json::Value> = report
        .failures
        .iter()
        .map(|(result_id, message)| {
            json!({ "resultId": result_id, "code": "db_insert_failed", "message": message })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "checked": report.checked,
            "updated": changes.len(),
            "changes": changes,
            "failures": failures,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.systems.list" => Some(handle_systems_list(state, req)),
        "grading.systems.upsert" => Some(handle_systems_upsert(state, req)),
        "grading.systems.delete" => Some(handle_systems_delete(state, req)),
        "grading.boundaries.upsert" => Some(handle_boundaries_upsert(state, req)),
        "grading.boundaries.delete" => Some(handle_boundaries_delete(state, req)),
        "grading.resolve" => Some(handle_resolve(state, req)),
        "grading.seedDefault" => Some(handle_seed_default(state, req)),
        "grading.recalculate" => Some(handle_recalculate(state, req)),
        _ => None,
    }
}

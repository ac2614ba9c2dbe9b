use crate::db;
use crate::ipc::error::{db_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_id, optional_str, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_classes_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let stream = optional_str(req, "stream").unwrap_or_else(|| "General".to_string());

    match db::upsert_class(conn, id, &name, &stream) {
        Ok(class_id) => ok(&req.id, json!({ "classId": class_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "classes" }))),
    }
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classes = match db::list_classes(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    // Distinct levels in first-seen order, for level pickers.
    let mut levels: Vec<&str> = Vec::new();
    for c in &classes {
        if !levels.contains(&c.name.as_str()) {
            levels.push(&c.name);
        }
    }
    ok(&req.id, json!({ "classes": classes, "levels": levels }))
}

fn handle_subjects_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let code = optional_str(req, "code").unwrap_or_default();
    let short_name = optional_str(req, "shortName");

    match db::upsert_subject(conn, id, &name, &code, short_name.as_deref()) {
        Ok(subject_id) => ok(&req.id, json!({ "subjectId": subject_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "subjects" }))),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::list_subjects(conn) {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => db_err(&req.id, e),
    }
}

fn handle_class_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_id(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("subjectIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing subjectIds", None);
    };
    let mut subject_ids = Vec::with_capacity(raw.len());
    for v in raw {
        let Some(id) = v.as_i64() else {
            return err(&req.id, "bad_params", "subjectIds must contain only integers", None);
        };
        subject_ids.push(id);
    }

    match db::set_class_subjects(conn, class_id, &subject_ids) {
        Ok(count) => ok(&req.id, json!({ "classId": class_id, "assigned": count })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "class_subjects" }))),
    }
}

fn handle_students_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = match optional_id(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let full_name = match required_str(req, "fullName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission_number = optional_str(req, "admissionNumber").unwrap_or_else(|| "N/A".to_string());
    let class_id = match optional_id(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match db::upsert_student(conn, id, &full_name, &admission_number, class_id) {
        Ok(student_id) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "students" }))),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::list_students(conn) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => db_err(&req.id, e),
    }
}

fn handle_exams_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let grade_system_id = match optional_id(req, "gradeSystemId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let is_active = req
        .params
        .get("isActive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    match db::upsert_exam(conn, id, &name, grade_system_id, is_active) {
        Ok(exam_id) => ok(&req.id, json!({ "examId": exam_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), Some(json!({ "table": "exams" }))),
    }
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::list_exams(conn) {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => db_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.upsert" => Some(handle_classes_upsert(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "subjects.upsert" => Some(handle_subjects_upsert(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "classSubjects.set" => Some(handle_class_subjects_set(state, req)),
        "students.upsert" => Some(handle_students_upsert(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "exams.upsert" => Some(handle_exams_upsert(state, req)),
        "exams.list" => Some(handle_exams_list(state, req)),
        _ => None,
    }
}

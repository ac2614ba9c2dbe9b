use crate::broadsheet::{self, GroupBy};
use crate::db;
use crate::grading;
use crate::ipc::error::{db_err, err, ok, repo_err};
use crate::ipc::helpers::{db_conn, load_exam, load_systems, optional_str, parse_id, required_id};
use crate::ipc::types::{AppState, Request};
use crate::model::Subject;
use crate::ranking::{self, RankingFilter};
use crate::repo::{ResultsRepository, SqliteResults};
use serde_json::json;

fn parse_ranking_filter(req: &Request) -> Result<RankingFilter, serde_json::Value> {
    let Some(filter) = req.params.get("filter").filter(|v| !v.is_null()) else {
        return Ok(RankingFilter::default());
    };
    if !filter.is_object() {
        return Err(err(&req.id, "bad_params", "filter must be an object", None));
    }
    let class_id = parse_id(filter.get("classId")).map_err(|_| {
        err(
            &req.id,
            "bad_params",
            "filter.classId must be an integer id",
            Some(json!({ "classId": filter.get("classId") })),
        )
    })?;
    Ok(RankingFilter {
        level: filter
            .get("level")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        class_id,
    })
}

fn subject_column(s: &Subject) -> serde_json::Value {
    json!({ "id": s.id, "abbr": s.abbreviation(), "name": s.name })
}

fn handle_ranking_aggregate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filter = match parse_ranking_filter(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match load_exam(conn, req, exam_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects = match db::list_subjects(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    let rows = match SqliteResults::new(conn).list(exam_id) {
        Ok(v) => v,
        Err(e) => return repo_err(&req.id, &e),
    };

    let groups = ranking::aggregate(&rows, &systems, exam.grade_system_id, &filter);
    let out: Vec<serde_json::Value> = groups
        .iter()
        .map(|(label, students)| {
            let means: Vec<f64> = students.iter().map(|s| s.mean).collect();
            let columns: Vec<serde_json::Value> = ranking::subject_columns(students, &subjects)
                .into_iter()
                .map(subject_column)
                .collect();
            let ranked: Vec<serde_json::Value> = students
                .iter()
                .enumerate()
                .map(|(idx, s)| {
                    let mut v = json!(s);
                    v["rank"] = json!(idx + 1);
                    v["meanScore"] = json!(grading::round_1dp(s.mean));
                    v
                })
                .collect();
            json!({
                "label": label,
                "candidates": students.len(),
                "meanGrade": grading::mean_grade(&means, &systems, exam.grade_system_id),
                "subjects": columns,
                "students": ranked,
            })
        })
        .collect();

    ok(&req.id, json!({ "examId": exam_id, "groups": out }))
}

fn handle_broadsheet_project(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = optional_str(req, "level");
    let group_by: GroupBy = match req.params.get("groupBy") {
        None | Some(serde_json::Value::Null) => GroupBy::default(),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(g) => g,
            Err(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "groupBy must be STREAM or ENTIRE_CLASS",
                    Some(json!({ "groupBy": v })),
                )
            }
        },
    };
    let exam = match load_exam(conn, req, exam_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let systems = match load_systems(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let students = match db::list_students(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    let classes = match db::list_classes(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    let subjects = match db::list_subjects(conn) {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, e),
    };
    let rows = match SqliteResults::new(conn).list(exam_id) {
        Ok(v) => v,
        Err(e) => return repo_err(&req.id, &e),
    };

    let projected = broadsheet::project(
        &students,
        &classes,
        &rows,
        &systems,
        exam.grade_system_id,
        level.as_deref(),
        group_by,
    );
    let out: Vec<serde_json::Value> = projected
        .iter()
        .enumerate()
        .map(|(idx, r)| {
            let mut v = json!(r);
            v["rank"] = json!(idx + 1);
            v["totalDisplay"] = json!(r.total.round());
            v["avgDisplay"] = json!(grading::round_1dp(r.avg));
            v
        })
        .collect();

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "groupBy": group_by,
            "showStream": group_by.shows_stream(),
            "subjects": subjects.iter().map(subject_column).collect::<Vec<_>>(),
            "rows": out,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ranking.aggregate" => Some(handle_ranking_aggregate(state, req)),
        "broadsheet.project" => Some(handle_broadsheet_project(state, req)),
        _ => None,
    }
}

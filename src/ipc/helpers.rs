use crate::db;
use crate::ipc::error::{db_err, err};
use crate::ipc::types::{AppState, Request};
use crate::model::{Exam, GradingSystem};
use rusqlite::Connection;
use serde_json::Value;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Reads an id that may arrive as a number or a numeric string. Null,
/// missing and blank strings are "no id".
pub fn parse_id(v: Option<&Value>) -> Result<Option<i64>, ()> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Some(i)),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Some(f as i64)),
                _ => Err(()),
            },
        },
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                t.parse::<i64>().map(Some).map_err(|_| ())
            }
        }
        Some(_) => Err(()),
    }
}

pub fn optional_id(req: &Request, key: &str) -> Result<Option<i64>, Value> {
    parse_id(req.params.get(key)).map_err(|_| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an integer id", key),
            Some(serde_json::json!({ key: req.params.get(key) })),
        )
    })
}

pub fn required_id(req: &Request, key: &str) -> Result<i64, Value> {
    match optional_id(req, key)? {
        Some(v) => Ok(v),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("{} must be a number", key), None))
}

pub fn load_systems(conn: &Connection, req: &Request) -> Result<Vec<GradingSystem>, Value> {
    db::list_grading_systems(conn).map_err(|e| db_err(&req.id, e))
}

pub fn load_exam(conn: &Connection, req: &Request, exam_id: i64) -> Result<Exam, Value> {
    match db::get_exam(conn, exam_id) {
        Ok(Some(exam)) => Ok(exam),
        Ok(None) => Err(err(
            &req.id,
            "not_found",
            "exam not found",
            Some(serde_json::json!({ "examId": exam_id })),
        )),
        Err(e) => Err(db_err(&req.id, e)),
    }
}

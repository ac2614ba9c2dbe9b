use std::path::PathBuf;

use crate::matrix::ResultsMatrixStore;
use crate::model::Exam;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassScope {
    Class(i64),
    AllStreams,
}

/// What the open matrix was loaded for.
#[derive(Debug, Clone)]
pub struct MatrixSession {
    pub exam: Exam,
    pub level: Option<String>,
    pub class_scope: ClassScope,
    pub student_ids: Vec<i64>,
    pub subject_ids: Vec<i64>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub matrix: ResultsMatrixStore,
    pub session: Option<MatrixSession>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            matrix: ResultsMatrixStore::new(),
            session: None,
        }
    }

    /// Forgets the open matrix. Plans issued against it are dropped on reconcile.
    pub fn close_matrix(&mut self) {
        self.matrix.reset();
        self.session = None;
    }
}

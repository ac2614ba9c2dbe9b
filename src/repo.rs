use crate::model::{ResultPayload, ResultRow};
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("result {id} not found")]
    NotFound { id: i64 },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("rejected by store: {0}")]
    Rejected(String),
}

impl RepoError {
    pub fn code(&self) -> &'static str {
        match self {
            RepoError::NotFound { .. } => "not_found",
            RepoError::Storage(_) => "db_query_failed",
            RepoError::Rejected(_) => "db_insert_failed",
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
                RepoError::Rejected(e.to_string())
            }
            _ => RepoError::Storage(e.to_string()),
        }
    }
}

/// The remote store the results matrix is persisted to. Every call is
/// independent: the engine never assumes a batch is atomic.
pub trait ResultsRepository {
    fn list(&self, exam_id: i64) -> Result<Vec<ResultRow>, RepoError>;
    fn create(&mut self, payload: &ResultPayload) -> Result<i64, RepoError>;
    fn update(&mut self, id: i64, payload: &ResultPayload) -> Result<i64, RepoError>;
    fn delete(&mut self, id: i64) -> Result<(), RepoError>;
}

pub struct SqliteResults<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteResults<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl ResultsRepository for SqliteResults<'_> {
    fn list(&self, exam_id: i64) -> Result<Vec<ResultRow>, RepoError> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.student_id, r.subject_id, r.exam_id, r.score, r.grade,
                    s.full_name, s.admission_number, c.id, c.stream, c.name
             FROM results r
             LEFT JOIN students s ON s.id = r.student_id
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE r.exam_id = ?
             ORDER BY r.id",
        )?;
        let rows = stmt
            .query_map([exam_id], |r| {
                let mut row = ResultRow::bare(r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?);
                row.grade = r.get(5)?;
                if let Some(name) = r.get::<_, Option<String>>(6)? {
                    row.student_name = name;
                }
                if let Some(adm) = r.get::<_, Option<String>>(7)? {
                    row.admission_number = adm;
                }
                row.class_id = r.get(8)?;
                if let Some(stream) = r.get::<_, Option<String>>(9)? {
                    row.class_stream = stream;
                }
                if let Some(level) = r.get::<_, Option<String>>(10)? {
                    row.form_level = level;
                }
                Ok(row)
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        Ok(rows)
    }

    fn create(&mut self, payload: &ResultPayload) -> Result<i64, RepoError> {
        self.conn.execute(
            "INSERT INTO results(exam_id, student_id, subject_id, score, grade, recorded_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                payload.exam_id,
                payload.student_id,
                payload.subject_id,
                payload.score,
                &payload.grade,
                chrono::Utc::now().to_rfc3339(),
            ),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update(&mut self, id: i64, payload: &ResultPayload) -> Result<i64, RepoError> {
        let changed = self.conn.execute(
            "UPDATE results
             SET exam_id = ?, student_id = ?, subject_id = ?, score = ?, grade = ?, recorded_at = ?
             WHERE id = ?",
            (
                payload.exam_id,
                payload.student_id,
                payload.subject_id,
                payload.score,
                &payload.grade,
                chrono::Utc::now().to_rfc3339(),
                id,
            ),
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound { id });
        }
        Ok(id)
    }

    fn delete(&mut self, id: i64) -> Result<(), RepoError> {
        let changed = self.conn.execute("DELETE FROM results WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(RepoError::NotFound { id });
        }
        Ok(())
    }
}

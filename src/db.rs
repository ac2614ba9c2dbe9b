use crate::grading::{resolve_grade, DEFAULT_BOUNDARIES, DEFAULT_SYSTEM_NAME};
use crate::model::{ClassUnit, Exam, GradeBoundary, GradingSystem, Student, Subject};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

pub const DB_FILE: &str = "results.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            stream TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_name ON classes(name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL,
            short_name TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            admission_number TEXT NOT NULL,
            class_id INTEGER,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_systems(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            is_default INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_boundaries(
            id INTEGER PRIMARY KEY,
            system_id INTEGER NOT NULL,
            grade TEXT NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            points REAL NOT NULL DEFAULT 0,
            remark TEXT,
            FOREIGN KEY(system_id) REFERENCES grade_systems(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_boundaries_system ON grade_boundaries(system_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            grade_system_id INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    // AUTOINCREMENT keeps deleted result ids from being handed out again.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            score REAL NOT NULL,
            grade TEXT,
            recorded_at TEXT,
            UNIQUE(exam_id, student_id, subject_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_exam ON results(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON results(student_id)",
        [],
    )?;

    Ok(())
}

fn upserted_id(conn: &Connection, id: Option<i64>) -> i64 {
    id.unwrap_or_else(|| conn.last_insert_rowid())
}

pub fn upsert_class(
    conn: &Connection,
    id: Option<i64>,
    name: &str,
    stream: &str,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO classes(id, name, stream) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, stream = excluded.stream",
        (id, name, stream),
    )?;
    Ok(upserted_id(conn, id))
}

pub fn list_classes(conn: &Connection) -> anyhow::Result<Vec<ClassUnit>> {
    let mut stmt = conn.prepare("SELECT id, name, stream FROM classes ORDER BY name, stream, id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ClassUnit {
                id: r.get(0)?,
                name: r.get(1)?,
                stream: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn upsert_subject(
    conn: &Connection,
    id: Option<i64>,
    name: &str,
    code: &str,
    short_name: Option<&str>,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO subjects(id, name, code, short_name) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           code = excluded.code,
           short_name = excluded.short_name",
        (id, name, code, short_name),
    )?;
    Ok(upserted_id(conn, id))
}

pub fn list_subjects(conn: &Connection) -> anyhow::Result<Vec<Subject>> {
    let mut stmt = conn.prepare("SELECT id, name, code, short_name FROM subjects ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
                short_name: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn set_class_subjects(
    conn: &Connection,
    class_id: i64,
    subject_ids: &[i64],
) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM class_subjects WHERE class_id = ?", [class_id])?;
    for subject_id in subject_ids {
        tx.execute(
            "INSERT OR IGNORE INTO class_subjects(class_id, subject_id) VALUES(?, ?)",
            (class_id, subject_id),
        )?;
    }
    tx.commit()?;
    Ok(subject_ids.len())
}

pub fn class_subject_ids(conn: &Connection, class_id: i64) -> anyhow::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT subject_id FROM class_subjects WHERE class_id = ? ORDER BY subject_id",
    )?;
    let ids = stmt
        .query_map([class_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<i64>, _>>())?;
    Ok(ids)
}

pub fn upsert_student(
    conn: &Connection,
    id: Option<i64>,
    full_name: &str,
    admission_number: &str,
    class_id: Option<i64>,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO students(id, full_name, admission_number, class_id) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           full_name = excluded.full_name,
           admission_number = excluded.admission_number,
           class_id = excluded.class_id",
        (id, full_name, admission_number, class_id),
    )?;
    Ok(upserted_id(conn, id))
}

pub fn list_students(conn: &Connection) -> anyhow::Result<Vec<Student>> {
    let mut stmt = conn.prepare(
        "SELECT id, full_name, admission_number, class_id FROM students ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Student {
                id: r.get(0)?,
                full_name: r.get(1)?,
                admission_number: r.get(2)?,
                class_id: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn upsert_exam(
    conn: &Connection,
    id: Option<i64>,
    name: &str,
    grade_system_id: Option<i64>,
    is_active: bool,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO exams(id, name, grade_system_id, is_active) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           grade_system_id = excluded.grade_system_id,
           is_active = excluded.is_active",
        (id, name, grade_system_id, is_active as i64),
    )?;
    Ok(upserted_id(conn, id))
}

fn exam_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Exam> {
    Ok(Exam {
        id: r.get(0)?,
        name: r.get(1)?,
        grade_system_id: r.get(2)?,
        is_active: r.get::<_, i64>(3)? != 0,
    })
}

pub fn list_exams(conn: &Connection) -> anyhow::Result<Vec<Exam>> {
    let mut stmt =
        conn.prepare("SELECT id, name, grade_system_id, is_active FROM exams ORDER BY id")?;
    let rows = stmt
        .query_map([], exam_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn get_exam(conn: &Connection, exam_id: i64) -> anyhow::Result<Option<Exam>> {
    let exam = conn
        .query_row(
            "SELECT id, name, grade_system_id, is_active FROM exams WHERE id = ?",
            [exam_id],
            exam_from_row,
        )
        .optional()?;
    Ok(exam)
}

/// All grading systems with their boundaries, systems in id order.
pub fn list_grading_systems(conn: &Connection) -> anyhow::Result<Vec<GradingSystem>> {
    let mut boundaries_by_system: HashMap<i64, Vec<GradeBoundary>> = HashMap::new();
    let mut b_stmt = conn.prepare(
        "SELECT id, system_id, grade, min_score, max_score, points, remark
         FROM grade_boundaries
         ORDER BY system_id, min_score DESC, id",
    )?;
    let boundaries = b_stmt
        .query_map([], |r| {
            Ok(GradeBoundary {
                id: r.get(0)?,
                system_id: r.get(1)?,
                grade: r.get(2)?,
                min_score: r.get(3)?,
                max_score: r.get(4)?,
                points: r.get(5)?,
                remark: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    for b in boundaries {
        boundaries_by_system.entry(b.system_id).or_default().push(b);
    }

    let mut stmt =
        conn.prepare("SELECT id, name, description, is_default FROM grade_systems ORDER BY id")?;
    let systems = stmt
        .query_map([], |r| {
            Ok(GradingSystem {
                id: r.get(0)?,
                name: r.get(1)?,
                description: r.get(2)?,
                is_default: r.get::<_, i64>(3)? != 0,
                boundaries: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(systems
        .into_iter()
        .map(|mut s| {
            s.boundaries = boundaries_by_system.remove(&s.id).unwrap_or_default();
            s
        })
        .collect())
}

/// Marking a system default clears the flag on every other system.
pub fn upsert_grading_system(
    conn: &Connection,
    id: Option<i64>,
    name: &str,
    description: Option<&str>,
    is_default: bool,
) -> anyhow::Result<i64> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO grade_systems(id, name, description, is_default) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           description = excluded.description,
           is_default = excluded.is_default",
        (id, name, description, is_default as i64),
    )?;
    let system_id = id.unwrap_or_else(|| tx.last_insert_rowid());
    if is_default {
        tx.execute(
            "UPDATE grade_systems SET is_default = 0 WHERE id <> ?",
            [system_id],
        )?;
    }
    tx.commit()?;
    Ok(system_id)
}

pub fn delete_grading_system(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE exams SET grade_system_id = NULL WHERE grade_system_id = ?",
        [id],
    )?;
    let changed = tx.execute("DELETE FROM grade_systems WHERE id = ?", [id])?;
    tx.commit()?;
    Ok(changed > 0)
}

pub fn upsert_boundary(conn: &Connection, b: &GradeBoundary, id: Option<i64>) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO grade_boundaries(id, system_id, grade, min_score, max_score, points, remark)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           system_id = excluded.system_id,
           grade = excluded.grade,
           min_score = excluded.min_score,
           max_score = excluded.max_score,
           points = excluded.points,
           remark = excluded.remark",
        (
            id,
            b.system_id,
            &b.grade,
            b.min_score,
            b.max_score,
            b.points,
            b.remark.as_deref(),
        ),
    )?;
    Ok(upserted_id(conn, id))
}

pub fn delete_boundary(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    Ok(conn.execute("DELETE FROM grade_boundaries WHERE id = ?", [id])? > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSummary {
    pub system_id: i64,
    pub created_system: bool,
    pub boundaries_created: usize,
}

/// Ensures at least one grading system with boundaries exists. Creates the
/// KNEC table as the default system on an empty workspace, or fills the
/// first system when it has no boundaries yet. Safe to call repeatedly.
pub fn seed_default_grading(conn: &Connection) -> anyhow::Result<SeedSummary> {
    let first: Option<i64> = conn
        .query_row("SELECT id FROM grade_systems ORDER BY id LIMIT 1", [], |r| {
            r.get(0)
        })
        .optional()?;
    let (system_id, created_system) = match first {
        Some(id) => (id, false),
        None => (
            upsert_grading_system(conn, None, DEFAULT_SYSTEM_NAME, None, true)?,
            true,
        ),
    };

    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM grade_boundaries WHERE system_id = ?",
        [system_id],
        |r| r.get(0),
    )?;
    if existing > 0 {
        return Ok(SeedSummary {
            system_id,
            created_system,
            boundaries_created: 0,
        });
    }

    let tx = conn.unchecked_transaction()?;
    for b in DEFAULT_BOUNDARIES.iter() {
        tx.execute(
            "INSERT INTO grade_boundaries(system_id, grade, min_score, max_score, points, remark)
             VALUES(?, ?, ?, ?, ?, ?)",
            (system_id, b.grade, b.min_score, b.max_score, b.points, b.remark),
        )?;
    }
    tx.commit()?;

    Ok(SeedSummary {
        system_id,
        created_system,
        boundaries_created: DEFAULT_BOUNDARIES.len(),
    })
}

#[derive(Debug, Clone)]
pub struct StoredGrade {
    pub id: i64,
    pub exam_id: i64,
    pub score: f64,
    pub grade: Option<String>,
}

pub fn list_stored_grades(
    conn: &Connection,
    exam_id: Option<i64>,
) -> anyhow::Result<Vec<StoredGrade>> {
    let mut stmt = conn.prepare(
        "SELECT id, exam_id, score, grade FROM results
         WHERE (?1 IS NULL OR exam_id = ?1)
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(StoredGrade {
                id: r.get(0)?,
                exam_id: r.get(1)?,
                score: r.get(2)?,
                grade: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn set_result_grade(conn: &Connection, id: i64, grade: &str) -> anyhow::Result<()> {
    conn.execute("UPDATE results SET grade = ? WHERE id = ?", (grade, id))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeChange {
    pub result_id: i64,
    pub score: f64,
    pub from: Option<String>,
    pub to: String,
}

#[derive(Debug, Default)]
pub struct RegradeReport {
    pub checked: usize,
    pub changes: Vec<GradeChange>,
    pub failures: Vec<(i64, String)>,
}

/// Re-resolves every stored grade (optionally one exam's) against the
/// owning exam's system. Each row is rewritten on its own, so a failed
/// row is reported and the rest still go through.
pub fn regrade_results(
    conn: &Connection,
    exam_id: Option<i64>,
    systems: &[GradingSystem],
) -> anyhow::Result<RegradeReport> {
    let exam_systems: HashMap<i64, Option<i64>> = list_exams(conn)?
        .into_iter()
        .map(|e| (e.id, e.grade_system_id))
        .collect();
    let stored = list_stored_grades(conn, exam_id)?;

    let mut report = RegradeReport {
        checked: stored.len(),
        ..RegradeReport::default()
    };
    for row in stored {
        let system_id = exam_systems.get(&row.exam_id).copied().flatten();
        let grade = resolve_grade(row.score, systems, system_id);
        if row.grade.as_deref() == Some(grade.as_str()) {
            continue;
        }
        match set_result_grade(conn, row.id, &grade) {
            Ok(()) => report.changes.push(GradeChange {
                result_id: row.id,
                score: row.score,
                from: row.grade,
                to: grade,
            }),
            Err(e) => report.failures.push((row.id, e.to_string())),
        }
    }
    Ok(report)
}

use crate::grading::resolve_grade;
use crate::model::{ClassUnit, GradingSystem, ResultRow, Student};
use crate::ranking::sort_by_total_desc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Only changes which columns are shown; the ranked list is the same.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupBy {
    #[default]
    Stream,
    EntireClass,
}

impl GroupBy {
    pub fn shows_stream(self) -> bool {
        self == GroupBy::EntireClass
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBroadsheetRow {
    pub student: Student,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub scores: BTreeMap<i64, f64>,
    pub total: f64,
    pub avg: f64,
    pub mean_grade: String,
}

pub fn project(
    students: &[Student],
    classes: &[ClassUnit],
    rows: &[ResultRow],
    systems: &[GradingSystem],
    exam_system_id: Option<i64>,
    level_filter: Option<&str>,
    group_by: GroupBy,
) -> Vec<StudentBroadsheetRow> {
    let class_by_id: HashMap<i64, &ClassUnit> = classes.iter().map(|c| (c.id, c)).collect();
    let class_of = |s: &Student| s.class_id.and_then(|id| class_by_id.get(&id).copied());
    let level = level_filter.map(str::trim).filter(|l| !l.is_empty());

    let mut out: Vec<StudentBroadsheetRow> = students
        .iter()
        .filter(|s| match level {
            Some(l) => class_of(s).map_or(false, |c| c.name == l),
            None => true,
        })
        .map(|student| {
            let mut scores = BTreeMap::new();
            let mut total = 0.0_f64;
            let mut count = 0_usize;
            for r in rows.iter().filter(|r| r.student_id == student.id) {
                // A repeated subject shows its last row, as in the ranking.
                scores.insert(r.subject_id, r.score);
                total += r.score;
                count += 1;
            }
            let avg = if count > 0 { total / (count as f64) } else { 0.0 };
            StudentBroadsheetRow {
                student: student.clone(),
                stream: group_by
                    .shows_stream()
                    .then(|| class_of(student).map(|c| c.stream.clone()))
                    .flatten(),
                scores,
                total,
                avg,
                mean_grade: resolve_grade(avg, systems, exam_system_id),
            }
        })
        .collect();

    sort_by_total_desc(&mut out, |r| r.total);
    out
}

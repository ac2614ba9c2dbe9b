use crate::grading::resolve_grade;
use crate::model::{GradingSystem, ResultRow, Subject};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingFilter {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub class_id: Option<i64>,
}

impl RankingFilter {
    fn active_level(&self) -> Option<&str> {
        self.level.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    fn accepts(&self, s: &AggregatedStudent) -> bool {
        let level_ok = self.active_level().map_or(true, |l| s.form_level == l);
        let class_ok = self.class_id.map_or(true, |c| s.class_id == Some(c));
        level_ok && class_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStudent {
    pub student_id: i64,
    pub student_name: String,
    pub admission_number: String,
    pub form_level: String,
    pub class_id: Option<i64>,
    pub class_stream: String,
    pub scores_by_subject: BTreeMap<i64, f64>,
    pub total: f64,
    pub subject_count: usize,
    pub mean: f64,
    pub mean_grade: String,
}

/// Folds result rows into one aggregate per student, in first-seen order.
fn fold_students(rows: &[ResultRow]) -> Vec<AggregatedStudent> {
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut out: Vec<AggregatedStudent> = Vec::new();
    for r in rows {
        let slot = *index.entry(r.student_id).or_insert_with(|| {
            out.push(AggregatedStudent {
                student_id: r.student_id,
                student_name: r.student_name.clone(),
                admission_number: r.admission_number.clone(),
                form_level: r.form_level.clone(),
                class_id: r.class_id,
                class_stream: r.class_stream.clone(),
                scores_by_subject: BTreeMap::new(),
                total: 0.0,
                subject_count: 0,
                mean: 0.0,
                mean_grade: String::new(),
            });
            out.len() - 1
        });
        let s = &mut out[slot];
        // A repeated subject keeps its last row in the column; every row counts.
        s.scores_by_subject.insert(r.subject_id, r.score);
        s.total += r.score;
        s.subject_count += 1;
    }
    out
}

/// Sorts by total descending. The sort is stable and has no secondary key,
/// so equal totals keep their input order.
pub fn sort_by_total_desc<T>(items: &mut [T], total: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| total(b).partial_cmp(&total(a)).unwrap_or(Ordering::Equal));
}

/// Aggregates, filters and ranks one group of students. At most one group
/// is produced; an empty result produces no group at all.
pub fn aggregate(
    rows: &[ResultRow],
    systems: &[GradingSystem],
    exam_system_id: Option<i64>,
    filter: &RankingFilter,
) -> BTreeMap<String, Vec<AggregatedStudent>> {
    let mut students = fold_students(rows);
    for s in &mut students {
        s.mean = if s.subject_count > 0 {
            s.total / (s.subject_count as f64)
        } else {
            0.0
        };
        s.mean_grade = resolve_grade(s.mean, systems, exam_system_id);
    }

    let mut kept: Vec<AggregatedStudent> = students.into_iter().filter(|s| filter.accepts(s)).collect();
    sort_by_total_desc(&mut kept, |s| s.total);

    let mut groups = BTreeMap::new();
    if kept.is_empty() {
        return groups;
    }
    let label = match (filter.class_id, filter.active_level()) {
        (Some(_), _) => format!("{} Results", kept[0].class_stream),
        (None, Some(level)) => format!("{} Ranking", level),
        (None, None) => "Overall Ranking".to_string(),
    };
    groups.insert(label, kept);
    groups
}

/// Subjects worth a column for a group: those at least one student in the
/// group has a score for, in directory order.
pub fn subject_columns<'a>(group: &[AggregatedStudent], subjects: &'a [Subject]) -> Vec<&'a Subject> {
    subjects
        .iter()
        .filter(|sub| group.iter().any(|s| s.scores_by_subject.contains_key(&sub.id)))
        .collect()
}

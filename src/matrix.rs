//! Editable student × subject score grid for one exam and one class scope.
//!
//! The store is the only place local edits live between a `load` and the
//! next one. `commit` turns the grid into a plan of independent
//! create/update/delete calls; outcomes come back through `reconcile`,
//! which checks the plan's generation so results from a grid that has
//! since been reloaded are dropped instead of applied to unrelated cells.

use crate::grading::resolve_grade;
use crate::model::{GradingSystem, ResultPayload, ResultRow};
use crate::repo::ResultsRepository;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{info, info_span, warn};
use uuid::Uuid;

/// `(student_id, subject_id)`
pub type CellKey = (i64, i64);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    /// Raw input, possibly empty or partial.
    pub score: String,
    pub persisted_id: Option<i64>,
}

impl ScoreEntry {
    pub fn is_blank(&self) -> bool {
        self.score.trim().is_empty()
    }

    pub fn is_saved(&self) -> bool {
        self.persisted_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExamScope {
    pub exam_id: i64,
    pub grade_system_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CommitAction {
    Create { payload: ResultPayload },
    #[serde(rename_all = "camelCase")]
    Update { persisted_id: i64, payload: ResultPayload },
    #[serde(rename_all = "camelCase")]
    Delete { persisted_id: i64 },
}

impl CommitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitAction::Create { .. } => "create",
            CommitAction::Update { .. } => "update",
            CommitAction::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedOp {
    pub student_id: i64,
    pub subject_id: i64,
    #[serde(flatten)]
    pub action: CommitAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWarning {
    pub student_id: i64,
    pub subject_id: i64,
    pub raw: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitPlan {
    pub generation: u64,
    pub ops: Vec<PlannedOp>,
    pub skipped: usize,
    pub warnings: Vec<ScoreWarning>,
}

impl CommitPlan {
    pub fn count(&self, kind: &str) -> usize {
        self.ops.iter().filter(|op| op.action.as_str() == kind).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellOutcome {
    pub student_id: i64,
    pub subject_id: i64,
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub applied: usize,
    pub dropped_stale: usize,
    pub missing_cell: usize,
    pub missing_id: usize,
    pub displaced: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellFailure {
    pub student_id: i64,
    pub subject_id: i64,
    pub action: &'static str,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub outcomes: Vec<CellOutcome>,
    pub failures: Vec<CellFailure>,
}

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d*\.?\d*$").expect("static score pattern"))
}

/// Parses a raw cell value: digits with at most one decimal point and at
/// least one digit. Anything else, including a digit run too long to be
/// finite, is not a score.
pub fn parse_score(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if !t.chars().any(|c| c.is_ascii_digit()) || !score_pattern().is_match(t) {
        return None;
    }
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Default)]
pub struct ResultsMatrixStore {
    scope: Option<ExamScope>,
    generation: u64,
    cells: BTreeMap<CellKey, ScoreEntry>,
}

impl ResultsMatrixStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn scope(&self) -> Option<ExamScope> {
        self.scope
    }

    pub fn is_loaded(&self) -> bool {
        self.scope.is_some()
    }

    pub fn cells(&self) -> impl Iterator<Item = (&CellKey, &ScoreEntry)> {
        self.cells.iter()
    }

    pub fn cell(&self, student_id: i64, subject_id: i64) -> Option<&ScoreEntry> {
        self.cells.get(&(student_id, subject_id))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Replaces the grid wholesale and starts a new generation. Outcomes
    /// planned against any earlier generation are dropped on reconcile.
    pub fn load(&mut self, scope: ExamScope, rows: &[ResultRow]) {
        self.generation += 1;
        self.scope = Some(scope);
        self.cells = rows
            .iter()
            .map(|row| {
                (
                    (row.student_id, row.subject_id),
                    ScoreEntry {
                        score: format_score(row.score),
                        persisted_id: Some(row.id),
                    },
                )
            })
            .collect();
        info!(
            generation = self.generation,
            exam_id = scope.exam_id,
            cells = self.cells.len(),
            "matrix loaded"
        );
    }

    /// Drops the grid and the scope. Bumps the generation like `load`.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.scope = None;
        self.cells.clear();
    }

    pub fn set_score(&mut self, student_id: i64, subject_id: i64, raw: &str) {
        self.cells
            .entry((student_id, subject_id))
            .or_default()
            .score = raw.to_string();
    }

    /// Removes a cell outright, used after a confirmed remote delete.
    pub fn clear_entry(&mut self, student_id: i64, subject_id: i64) -> Option<ScoreEntry> {
        self.cells.remove(&(student_id, subject_id))
    }

    /// Classifies every cell as delete, skip or upsert. Does not mutate.
    pub fn commit(&self, systems: &[GradingSystem]) -> CommitPlan {
        let mut plan = CommitPlan {
            generation: self.generation,
            ops: Vec::new(),
            skipped: 0,
            warnings: Vec::new(),
        };
        let Some(scope) = self.scope else {
            plan.skipped = self.cells.len();
            return plan;
        };

        for (&(student_id, subject_id), entry) in &self.cells {
            if entry.is_blank() {
                match entry.persisted_id {
                    Some(persisted_id) => plan.ops.push(PlannedOp {
                        student_id,
                        subject_id,
                        action: CommitAction::Delete { persisted_id },
                    }),
                    None => plan.skipped += 1,
                }
                continue;
            }

            let Some(score) = parse_score(&entry.score) else {
                warn!(student_id, subject_id, raw = %entry.score, "unparseable score excluded from commit");
                plan.warnings.push(ScoreWarning {
                    student_id,
                    subject_id,
                    raw: entry.score.clone(),
                    message: "score is not a number".to_string(),
                });
                continue;
            };

            let payload = ResultPayload {
                student_id,
                subject_id,
                exam_id: scope.exam_id,
                score,
                grade: resolve_grade(score, systems, scope.grade_system_id),
            };
            let action = match entry.persisted_id {
                Some(persisted_id) => CommitAction::Update {
                    persisted_id,
                    payload,
                },
                None => CommitAction::Create { payload },
            };
            plan.ops.push(PlannedOp {
                student_id,
                subject_id,
                action,
            });
        }

        info!(
            generation = plan.generation,
            creates = plan.count("create"),
            updates = plan.count("update"),
            deletes = plan.count("delete"),
            skipped = plan.skipped,
            warnings = plan.warnings.len(),
            "commit planned"
        );
        plan
    }

    /// Applies per-cell outcomes. Each outcome touches at most one cell and
    /// is independent of the others.
    pub fn reconcile(&mut self, generation: u64, outcomes: &[CellOutcome]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if generation != self.generation {
            report.dropped_stale = outcomes.len();
            warn!(
                planned = generation,
                current = self.generation,
                dropped = outcomes.len(),
                "stale reconciliation dropped"
            );
            return report;
        }

        for o in outcomes {
            let key = (o.student_id, o.subject_id);
            if !self.cells.contains_key(&key) {
                report.missing_cell += 1;
                continue;
            }
            match o.outcome {
                OutcomeKind::Created | OutcomeKind::Updated => {
                    let Some(new_id) = o.new_id else {
                        report.missing_id += 1;
                        continue;
                    };
                    report.displaced += self.release_persisted_id(new_id, key);
                    if let Some(cell) = self.cells.get_mut(&key) {
                        cell.persisted_id = Some(new_id);
                    }
                }
                OutcomeKind::Deleted => {
                    if let Some(cell) = self.cells.get_mut(&key) {
                        cell.persisted_id = None;
                    }
                }
            }
            report.applied += 1;
        }
        report
    }

    /// Keeps persisted ids unique across cells: any other cell holding `id`
    /// loses it.
    fn release_persisted_id(&mut self, id: i64, keep: CellKey) -> usize {
        let mut displaced = 0;
        for (key, cell) in self.cells.iter_mut() {
            if *key != keep && cell.persisted_id == Some(id) {
                warn!(
                    persisted_id = id,
                    student_id = key.0,
                    subject_id = key.1,
                    "persisted id moved to another cell"
                );
                cell.persisted_id = None;
                displaced += 1;
            }
        }
        displaced
    }
}

/// Renders a stored score the way it is shown in an input box.
pub fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

/// Runs every planned operation against the repository. A failed call is
/// reported and does not stop the rest; there is no retry.
pub fn execute_plan<R: ResultsRepository + ?Sized>(repo: &mut R, plan: &CommitPlan) -> BatchResult {
    let batch_id = Uuid::new_v4().to_string();
    let span = info_span!("commit_batch", batch_id = %batch_id, generation = plan.generation);
    let _guard = span.enter();

    let mut result = BatchResult {
        batch_id: batch_id.clone(),
        ..BatchResult::default()
    };
    for op in &plan.ops {
        let outcome = match &op.action {
            CommitAction::Create { payload } => repo
                .create(payload)
                .map(|id| (OutcomeKind::Created, Some(id))),
            CommitAction::Update {
                persisted_id,
                payload,
            } => repo
                .update(*persisted_id, payload)
                .map(|id| (OutcomeKind::Updated, Some(id))),
            CommitAction::Delete { persisted_id } => repo
                .delete(*persisted_id)
                .map(|_| (OutcomeKind::Deleted, None)),
        };
        match outcome {
            Ok((kind, new_id)) => result.outcomes.push(CellOutcome {
                student_id: op.student_id,
                subject_id: op.subject_id,
                outcome: kind,
                new_id,
            }),
            Err(e) => {
                warn!(
                    student_id = op.student_id,
                    subject_id = op.subject_id,
                    action = op.action.as_str(),
                    error = %e,
                    "cell commit failed"
                );
                result.failures.push(CellFailure {
                    student_id: op.student_id,
                    subject_id: op.subject_id,
                    action: op.action.as_str(),
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::fixtures::knec;
    use crate::repo::memory::MemoryResults;

    const SCOPE: ExamScope = ExamScope {
        exam_id: 5,
        grade_system_id: Some(1),
    };

    fn loaded(rows: &[ResultRow]) -> ResultsMatrixStore {
        let mut store = ResultsMatrixStore::new();
        store.load(SCOPE, rows);
        store
    }

    fn created(student_id: i64, subject_id: i64, id: i64) -> CellOutcome {
        CellOutcome {
            student_id,
            subject_id,
            outcome: OutcomeKind::Created,
            new_id: Some(id),
        }
    }

    #[test]
    fn load_replaces_previous_cells() {
        let mut store = loaded(&[ResultRow::bare(7, 1, 2, 5, 64.5)]);
        assert_eq!(
            store.cell(1, 2),
            Some(&ScoreEntry {
                score: "64.5".to_string(),
                persisted_id: Some(7)
            })
        );
        store.set_score(3, 3, "50");

        store.load(SCOPE, &[ResultRow::bare(8, 2, 2, 5, 70.0)]);
        assert_eq!(store.len(), 1);
        assert!(store.cell(1, 2).is_none());
        assert!(store.cell(3, 3).is_none());
        assert_eq!(store.cell(2, 2).map(|c| c.score.as_str()), Some("70"));
        assert_eq!(store.generation(), 2);
    }

    #[test]
    fn commit_classifies_delete_skip_and_upsert() {
        let systems = vec![knec()];
        let mut store = loaded(&[
            ResultRow::bare(11, 1, 1, 5, 80.0),
            ResultRow::bare(12, 1, 2, 5, 40.0),
        ]);
        store.set_score(1, 2, "  ");
        store.set_score(2, 1, "");
        store.set_score(2, 2, "66");

        let plan = store.commit(&systems);
        assert_eq!(plan.skipped, 1);
        assert!(plan.warnings.is_empty());
        assert_eq!(
            plan.ops,
            vec![
                PlannedOp {
                    student_id: 1,
                    subject_id: 1,
                    action: CommitAction::Update {
                        persisted_id: 11,
                        payload: ResultPayload {
                            student_id: 1,
                            subject_id: 1,
                            exam_id: 5,
                            score: 80.0,
                            grade: "A".to_string(),
                        },
                    },
                },
                PlannedOp {
                    student_id: 1,
                    subject_id: 2,
                    action: CommitAction::Delete { persisted_id: 12 },
                },
                PlannedOp {
                    student_id: 2,
                    subject_id: 2,
                    action: CommitAction::Create {
                        payload: ResultPayload {
                            student_id: 2,
                            subject_id: 2,
                            exam_id: 5,
                            score: 66.0,
                            grade: "B".to_string(),
                        },
                    },
                },
            ]
        );
    }

    #[test]
    fn empty_unsaved_cells_never_reach_the_repository() {
        let mut store = loaded(&[]);
        store.set_score(1, 1, "");
        let mut repo = MemoryResults::new(1);

        for _ in 0..2 {
            let plan = store.commit(&[]);
            assert!(plan.ops.is_empty());
            let batch = execute_plan(&mut repo, &plan);
            store.reconcile(plan.generation, &batch.outcomes);
        }
        assert_eq!(repo.calls, 0);
    }

    #[test]
    fn create_then_blank_becomes_delete_of_the_same_id() {
        let systems = vec![knec()];
        let mut store = loaded(&[]);
        store.set_score(4, 9, "85");

        let plan = store.commit(&systems);
        assert_eq!(plan.count("create"), 1);
        let report = store.reconcile(plan.generation, &[created(4, 9, 42)]);
        assert_eq!(report.applied, 1);
        assert_eq!(store.cell(4, 9).and_then(|c| c.persisted_id), Some(42));

        store.set_score(4, 9, "");
        let plan = store.commit(&systems);
        assert_eq!(
            plan.ops,
            vec![PlannedOp {
                student_id: 4,
                subject_id: 9,
                action: CommitAction::Delete { persisted_id: 42 },
            }]
        );
        store.reconcile(
            plan.generation,
            &[CellOutcome {
                student_id: 4,
                subject_id: 9,
                outcome: OutcomeKind::Deleted,
                new_id: None,
            }],
        );
        assert_eq!(store.cell(4, 9), Some(&ScoreEntry::default()));

        // Nothing left to do after the delete was reconciled.
        let plan = store.commit(&systems);
        assert!(plan.ops.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn edit_during_flight_keeps_new_value_and_takes_the_id() {
        let systems = vec![knec()];
        let mut store = loaded(&[]);
        store.set_score(1, 1, "85");
        let plan = store.commit(&systems);

        store.set_score(1, 1, "90");
        store.reconcile(plan.generation, &[created(1, 1, 42)]);

        let cell = store.cell(1, 1).expect("cell");
        assert_eq!(cell.score, "90");
        assert_eq!(cell.persisted_id, Some(42));

        let next = store.commit(&systems);
        match &next.ops[0].action {
            CommitAction::Update {
                persisted_id,
                payload,
            } => {
                assert_eq!(*persisted_id, 42);
                assert_eq!(payload.score, 90.0);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn stale_generation_is_dropped() {
        let mut store = loaded(&[]);
        store.set_score(1, 1, "50");
        let plan = store.commit(&[]);

        store.load(SCOPE, &[]);
        store.set_score(1, 1, "70");
        let report = store.reconcile(plan.generation, &[created(1, 1, 99)]);

        assert_eq!(report.dropped_stale, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(store.cell(1, 1).and_then(|c| c.persisted_id), None);
    }

    #[test]
    fn reset_invalidates_in_flight_plans() {
        let mut store = loaded(&[]);
        store.set_score(1, 1, "50");
        let plan = store.commit(&[]);
        store.reset();
        assert!(!store.is_loaded());
        assert_eq!(store.reconcile(plan.generation, &[created(1, 1, 1)]).dropped_stale, 1);
    }

    #[test]
    fn malformed_scores_warn_and_are_excluded() {
        let mut store = loaded(&[ResultRow::bare(3, 1, 1, 5, 10.0)]);
        store.set_score(1, 1, "12abc");
        store.set_score(1, 2, ".");
        store.set_score(1, 3, "1.2.3");
        store.set_score(1, 4, "7.");

        let plan = store.commit(&[]);
        assert_eq!(plan.warnings.len(), 3);
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].subject_id, 4);
        // The saved cell with bad input keeps its id and is not deleted.
        assert_eq!(store.cell(1, 1).and_then(|c| c.persisted_id), Some(3));
    }

    #[test]
    fn overflowing_digit_runs_are_not_planned() {
        let mut store = loaded(&[]);
        store.set_score(1, 1, &"9".repeat(400));
        let plan = store.commit(&[knec()]);
        assert!(plan.ops.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn persisted_ids_stay_unique() {
        let mut store = loaded(&[ResultRow::bare(42, 1, 1, 5, 60.0)]);
        store.set_score(2, 2, "70");
        let plan = store.commit(&[]);
        let report = store.reconcile(plan.generation, &[created(2, 2, 42)]);

        assert_eq!(report.displaced, 1);
        let holders = store
            .cells()
            .filter(|(_, c)| c.persisted_id == Some(42))
            .count();
        assert_eq!(holders, 1);
        assert_eq!(store.cell(2, 2).and_then(|c| c.persisted_id), Some(42));
    }

    #[test]
    fn outcomes_for_cleared_cells_are_ignored() {
        let mut store = loaded(&[]);
        store.set_score(1, 1, "50");
        let plan = store.commit(&[]);
        store.clear_entry(1, 1);
        let report = store.reconcile(plan.generation, &[created(1, 1, 8)]);
        assert_eq!(report.missing_cell, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn partial_failure_reconciles_the_successful_cells() {
        let systems = vec![knec()];
        let mut store = loaded(&[]);
        store.set_score(1, 1, "55");
        store.set_score(2, 1, "65");
        store.set_score(3, 1, "75");

        let mut repo = MemoryResults::new(100);
        repo.fail_students.insert(2);

        let plan = store.commit(&systems);
        let batch = execute_plan(&mut repo, &plan);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].student_id, 2);
        assert_eq!(batch.outcomes.len(), 2);

        let report = store.reconcile(plan.generation, &batch.outcomes);
        assert_eq!(report.applied, 2);
        assert!(store.cell(1, 1).and_then(|c| c.persisted_id).is_some());
        assert!(store.cell(3, 1).and_then(|c| c.persisted_id).is_some());

        let failed = store.cell(2, 1).expect("failed cell kept");
        assert_eq!(failed.score, "65");
        assert_eq!(failed.persisted_id, None);

        // Resubmitting retries only the failed cell as a create.
        repo.fail_students.clear();
        let retry = store.commit(&systems);
        assert_eq!(retry.count("create"), 1);
        assert_eq!(retry.count("update"), 2);
    }

    #[test]
    fn score_parsing() {
        assert_eq!(parse_score("85"), Some(85.0));
        assert_eq!(parse_score(" 72.5 "), Some(72.5));
        assert_eq!(parse_score(".5"), Some(0.5));
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("-3"), None);
        assert_eq!(parse_score("1e3"), None);
        assert_eq!(parse_score("NaN"), None);
        assert_eq!(parse_score(&"9".repeat(400)), None);
    }

    #[test]
    fn stored_scores_render_without_trailing_zeroes() {
        assert_eq!(format_score(80.0), "80");
        assert_eq!(format_score(72.5), "72.5");
    }
}

use crate::model::{GradeBoundary, GradingSystem};
use std::cmp::Ordering;

/// Grade shown when no system or boundary applies. Not an error.
pub const UNGRADED: &str = "-";

/// Mean grade of an empty result list.
pub const NO_RESULTS: &str = "N/A";

/// Picks the grading system a score is resolved against:
/// preferred id, then the default system, then the first system.
pub fn select_system(
    systems: &[GradingSystem],
    preferred_system_id: Option<i64>,
) -> Option<&GradingSystem> {
    preferred_system_id
        .and_then(|id| systems.iter().find(|s| s.id == id))
        .or_else(|| systems.iter().find(|s| s.is_default))
        .or_else(|| systems.first())
}

/// Resolves a numeric score to a letter grade.
///
/// Boundaries are scanned by `min_score` descending and the first range
/// containing the score wins, so overlapping ranges resolve to the boundary
/// with the higher floor.
pub fn resolve_grade(
    score: f64,
    systems: &[GradingSystem],
    preferred_system_id: Option<i64>,
) -> String {
    if score.is_nan() {
        return UNGRADED.to_string();
    }
    let Some(system) = select_system(systems, preferred_system_id) else {
        return UNGRADED.to_string();
    };

    let mut ordered: Vec<&GradeBoundary> = system.boundaries.iter().collect();
    ordered.sort_by(|a, b| {
        b.min_score
            .partial_cmp(&a.min_score)
            .unwrap_or(Ordering::Equal)
    });

    ordered
        .into_iter()
        .find(|b| b.min_score <= score && score <= b.max_score)
        .map(|b| b.grade.clone())
        .unwrap_or_else(|| UNGRADED.to_string())
}

pub fn resolve_optional(
    score: Option<f64>,
    systems: &[GradingSystem],
    preferred_system_id: Option<i64>,
) -> String {
    match score {
        Some(v) => resolve_grade(v, systems, preferred_system_id),
        None => UNGRADED.to_string(),
    }
}

/// Grade of the arithmetic mean of `scores`; `N/A` when there are none.
pub fn mean_grade(
    scores: &[f64],
    systems: &[GradingSystem],
    preferred_system_id: Option<i64>,
) -> String {
    if scores.is_empty() {
        return NO_RESULTS.to_string();
    }
    let mean = scores.iter().sum::<f64>() / (scores.len() as f64);
    resolve_grade(mean, systems, preferred_system_id)
}

/// One-decimal display rounding, half away from zero.
pub fn round_1dp(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub struct SeedBoundary {
    pub grade: &'static str,
    pub min_score: f64,
    pub max_score: f64,
    pub points: f64,
    pub remark: &'static str,
}

pub const DEFAULT_SYSTEM_NAME: &str = "KNEC 8-4-4";

pub const DEFAULT_BOUNDARIES: [SeedBoundary; 12] = [
    SeedBoundary { grade: "A", min_score: 80.0, max_score: 100.0, points: 12.0, remark: "Excellent" },
    SeedBoundary { grade: "A-", min_score: 75.0, max_score: 79.0, points: 11.0, remark: "Very Good" },
    SeedBoundary { grade: "B+", min_score: 70.0, max_score: 74.0, points: 10.0, remark: "Good" },
    SeedBoundary { grade: "B", min_score: 65.0, max_score: 69.0, points: 9.0, remark: "Good" },
    SeedBoundary { grade: "B-", min_score: 60.0, max_score: 64.0, points: 8.0, remark: "Fair" },
    SeedBoundary { grade: "C+", min_score: 55.0, max_score: 59.0, points: 7.0, remark: "Fair" },
    SeedBoundary { grade: "C", min_score: 50.0, max_score: 54.0, points: 6.0, remark: "Average" },
    SeedBoundary { grade: "C-", min_score: 45.0, max_score: 49.0, points: 5.0, remark: "Weak" },
    SeedBoundary { grade: "D+", min_score: 40.0, max_score: 44.0, points: 4.0, remark: "Poor" },
    SeedBoundary { grade: "D", min_score: 35.0, max_score: 39.0, points: 3.0, remark: "Poor" },
    SeedBoundary { grade: "D-", min_score: 30.0, max_score: 34.0, points: 2.0, remark: "Very Poor" },
    SeedBoundary { grade: "E", min_score: 0.0, max_score: 29.0, points: 1.0, remark: "Fail" },
];

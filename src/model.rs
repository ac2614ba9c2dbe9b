use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBoundary {
    pub id: i64,
    pub system_id: i64,
    pub grade: String,
    pub min_score: f64,
    pub max_score: f64,
    pub points: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingSystem {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_default: bool,
    #[serde(default)]
    pub boundaries: Vec<GradeBoundary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassUnit {
    pub id: i64,
    /// The class level, e.g. "Form 4". Streams of one level share it.
    pub name: String,
    pub stream: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
}

impl Subject {
    pub fn abbreviation(&self) -> String {
        if let Some(short) = self.short_name.as_deref().filter(|s| !s.trim().is_empty()) {
            return short.to_uppercase();
        }
        if !self.code.trim().is_empty() {
            return self.code.to_uppercase();
        }
        self.name.chars().take(3).collect::<String>().to_uppercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: i64,
    pub full_name: String,
    pub admission_number: String,
    #[serde(default)]
    pub class_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub grade_system_id: Option<i64>,
    pub is_active: bool,
}

impl Student {
    /// Roster order: case-insensitive by name, byte order only to break ties.
    pub fn cmp_by_name(&self, other: &Self) -> Ordering {
        self.full_name
            .to_lowercase()
            .cmp(&other.full_name.to_lowercase())
            .then_with(|| self.full_name.cmp(&other.full_name))
    }
}

impl Exam {
    pub fn is_locked(&self) -> bool {
        !self.is_active
    }
}

/// A stored result as read back from the results repository, with the
/// directory fields needed for filtering and labels already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub id: i64,
    pub student_id: i64,
    pub subject_id: i64,
    pub exam_id: i64,
    pub score: f64,
    #[serde(default)]
    pub grade: Option<String>,
    pub student_name: String,
    pub admission_number: String,
    #[serde(default)]
    pub class_id: Option<i64>,
    pub class_stream: String,
    pub form_level: String,
}

impl ResultRow {
    /// A row with unresolved display fields. The repository fills them in
    /// from the directory when it can.
    pub fn bare(id: i64, student_id: i64, subject_id: i64, exam_id: i64, score: f64) -> Self {
        Self {
            id,
            student_id,
            subject_id,
            exam_id,
            score,
            grade: None,
            student_name: "Unknown".to_string(),
            admission_number: "N/A".to_string(),
            class_id: None,
            class_stream: "General".to_string(),
            form_level: "Unknown".to_string(),
        }
    }
}

/// Body of a create or update call against the results repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub student_id: i64,
    pub subject_id: i64,
    pub exam_id: i64,
    pub score: f64,
    pub grade: String,
}

// src/models/exam.rs

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Exam type tag. Selects the scoring rule applied at finalization.
///
/// Stored as plain text (`YKS_TYT`, `KPSS`, ...). Unknown tags are kept
/// verbatim in `Other` and scored with the raw-correct fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExamType {
    YksTyt,
    YksAyt,
    Kpss,
    Other(String),
}

impl ExamType {
    pub fn as_str(&self) -> &str {
        match self {
            ExamType::YksTyt => "YKS_TYT",
            ExamType::YksAyt => "YKS_AYT",
            ExamType::Kpss => "KPSS",
            ExamType::Other(tag) => tag,
        }
    }
}

impl From<String> for ExamType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "YKS_TYT" => ExamType::YksTyt,
            "YKS_AYT" => ExamType::YksAyt,
            "KPSS" => ExamType::Kpss,
            _ => ExamType::Other(tag),
        }
    }
}

impl From<&str> for ExamType {
    fn from(tag: &str) -> Self {
        ExamType::from(tag.to_string())
    }
}

impl From<ExamType> for String {
    fn from(exam_type: ExamType) -> Self {
        exam_type.as_str().to_string()
    }
}

impl fmt::Display for ExamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a row of the 'exams' table.
/// Read-only to the session core; a session keeps its own snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamDefinition {
    pub id: i64,
    pub title: String,
    pub exam_type: ExamType,
    pub total_questions: i32,
    pub duration_minutes: i32,
}

impl ExamDefinition {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.duration_minutes))
    }
}

/// Correct option per question of one exam.
/// Key: question id, value: the correct option id.
pub type AnswerKey = HashMap<i64, i64>;

//! Diagnostic request types supplied by the caller

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Classification task a model is trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ChestXray,
    SkinLesion,
    SymptomMl,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::ChestXray => "chest_xray",
            TaskType::SkinLesion => "skin_lesion",
            TaskType::SymptomMl => "symptom_ml",
        }
    }

    /// Whether requests for this task carry image bytes
    pub fn is_image(self) -> bool {
        matches!(self, TaskType::ChestXray | TaskType::SkinLesion)
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "chest_xray" => Ok(TaskType::ChestXray),
            "skin_lesion" => Ok(TaskType::SkinLesion),
            "symptom_ml" => Ok(TaskType::SymptomMl),
            other => Err(format!("unknown task type `{other}`")),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw image bytes with the task they should be classified for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub task_type: TaskType,
    pub bytes: Vec<u8>,
}

/// Set of reported symptom codes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymptomRequest {
    pub symptoms: BTreeSet<String>,
}

impl SymptomRequest {
    pub fn new<I, S>(symptoms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symptoms: symptoms.into_iter().map(Into::into).collect(),
        }
    }

    /// Codes trimmed and lower-cased, blanks removed
    pub fn normalized(&self) -> BTreeSet<String> {
        self.symptoms
            .iter()
            .map(|code| normalize_code(code))
            .filter(|code| !code.is_empty())
            .collect()
    }
}

/// Canonical form of a symptom or condition code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase()
}

/// A single diagnosis request. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticRequest {
    Image(ImageRequest),
    Symptom(SymptomRequest),
}

impl DiagnosticRequest {
    pub fn image(task_type: TaskType, bytes: Vec<u8>) -> Self {
        DiagnosticRequest::Image(ImageRequest { task_type, bytes })
    }

    pub fn symptoms<I, S>(symptoms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DiagnosticRequest::Symptom(SymptomRequest::new(symptoms))
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            DiagnosticRequest::Image(req) => req.task_type,
            DiagnosticRequest::Symptom(_) => TaskType::SymptomMl,
        }
    }
}

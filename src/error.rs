//! Typed failures raised by the orchestrator and its stages

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = DiagnosticError> = std::result::Result<T, E>;

/// Every failure the core can raise.
///
/// Payloads are plain strings so the error is `Clone`: a failed single-flight
/// load hands the same error to every waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiagnosticError {
    #[error("model `{0}` is already registered")]
    DuplicateModel(String),

    #[error("model `{0}` is not registered")]
    UnknownModel(String),

    #[error("invalid descriptor for `{id}`: {reason}")]
    InvalidDescriptor { id: String, reason: String },

    #[error("no model registered for task `{0}`")]
    NoModelForTask(String),

    #[error("failed to load model `{id}`: {reason}")]
    ModelLoad { id: String, reason: String },

    #[error("loading model `{id}` did not finish within {timeout_ms} ms")]
    ModelLoadTimeout { id: String, timeout_ms: u64 },

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("inference failed for `{id}`: {reason}")]
    Inference { id: String, reason: String },

    #[error("invalid merge configuration: {0}")]
    MergeConfiguration(String),
}

/// Discriminant of [`DiagnosticError`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateModel,
    UnknownModel,
    InvalidDescriptor,
    NoModelForTask,
    ModelLoad,
    ModelLoadTimeout,
    UnsupportedFormat,
    EmptyInput,
    Inference,
    MergeConfiguration,
}

/// Coarse grouping a caller renders differently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The model could not be made ready (missing, failed or slow load)
    ModelUnavailable,
    /// The caller-supplied input was rejected
    BadInput,
    /// Registry or policy set up incorrectly
    Configuration,
    /// The model ran but produced unusable output
    Internal,
}

impl DiagnosticError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiagnosticError::DuplicateModel(_) => ErrorKind::DuplicateModel,
            DiagnosticError::UnknownModel(_) => ErrorKind::UnknownModel,
            DiagnosticError::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            DiagnosticError::NoModelForTask(_) => ErrorKind::NoModelForTask,
            DiagnosticError::ModelLoad { .. } => ErrorKind::ModelLoad,
            DiagnosticError::ModelLoadTimeout { .. } => ErrorKind::ModelLoadTimeout,
            DiagnosticError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            DiagnosticError::EmptyInput(_) => ErrorKind::EmptyInput,
            DiagnosticError::Inference { .. } => ErrorKind::Inference,
            DiagnosticError::MergeConfiguration(_) => ErrorKind::MergeConfiguration,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    pub(crate) fn model_load(id: &str, reason: impl fmt::Display) -> Self {
        DiagnosticError::ModelLoad {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn inference(id: &str, reason: impl fmt::Display) -> Self {
        DiagnosticError::Inference {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_descriptor(id: &str, reason: impl fmt::Display) -> Self {
        DiagnosticError::InvalidDescriptor {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::UnknownModel
            | ErrorKind::NoModelForTask
            | ErrorKind::ModelLoad
            | ErrorKind::ModelLoadTimeout => ErrorCategory::ModelUnavailable,
            ErrorKind::UnsupportedFormat | ErrorKind::EmptyInput => ErrorCategory::BadInput,
            ErrorKind::DuplicateModel
            | ErrorKind::InvalidDescriptor
            | ErrorKind::MergeConfiguration => ErrorCategory::Configuration,
            ErrorKind::Inference => ErrorCategory::Internal,
        }
    }
}

/// Per-request pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Loading,
    Preprocessing,
    Inferring,
    Scoring,
    Merging,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Loading => "loading",
            Stage::Preprocessing => "preprocessing",
            Stage::Inferring => "inferring",
            Stage::Scoring => "scoring",
            Stage::Merging => "merging",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that ended in `Failed`, carrying the stage that raised the error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{stage} stage failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: DiagnosticError,
}

impl StageFailure {
    pub fn new(stage: Stage, error: DiagnosticError) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }
}

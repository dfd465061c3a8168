//! Diagnostic Inference Orchestrator Library
//!
//! Routes medical images and symptom sets through task-specific classifiers
//! and returns calibrated, ranked diagnoses. Symptom requests blend a
//! deterministic rule engine with the model's output.

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod preprocessing;
pub mod scoring;
pub mod types;

pub use config::AppConfig;
pub use error::{DiagnosticError, ErrorCategory, Stage, StageFailure};
pub use models::registry::ModelRegistry;
pub use orchestrator::DiagnosticOrchestrator;
pub use types::{
    ConfidenceBand, Diagnosis, DiagnosticReport, DiagnosticRequest, HybridResult, RankedResult,
    TaskType,
};

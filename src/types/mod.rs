//! Request and result types shared across the orchestrator

pub mod request;
pub mod result;

pub use request::{DiagnosticRequest, ImageRequest, SymptomRequest, TaskType};
pub use result::{
    BandThresholds, ConfidenceBand, Diagnosis, DiagnosticReport, HybridResult, RankedLabel,
    RankedResult, RuleScore,
};

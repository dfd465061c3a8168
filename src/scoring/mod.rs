//! Turning raw model output into ranked, explainable results

pub mod hybrid;
pub mod ranking;
pub mod rules;

pub use hybrid::{HybridMerger, HybridWeights};
pub use ranking::ConfidenceRanker;
pub use rules::{KnowledgeBase, RuleEngine};

//! Ranked diagnosis results returned to the caller

use crate::types::request::TaskType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Qualitative confidence bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    Low,
    Medium,
    High,
}

impl ConfidenceBand {
    /// Determine the band from a probability and thresholds
    pub fn from_probability(probability: f64, thresholds: &BandThresholds) -> Self {
        if probability >= thresholds.high {
            ConfidenceBand::High
        } else if probability >= thresholds.medium {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceBand::Low => "low",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::High => "high",
        }
    }
}

/// Configurable band thresholds (lower bounds, inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandThresholds {
    pub high: f64,
    pub medium: f64,
}

impl BandThresholds {
    /// Check that `0 <= medium <= high <= 1`
    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.high) || !in_unit(self.medium) {
            return Err(format!(
                "band thresholds must lie in [0, 1] (medium={}, high={})",
                self.medium, self.high
            ));
        }
        if self.medium > self.high {
            return Err(format!(
                "medium threshold {} exceeds high threshold {}",
                self.medium, self.high
            ));
        }
        Ok(())
    }
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            high: 0.85,
            medium: 0.6,
        }
    }
}

/// One label of a ranked distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedLabel {
    pub label: String,
    pub probability: f64,
    pub band: ConfidenceBand,
}

/// Labels sorted by descending probability, ties broken by label.
///
/// `entries` may be truncated to the requested top-K; `total_labels` is the
/// size of the full distribution the entries were taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub entries: Vec<RankedLabel>,
    pub total_labels: usize,
}

impl RankedResult {
    /// Rank a probability distribution and keep the first `top_k` entries.
    ///
    /// `top_k` of `None` keeps every label; larger values are clamped to the
    /// distribution size.
    pub fn from_distribution(
        distribution: Vec<(String, f64)>,
        thresholds: &BandThresholds,
        top_k: Option<usize>,
    ) -> Self {
        let total_labels = distribution.len();
        let mut entries: Vec<RankedLabel> = distribution
            .into_iter()
            .map(|(label, probability)| RankedLabel {
                band: ConfidenceBand::from_probability(probability, thresholds),
                label,
                probability,
            })
            .collect();

        entries.sort_by(compare_ranked);
        entries.truncate(top_k.unwrap_or(total_labels).min(total_labels));

        Self {
            entries,
            total_labels,
        }
    }

    /// Highest-probability label
    pub fn top(&self) -> Option<&RankedLabel> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankedLabel> {
        self.entries.iter()
    }

    pub fn probability_of(&self, label: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.probability)
    }

    /// Sum of the retained probabilities (1 for an untruncated result)
    pub fn probability_mass(&self) -> f64 {
        self.entries.iter().map(|entry| entry.probability).sum()
    }

    pub fn is_truncated(&self) -> bool {
        self.entries.len() < self.total_labels
    }
}

// Probabilities are finite here; `partial_cmp` treats -0.0 and 0.0 as equal
fn compare_ranked(a: &RankedLabel, b: &RankedLabel) -> Ordering {
    b.probability
        .partial_cmp(&a.probability)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.label.cmp(&b.label))
}

/// Rule-derived score per condition, each in [0, 1]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleScore(pub BTreeMap<String, f64>);

impl RuleScore {
    pub fn get(&self, condition: &str) -> Option<f64> {
        self.0.get(condition).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for RuleScore {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        RuleScore(iter.into_iter().collect())
    }
}

/// Merged rule/ML ranking together with the inputs it was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    pub ranked: RankedResult,
    pub rule_scores: RuleScore,
    pub ml_ranked: RankedResult,
    pub rule_weight: f64,
    pub ml_weight: f64,
}

/// Outcome of a successful request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnosis {
    Ranked(RankedResult),
    Hybrid(HybridResult),
}

impl Diagnosis {
    /// The final ranking, whichever path produced it
    pub fn ranked(&self) -> &RankedResult {
        match self {
            Diagnosis::Ranked(ranked) => ranked,
            Diagnosis::Hybrid(hybrid) => &hybrid.ranked,
        }
    }

    pub fn as_hybrid(&self) -> Option<&HybridResult> {
        match self {
            Diagnosis::Hybrid(hybrid) => Some(hybrid),
            Diagnosis::Ranked(_) => None,
        }
    }
}

/// Envelope handed back to the caller for rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Unique request identifier
    pub request_id: Uuid,

    /// Task the request was routed by
    pub task_type: TaskType,

    /// Model that produced the ML scores
    pub model_id: String,

    /// Ranked or hybrid result
    pub outcome: Diagnosis,

    /// Non-fatal issues met along the way (e.g. dropped symptom codes)
    #[serde(default)]
    pub warnings: Vec<String>,

    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

impl DiagnosticReport {
    pub fn new(task_type: TaskType, model_id: String, outcome: Diagnosis) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            task_type,
            model_id,
            outcome,
            warnings: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn top(&self) -> Option<&RankedLabel> {
        self.outcome.ranked().top()
    }

    /// True when the best label only reached the low band
    pub fn is_low_confidence(&self) -> bool {
        self.top()
            .map(|top| top.band == ConfidenceBand::Low)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(l, p)| (l.to_string(), *p)).collect()
    }

    #[test]
    fn test_band_from_probability() {
        let thresholds = BandThresholds::default();

        assert_eq!(ConfidenceBand::from_probability(0.1, &thresholds), ConfidenceBand::Low);
        assert_eq!(ConfidenceBand::from_probability(0.6, &thresholds), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_probability(0.849, &thresholds), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_probability(0.85, &thresholds), ConfidenceBand::High);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(BandThresholds::default().validate().is_ok());
        assert!(BandThresholds { high: 0.5, medium: 0.7 }.validate().is_err());
        assert!(BandThresholds { high: 1.2, medium: 0.7 }.validate().is_err());
    }

    #[test]
    fn test_ranking_order_and_tie_break() {
        let ranked = RankedResult::from_distribution(
            dist(&[("zeta", 0.25), ("alpha", 0.25), ("mid", 0.5)]),
            &BandThresholds::default(),
            None,
        );

        let labels: Vec<&str> = ranked.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["mid", "alpha", "zeta"]);
        assert!((ranked.probability_mass() - 1.0).abs() < 1e-12);
        assert!(!ranked.is_truncated());
    }

    #[test]
    fn test_top_k_truncation_clamped() {
        let thresholds = BandThresholds::default();
        let ranked = RankedResult::from_distribution(
            dist(&[("a", 0.7), ("b", 0.2), ("c", 0.1)]),
            &thresholds,
            Some(2),
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked.total_labels, 3);
        assert!(ranked.is_truncated());

        let ranked =
            RankedResult::from_distribution(dist(&[("a", 0.7), ("b", 0.3)]), &thresholds, Some(10));
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_report_serialization() {
        let ranked = RankedResult::from_distribution(
            dist(&[("normal", 0.9), ("pneumonia", 0.1)]),
            &BandThresholds::default(),
            None,
        );
        let report = DiagnosticReport::new(
            TaskType::ChestXray,
            "chest_xray_v1".to_string(),
            Diagnosis::Ranked(ranked),
        );

        let json = serde_json::to_string(&report).unwrap();
        let deserialized: DiagnosticReport = serde_json::from_str(&json).unwrap();

        assert_eq!(report.request_id, deserialized.request_id);
        assert_eq!(report.outcome, deserialized.outcome);
        assert!(!deserialized.is_low_confidence());
        assert!(json.contains("\"kind\":\"ranked\""));
    }
}

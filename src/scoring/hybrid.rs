//! Weighted merge of rule-engine scores with an ML ranking

use crate::error::{DiagnosticError, Result};
use crate::types::result::{BandThresholds, HybridResult, RankedResult, RuleScore};
use std::collections::BTreeMap;

/// Allowed deviation of `rule_weight + ml_weight` from 1
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Fixed linear weighting policy, validated once at construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    rule: f64,
    ml: f64,
}

impl HybridWeights {
    pub fn new(rule_weight: f64, ml_weight: f64) -> Result<Self> {
        let in_unit = |w: f64| w.is_finite() && (0.0..=1.0).contains(&w);
        if !in_unit(rule_weight) || !in_unit(ml_weight) {
            return Err(DiagnosticError::MergeConfiguration(format!(
                "weights must lie in [0, 1] (rule={rule_weight}, ml={ml_weight})"
            )));
        }
        if (rule_weight + ml_weight - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(DiagnosticError::MergeConfiguration(format!(
                "rule_weight + ml_weight must equal 1, got {}",
                rule_weight + ml_weight
            )));
        }
        Ok(Self {
            rule: rule_weight,
            ml: ml_weight,
        })
    }

    pub fn rule(&self) -> f64 {
        self.rule
    }

    pub fn ml(&self) -> f64 {
        self.ml
    }
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self { rule: 0.5, ml: 0.5 }
    }
}

/// Combines rule and ML scores into one ranked distribution.
///
/// The merge is a union over conditions: a condition missing from one source
/// scores 0 there. Combined scores are renormalized before ranking.
#[derive(Debug, Clone)]
pub struct HybridMerger {
    weights: HybridWeights,
    thresholds: BandThresholds,
}

impl HybridMerger {
    pub fn new(weights: HybridWeights, thresholds: BandThresholds) -> Self {
        Self { weights, thresholds }
    }

    pub fn weights(&self) -> HybridWeights {
        self.weights
    }

    /// Merge with the configured weights
    pub fn merge(&self, rule_scores: RuleScore, ml_ranked: RankedResult, top_k: Option<usize>) -> Result<HybridResult> {
        merge(rule_scores, ml_ranked, self.weights.rule, self.weights.ml, &self.thresholds, top_k)
    }

    /// Combined, not yet renormalized score per condition
    pub fn combined_scores(&self, rule_scores: &RuleScore, ml_ranked: &RankedResult) -> BTreeMap<String, f64> {
        combine(rule_scores, ml_ranked, self.weights.rule, self.weights.ml)
    }
}

/// Merge `rule_scores` and `ml_ranked` under explicit weights.
///
/// Fails with `MergeConfiguration` if the weights do not sum to 1, and with
/// `EmptyInput` if no condition carries any score.
pub fn merge(
    rule_scores: RuleScore,
    ml_ranked: RankedResult,
    rule_weight: f64,
    ml_weight: f64,
    thresholds: &BandThresholds,
    top_k: Option<usize>,
) -> Result<HybridResult> {
    let weights = HybridWeights::new(rule_weight, ml_weight)?;
    let combined = combine(&rule_scores, &ml_ranked, weights.rule, weights.ml);

    let total: f64 = combined.values().sum();
    if combined.is_empty() || total <= 0.0 {
        return Err(DiagnosticError::EmptyInput(
            "neither rules nor model produced a score".to_string(),
        ));
    }

    let distribution = combined
        .into_iter()
        .map(|(condition, score)| (condition, score / total))
        .collect();

    Ok(HybridResult {
        ranked: RankedResult::from_distribution(distribution, thresholds, top_k),
        rule_scores,
        ml_ranked,
        rule_weight: weights.rule,
        ml_weight: weights.ml,
    })
}

fn combine(rule_scores: &RuleScore, ml_ranked: &RankedResult, rule_weight: f64, ml_weight: f64) -> BTreeMap<String, f64> {
    let mut combined: BTreeMap<String, f64> = BTreeMap::new();

    for (condition, &score) in rule_scores.iter() {
        *combined.entry(condition.clone()).or_default() += rule_weight * score;
    }
    for entry in ml_ranked.iter() {
        *combined.entry(entry.label.clone()).or_default() += ml_weight * entry.probability;
    }
    combined
}

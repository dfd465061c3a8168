//! Calibration of raw model scores into ranked, banded probabilities

use crate::config::RankingConfig;
use crate::error::{DiagnosticError, Result};
use crate::models::inference::RawInference;
use crate::types::result::{BandThresholds, RankedResult};

/// Default tolerance for treating raw scores as an existing distribution
pub const DEFAULT_SIMPLEX_TOLERANCE: f64 = 1e-4;

/// Numerically stable softmax
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// True when every score is non-negative and the scores sum to 1 within `tolerance`
pub fn is_probability_simplex(scores: &[f64], tolerance: f64) -> bool {
    !scores.is_empty()
        && scores.iter().all(|&s| s >= -tolerance && s <= 1.0 + tolerance)
        && (scores.iter().sum::<f64>() - 1.0).abs() <= tolerance
}

/// Turns raw inference into a [`RankedResult`]
#[derive(Debug, Clone)]
pub struct ConfidenceRanker {
    thresholds: BandThresholds,
    simplex_tolerance: f64,
}

impl ConfidenceRanker {
    pub fn new(thresholds: BandThresholds, simplex_tolerance: f64) -> Self {
        Self {
            thresholds,
            simplex_tolerance,
        }
    }

    pub fn from_config(config: &RankingConfig) -> Self {
        Self::new(config.bands, config.simplex_tolerance)
    }

    pub fn thresholds(&self) -> &BandThresholds {
        &self.thresholds
    }

    /// Normalize the raw scores (unless they already form a distribution),
    /// assign bands and keep the `top_k` best labels.
    pub fn rank(&self, raw: &RawInference, top_k: Option<usize>) -> Result<RankedResult> {
        let distribution = self.calibrate(raw)?;
        let pairs = raw.labels().iter().cloned().zip(distribution).collect();
        Ok(RankedResult::from_distribution(pairs, &self.thresholds, top_k))
    }

    /// Probability distribution over the raw inference's labels
    pub fn calibrate(&self, raw: &RawInference) -> Result<Vec<f64>> {
        let scores = raw.scores();
        if scores.len() != raw.labels().len() {
            return Err(DiagnosticError::inference(
                raw.model_id(),
                format!("{} scores for {} labels", scores.len(), raw.labels().len()),
            ));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(DiagnosticError::inference(raw.model_id(), "non-finite score"));
        }

        if is_probability_simplex(scores, self.simplex_tolerance) {
            // Used as-is apart from clipping negative rounding noise; `+ 0.0` turns -0.0 into 0.0
            return Ok(scores.iter().map(|s| s.max(0.0) + 0.0).collect());
        }

        let temperature = raw.temperature().unwrap_or(1.0);
        let scaled: Vec<f64> = scores.iter().map(|s| s / temperature).collect();
        Ok(softmax(&scaled))
    }
}

impl Default for ConfidenceRanker {
    fn default() -> Self {
        Self::new(BandThresholds::default(), DEFAULT_SIMPLEX_TOLERANCE)
    }
}

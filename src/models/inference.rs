//! Forward passes over loaded models

use crate::error::{DiagnosticError, Result};
use crate::models::loader::LoadedModel;
use crate::preprocessing::PreparedTensor;
use std::time::Instant;
use tracing::debug;

/// Unnormalized per-label scores, indexed positionally by `labels`
#[derive(Debug, Clone, PartialEq)]
pub struct RawInference {
    model_id: String,
    scores: Vec<f64>,
    labels: Vec<String>,
    temperature: Option<f64>,
}

impl RawInference {
    pub fn new(
        model_id: impl Into<String>,
        scores: Vec<f64>,
        labels: Vec<String>,
        temperature: Option<f64>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            scores,
            labels,
            temperature,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Calibration temperature declared by the model's descriptor
    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }
}

/// Stateless inference engine.
///
/// Outputs are never cached and numerical failures are surfaced, not clamped.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceEngine;

impl InferenceEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run one forward pass
    pub fn infer(&self, model: &LoadedModel, tensor: &PreparedTensor) -> Result<RawInference> {
        let descriptor = model.descriptor();

        if tensor.shape() != &descriptor.input_shape {
            return Err(DiagnosticError::inference(
                &descriptor.id,
                format!(
                    "tensor shape {} does not match model input shape {}",
                    tensor.shape(),
                    descriptor.input_shape
                ),
            ));
        }

        let started = Instant::now();
        let outputs = model
            .backend()
            .forward(tensor.data(), tensor.shape())
            .map_err(|e| DiagnosticError::inference(&descriptor.id, format!("{e:#}")))?;

        if outputs.len() != descriptor.label_count() {
            return Err(DiagnosticError::inference(
                &descriptor.id,
                format!(
                    "model produced {} scores for {} labels",
                    outputs.len(),
                    descriptor.label_count()
                ),
            ));
        }
        if let Some(i) = outputs.iter().position(|v| !v.is_finite()) {
            return Err(DiagnosticError::inference(
                &descriptor.id,
                format!("non-finite score {} for label `{}`", outputs[i], descriptor.label_set[i]),
            ));
        }

        debug!(
            model = %descriptor.id,
            backend = model.backend().backend_type(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Inference complete"
        );

        Ok(RawInference::new(
            descriptor.id.clone(),
            outputs.into_iter().map(f64::from).collect(),
            descriptor.label_set.clone(),
            descriptor.temperature,
        ))
    }
}

//! Symptom-set to feature-vector encoding.
//!
//! Features follow the exact vocabulary order the model was trained with.

use super::{PreparedTensor, PreprocessingAdapter};
use crate::error::{DiagnosticError, Result};
use crate::models::descriptor::{InputShape, ModelDescriptor, PreprocessingSpec, SymptomSpec};
use crate::types::request::{normalize_code, DiagnosticRequest, SymptomRequest};
use std::collections::HashMap;
use tracing::warn;

/// Adapter for symptom-checker models.
///
/// Known codes set their feature to 1.0. Unknown codes are dropped and
/// recorded as warnings; a request left with no known code is rejected.
pub struct SymptomAdapter;

impl SymptomAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Encode a symptom set against `spec`'s vocabulary
    pub fn encode(&self, request: &SymptomRequest, spec: &SymptomSpec, shape: &InputShape) -> Result<PreparedTensor> {
        let positions: HashMap<String, usize> = spec
            .vocabulary
            .iter()
            .enumerate()
            .map(|(i, code)| (normalize_code(code), i))
            .collect();

        let mut features = vec![0.0_f32; spec.vocabulary.len()];
        let mut warnings = Vec::new();
        let mut matched = 0;

        for code in request.normalized() {
            match positions.get(&code) {
                Some(&i) => {
                    features[i] = 1.0;
                    matched += 1;
                }
                None => {
                    warn!(code = %code, "Dropping unknown symptom code");
                    warnings.push(format!("unknown symptom code `{code}` ignored"));
                }
            }
        }

        if matched == 0 {
            return Err(DiagnosticError::EmptyInput(
                "no known symptom codes in request".to_string(),
            ));
        }

        Ok(PreparedTensor::new(features, shape.clone())?.with_warnings(warnings))
    }

    /// Feature names in model order
    pub fn feature_names<'a>(&self, spec: &'a SymptomSpec) -> Vec<&'a str> {
        spec.vocabulary.iter().map(String::as_str).collect()
    }
}

impl Default for SymptomAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PreprocessingAdapter for SymptomAdapter {
    fn prepare(&self, request: &DiagnosticRequest, descriptor: &ModelDescriptor) -> Result<PreparedTensor> {
        match (request, &descriptor.preprocessing) {
            (DiagnosticRequest::Symptom(req), PreprocessingSpec::Symptoms(spec)) => {
                self.encode(req, spec, &descriptor.input_shape)
            }
            (DiagnosticRequest::Image(_), _) => Err(DiagnosticError::UnsupportedFormat(format!(
                "model `{}` expects a symptom set, got an image",
                descriptor.id
            ))),
            (_, spec) => Err(DiagnosticError::UnsupportedFormat(format!(
                "model `{}` uses `{}` preprocessing, not symptoms",
                descriptor.id,
                spec.key()
            ))),
        }
    }
}

//! Immutable model metadata

use crate::error::{DiagnosticError, Result};
use crate::types::request::{normalize_code, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Tensor shape a model consumes, without the batch dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputShape(pub Vec<usize>);

impl InputShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of scalars in a tensor of this shape
    pub fn element_count(&self) -> usize {
        self.0.iter().product()
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Memory order of image tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageLayout {
    /// `[height, width, channels]`
    #[default]
    Nhwc,
    /// `[channels, height, width]`
    Nchw,
}

fn default_scale() -> f32 {
    1.0 / 255.0
}

/// How raw pixels map onto the range a model was trained on:
/// `(pixel * scale - mean[c]) / std[c]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(default)]
    pub layout: ImageLayout,
    pub channels: usize,
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Per-channel mean; empty means 0, a single value applies to all channels
    #[serde(default)]
    pub mean: Vec<f32>,
    /// Per-channel std; empty means 1, a single value applies to all channels
    #[serde(default)]
    pub std: Vec<f32>,
}

impl ImageSpec {
    pub fn mean_for(&self, channel: usize) -> f32 {
        per_channel(&self.mean, channel, 0.0)
    }

    pub fn std_for(&self, channel: usize) -> f32 {
        per_channel(&self.std, channel, 1.0)
    }

    /// `(height, width, channels)` read from `shape` according to the layout
    pub fn dims(&self, shape: &InputShape) -> Option<(usize, usize, usize)> {
        match (self.layout, shape.dims()) {
            (ImageLayout::Nhwc, &[h, w, c]) => Some((h, w, c)),
            (ImageLayout::Nchw, &[c, h, w]) => Some((h, w, c)),
            _ => None,
        }
    }
}

fn per_channel(values: &[f32], channel: usize, fallback: f32) -> f32 {
    match values {
        [] => fallback,
        [single] => *single,
        many => many.get(channel).copied().unwrap_or(fallback),
    }
}

/// Ordered symptom vocabulary; position `i` is feature `i`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomSpec {
    pub vocabulary: Vec<String>,
}

/// Preprocessing a model expects, keyed by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreprocessingSpec {
    Image(ImageSpec),
    Symptoms(SymptomSpec),
}

impl PreprocessingSpec {
    pub fn key(&self) -> &'static str {
        match self {
            PreprocessingSpec::Image(_) => "image",
            PreprocessingSpec::Symptoms(_) => "symptoms",
        }
    }
}

fn default_version() -> u32 {
    1
}

/// Identity, shape and label set of a registered model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model id, e.g. `chest_xray_v1`
    pub id: String,
    pub task_type: TaskType,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Labels in model output order
    pub label_set: Vec<String>,
    pub input_shape: InputShape,
    pub preprocessing: PreprocessingSpec,
    /// Opaque path or URI of the weights artifact
    pub weights_location: String,
    /// Softmax temperature applied to logits
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl ModelDescriptor {
    pub fn preprocessing_key(&self) -> &'static str {
        self.preprocessing.key()
    }

    pub fn label_count(&self) -> usize {
        self.label_set.len()
    }

    /// Structural checks run at registration. Weights are validated at load.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(DiagnosticError::invalid_descriptor(&self.id, reason));

        if self.id.trim().is_empty() {
            return fail("id must not be empty".to_string());
        }
        if self.label_set.is_empty() {
            return fail("label_set must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for label in &self.label_set {
            if label.trim().is_empty() {
                return fail("labels must not be blank".to_string());
            }
            if !seen.insert(label.as_str()) {
                return fail(format!("duplicate label `{label}`"));
            }
        }
        if self.input_shape.rank() == 0 || self.input_shape.dims().contains(&0) {
            return fail(format!("invalid input shape {}", self.input_shape));
        }
        if let Some(t) = self.temperature {
            if !t.is_finite() || t <= 0.0 {
                return fail(format!("temperature must be finite and positive, got {t}"));
            }
        }

        match (&self.preprocessing, self.task_type.is_image()) {
            (PreprocessingSpec::Image(spec), true) => self.validate_image(spec),
            (PreprocessingSpec::Symptoms(spec), false) => self.validate_symptoms(spec),
            (spec, _) => fail(format!(
                "preprocessing `{}` does not fit task `{}`",
                spec.key(),
                self.task_type
            )),
        }
    }

    fn validate_image(&self, spec: &ImageSpec) -> Result<()> {
        let fail = |reason: String| Err(DiagnosticError::invalid_descriptor(&self.id, reason));

        let Some((_, _, channels)) = spec.dims(&self.input_shape) else {
            return fail(format!(
                "image input shape must have rank 3, got {}",
                self.input_shape
            ));
        };
        if channels != spec.channels {
            return fail(format!(
                "shape {} has {} channels but preprocessing declares {}",
                self.input_shape, channels, spec.channels
            ));
        }
        for (name, values) in [("mean", &spec.mean), ("std", &spec.std)] {
            if values.len() > 1 && values.len() != spec.channels {
                return fail(format!(
                    "{name} has {} values for {} channels",
                    values.len(),
                    spec.channels
                ));
            }
        }
        if spec.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return fail("std values must be finite and non-zero".to_string());
        }
        if !spec.scale.is_finite() || spec.mean.iter().any(|m| !m.is_finite()) {
            return fail("scale and mean must be finite".to_string());
        }
        Ok(())
    }

    fn validate_symptoms(&self, spec: &SymptomSpec) -> Result<()> {
        let fail = |reason: String| Err(DiagnosticError::invalid_descriptor(&self.id, reason));

        if spec.vocabulary.is_empty() {
            return fail("symptom vocabulary must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for code in &spec.vocabulary {
            let code = normalize_code(code);
            if code.is_empty() || !seen.insert(code.clone()) {
                return fail(format!("blank or duplicate symptom code `{code}`"));
            }
        }
        if self.input_shape.dims() != [spec.vocabulary.len()] {
            return fail(format!(
                "shape {} does not match vocabulary of {} codes",
                self.input_shape,
                spec.vocabulary.len()
            ));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_valid_descriptors() {
        assert!(image_descriptor("xr", &["normal", "pneumonia"], [8, 8, 1])
            .validate()
            .is_ok());
        assert!(symptom_descriptor("sym", &["flu", "cold"], &["fever", "cough"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let desc = image_descriptor("xr", &["normal", "normal"], [8, 8, 1]);
        let err = desc.validate().unwrap_err();
        assert!(matches!(err, DiagnosticError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let mut desc = image_descriptor("xr", &["normal", "pneumonia"], [8, 8, 3]);
        if let PreprocessingSpec::Image(spec) = &mut desc.preprocessing {
            spec.channels = 1;
        }
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_vocabulary_must_match_shape() {
        let mut desc = symptom_descriptor("sym", &["flu"], &["fever", "cough"]);
        desc.input_shape = InputShape::new(vec![3]);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_preprocessing_must_fit_task() {
        let mut desc = symptom_descriptor("sym", &["flu"], &["fever"]);
        desc.task_type = TaskType::SkinLesion;
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_nchw_dims() {
        let spec = ImageSpec {
            layout: ImageLayout::Nchw,
            channels: 3,
            scale: 1.0,
            mean: vec![0.5],
            std: vec![0.1, 0.2, 0.3],
        };
        assert_eq!(spec.dims(&InputShape::new(vec![3, 32, 16])), Some((32, 16, 3)));
        assert_eq!(spec.mean_for(2), 0.5);
        assert_eq!(spec.std_for(1), 0.2);
    }

    #[test]
    fn test_descriptor_deserializes_from_json() {
        let json = r#"{
            "id": "skin_v2",
            "task_type": "skin_lesion",
            "version": 2,
            "label_set": ["benign", "malignant"],
            "input_shape": [4, 4, 3],
            "weights_location": "models/skin_v2.onnx",
            "preprocessing": {"kind": "image", "channels": 3, "mean": [0.5], "std": [0.5]}
        }"#;
        let desc: ModelDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(desc.preprocessing_key(), "image");
        assert_eq!(desc.input_shape.element_count(), 48);
        assert!(desc.validate().is_ok());
    }
}

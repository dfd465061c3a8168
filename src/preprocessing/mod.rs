//! Task-specific preprocessing adapters
//!
//! Each adapter turns caller input into the exact tensor a registered model
//! expects. Adapters hold no state between calls.

pub mod image;
pub mod symptom;

pub use self::image::ImageAdapter;
pub use self::symptom::SymptomAdapter;

use crate::error::{DiagnosticError, Result};
use crate::models::descriptor::{InputShape, ModelDescriptor};
use crate::types::request::{DiagnosticRequest, TaskType};

/// Normalized model input with its shape contract
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTensor {
    data: Vec<f32>,
    shape: InputShape,
    warnings: Vec<String>,
}

impl PreparedTensor {
    /// Fails when `data` does not fill `shape` exactly
    pub fn new(data: Vec<f32>, shape: InputShape) -> Result<Self> {
        if data.len() != shape.element_count() {
            return Err(DiagnosticError::UnsupportedFormat(format!(
                "{} values cannot fill shape {}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            data,
            shape,
            warnings: Vec::new(),
        })
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &InputShape {
        &self.shape
    }

    /// Non-fatal issues recorded while preparing
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Converts raw request input into a model-ready tensor
pub trait PreprocessingAdapter: Send + Sync {
    fn prepare(&self, request: &DiagnosticRequest, descriptor: &ModelDescriptor) -> Result<PreparedTensor>;
}

static IMAGE_ADAPTER: ImageAdapter = ImageAdapter;
static SYMPTOM_ADAPTER: SymptomAdapter = SymptomAdapter;

/// Adapter responsible for a task type
pub fn adapter_for(task_type: TaskType) -> &'static dyn PreprocessingAdapter {
    match task_type {
        TaskType::ChestXray | TaskType::SkinLesion => &IMAGE_ADAPTER,
        TaskType::SymptomMl => &SYMPTOM_ADAPTER,
    }
}

/// Prepare `request` for the model described by `descriptor`
pub fn prepare(request: &DiagnosticRequest, descriptor: &ModelDescriptor) -> Result<PreparedTensor> {
    adapter_for(descriptor.task_type).prepare(request, descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_must_fill_shape() {
        let shape = InputShape::new(vec![2, 2]);
        assert!(PreparedTensor::new(vec![0.0; 4], shape.clone()).is_ok());

        let err = PreparedTensor::new(vec![0.0; 3], shape).unwrap_err();
        assert!(matches!(err, DiagnosticError::UnsupportedFormat(_)));
    }
}

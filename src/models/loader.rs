//! Weights loading and model backends

use crate::models::descriptor::{InputShape, ModelDescriptor};
use crate::scoring::ranking::softmax;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;

/// Executable forward pass of a loaded model
pub trait ModelBackend: Send + Sync {
    /// Run one forward pass over a flattened tensor of `shape`
    fn forward(&self, input: &[f32], shape: &InputShape) -> Result<Vec<f32>>;

    /// Backend type identifier
    fn backend_type(&self) -> &'static str;
}

/// Source of model backends, resolved from `weights_location`
pub trait WeightsLoader: Send + Sync {
    /// Materialize and validate the weights a descriptor points at
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelBackend>>;
}

/// A model bound to exactly one descriptor, owned by the registry
pub struct LoadedModel {
    descriptor: Arc<ModelDescriptor>,
    backend: Box<dyn ModelBackend>,
    loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    pub fn new(descriptor: Arc<ModelDescriptor>, backend: Box<dyn ModelBackend>) -> Self {
        Self {
            descriptor,
            backend,
            loaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn backend(&self) -> &dyn ModelBackend {
        self.backend.as_ref()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.descriptor.id)
            .field("backend", &self.backend.backend_type())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Output activation of a linear model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Raw logits
    #[default]
    None,
    /// Probabilities
    Softmax,
}

/// Dense single-layer classifier: `logits = W x + b`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearBackend {
    #[serde(default)]
    pub activation: Activation,
    /// One row per label
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearBackend {
    /// Check the weights against the descriptor's label count and input shape
    pub fn validate(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let labels = descriptor.label_count();
        let inputs = descriptor.input_shape.element_count();

        if self.weights.len() != labels {
            bail!(
                "weights have {} rows but the label set has {} labels",
                self.weights.len(),
                labels
            );
        }
        if self.bias.len() != labels {
            bail!("bias has {} values for {} labels", self.bias.len(), labels);
        }
        if let Some((row, len)) = self
            .weights
            .iter()
            .map(Vec::len)
            .enumerate()
            .find(|(_, len)| *len != inputs)
        {
            bail!(
                "weight row {} has {} values but input shape {} has {}",
                row,
                len,
                descriptor.input_shape,
                inputs
            );
        }
        if self
            .weights
            .iter()
            .flatten()
            .chain(self.bias.iter())
            .any(|v| !v.is_finite())
        {
            bail!("weights contain non-finite values");
        }
        Ok(())
    }
}

impl ModelBackend for LinearBackend {
    fn forward(&self, input: &[f32], _shape: &InputShape) -> Result<Vec<f32>> {
        let logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, bias)| {
                if row.len() != input.len() {
                    bail!("expected {} features, got {}", row.len(), input.len());
                }
                let sum: f64 = row
                    .iter()
                    .zip(input)
                    .map(|(w, x)| f64::from(*w) * f64::from(*x))
                    .sum();
                Ok(sum + f64::from(*bias))
            })
            .collect::<Result<_>>()?;

        let outputs = match self.activation {
            Activation::None => logits,
            Activation::Softmax => softmax(&logits),
        };
        Ok(outputs.into_iter().map(|v| v as f32).collect())
    }

    fn backend_type(&self) -> &'static str {
        "linear"
    }
}

/// On-disk weights document, tagged by `format`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum WeightsFile {
    Linear(LinearBackend),
}

/// Loads weights from the filesystem, choosing the backend by extension
pub struct FileWeightsLoader {
    /// Directory relative locations are resolved against
    base_dir: Option<PathBuf>,
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl FileWeightsLoader {
    /// Create a new loader with default settings (1 thread)
    pub fn new() -> Result<Self> {
        Self::with_threads(1)
    }

    /// Create a new loader with the given ONNX intra-op thread count
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        #[cfg(feature = "onnx")]
        {
            ort::init().commit()?;
            info!(onnx_threads = onnx_threads, "ONNX Runtime initialized");
        }
        Ok(Self {
            base_dir: None,
            onnx_threads: onnx_threads.max(1),
        })
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Resolve a location descriptor (`file://` URI or path) to a path
    pub fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location.strip_prefix("file://").unwrap_or(location));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn load_linear(&self, path: &Path, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelBackend>> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read weights from {}", path.display()))?;
        let file: WeightsFile = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt weights file {}", path.display()))?;
        let WeightsFile::Linear(backend) = file;
        backend.validate(descriptor)?;
        Ok(Box::new(backend))
    }
}

impl WeightsLoader for FileWeightsLoader {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelBackend>> {
        let path = self.resolve(&descriptor.weights_location);

        info!(
            model = %descriptor.id,
            path = %path.display(),
            threads = self.onnx_threads,
            "Loading model weights"
        );

        if !path.exists() {
            bail!("weights not found at {}", path.display());
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => self.load_linear(&path, descriptor),
            #[cfg(feature = "onnx")]
            Some("onnx") => Ok(Box::new(OnnxBackend::load(
                &path,
                &descriptor.id,
                self.onnx_threads,
            )?)),
            other => bail!(
                "unsupported weights format {:?} for {}",
                other.unwrap_or(""),
                path.display()
            ),
        }
    }
}

impl Default for FileWeightsLoader {
    fn default() -> Self {
        Self {
            base_dir: None,
            onnx_threads: 1,
        }
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::ModelBackend;
    use crate::models::descriptor::InputShape;
    use anyhow::{Context, Result};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use ort::value::Tensor;
    use std::path::Path;
    use std::sync::Mutex;
    use tracing::info;

    /// ONNX Runtime session with its discovered input/output names
    pub struct OnnxBackend {
        session: Mutex<Session>,
        input_name: String,
        output_name: String,
    }

    impl OnnxBackend {
        /// Load a single ONNX model from file
        pub fn load(path: &Path, name: &str, threads: usize) -> Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(threads)?
                .commit_from_file(path)
                .context(format!("Failed to load model from {:?}", path))?;

            let input_name = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "input".to_string());

            let output_name = session
                .outputs
                .iter()
                .find(|o| o.name.contains("prob") || o.name.contains("output"))
                .map(|o| o.name.clone())
                .unwrap_or_else(|| {
                    session
                        .outputs
                        .last()
                        .map(|o| o.name.clone())
                        .unwrap_or_else(|| "probabilities".to_string())
                });

            info!(
                model = %name,
                input = %input_name,
                output = %output_name,
                "ONNX session ready"
            );

            Ok(Self {
                session: Mutex::new(session),
                input_name,
                output_name,
            })
        }
    }

    impl ModelBackend for OnnxBackend {
        fn forward(&self, input: &[f32], shape: &InputShape) -> Result<Vec<f32>> {
            // Batch of one
            let mut dims = vec![1_i64];
            dims.extend(shape.dims().iter().map(|&d| d as i64));
            let input_tensor = Tensor::from_array((dims, input.to_vec()))
                .context("Failed to create input tensor")?;

            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            let outputs = session.run(ort::inputs![&self.input_name => input_tensor])?;

            let output = outputs
                .get(self.output_name.as_str())
                .with_context(|| format!("Missing output `{}`", self.output_name))?;
            let (_, data) = output.try_extract_tensor::<f32>()?;
            Ok(data.to_vec())
        }

        fn backend_type(&self) -> &'static str {
            "onnx"
        }
    }
}

//! Model catalog, weights loading and inference

pub mod descriptor;
pub mod inference;
pub mod loader;
pub mod registry;

pub use descriptor::{ModelDescriptor, PreprocessingSpec};
pub use inference::{InferenceEngine, RawInference};
pub use loader::{FileWeightsLoader, LoadedModel, ModelBackend, WeightsLoader};
pub use registry::{EvictionOutcome, ModelLease, ModelRegistry, RegistryStats};

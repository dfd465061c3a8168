//! Configuration management for the diagnostic orchestrator

use crate::models::descriptor::ModelDescriptor;
use crate::scoring::hybrid::HybridWeights;
use crate::scoring::ranking::DEFAULT_SIMPLEX_TOLERANCE;
use crate::types::request::TaskType;
use crate::types::result::BandThresholds;
use anyhow::{anyhow, bail, Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    /// Explicit task → model id routes; unrouted tasks use the latest version
    #[serde(default)]
    pub routing: BTreeMap<String, String>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Model descriptors registered at startup
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

/// Model registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of models kept in memory
    pub max_resident_models: usize,
    /// Load timeout in milliseconds (0 disables the timeout)
    pub load_timeout_ms: u64,
    /// Number of threads for ONNX inference per model
    pub onnx_threads: usize,
    /// Base directory for relative weights locations
    pub models_dir: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn load_timeout(&self) -> Option<Duration> {
        (self.load_timeout_ms > 0).then(|| Duration::from_millis(self.load_timeout_ms))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_resident_models: 4,
            load_timeout_ms: 30_000,
            onnx_threads: 1,
            models_dir: None,
        }
    }
}

/// Confidence ranking configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Tolerance for treating raw output as an existing distribution
    pub simplex_tolerance: f64,
    pub bands: BandThresholds,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            simplex_tolerance: DEFAULT_SIMPLEX_TOLERANCE,
            bands: BandThresholds::default(),
        }
    }
}

/// Rule/ML merge weights for the symptom path
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub rule_weight: f64,
    pub ml_weight: f64,
}

impl HybridConfig {
    pub fn weights(&self) -> crate::error::Result<HybridWeights> {
        HybridWeights::new(self.rule_weight, self.ml_weight)
    }
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            rule_weight: 0.5,
            ml_weight: 0.5,
        }
    }
}

/// Rule engine knowledge base location
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    /// TOML or JSON artifact; no path means an empty knowledge base
    pub path: Option<PathBuf>,
}

/// Batch runner configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent diagnoses
    pub workers: usize,
    /// Labels kept per result (0 keeps the full label set)
    pub default_top_k: usize,
}

impl PipelineConfig {
    pub fn top_k(&self) -> Option<usize> {
        (self.default_top_k > 0).then_some(self.default_top_k)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_top_k: 0,
        }
    }
}

/// Periodic metrics summary
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between summaries (0 disables the reporter)
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app.validate()?;
        Ok(app)
    }

    /// Reject inconsistent policy before anything is built from it
    pub fn validate(&self) -> Result<()> {
        self.ranking
            .bands
            .validate()
            .map_err(|reason| anyhow!("invalid [ranking.bands]: {reason}"))?;
        if !(self.ranking.simplex_tolerance >= 0.0 && self.ranking.simplex_tolerance < 1.0) {
            bail!(
                "invalid [ranking] simplex_tolerance {}",
                self.ranking.simplex_tolerance
            );
        }
        self.hybrid.weights().context("invalid [hybrid] weights")?;
        if self.registry.max_resident_models == 0 {
            bail!("[registry] max_resident_models must be at least 1");
        }
        if self.pipeline.workers == 0 {
            bail!("[pipeline] workers must be at least 1");
        }
        for (task, id) in self.routes()? {
            match self.models.iter().find(|m| m.id == id) {
                Some(model) if model.task_type != task => bail!(
                    "[routing] {task} points at model `{id}` which serves {}",
                    model.task_type
                ),
                _ => {}
            }
        }
        Ok(())
    }

    /// `[routing]` with keys parsed into task types
    pub fn routes(&self) -> Result<BTreeMap<TaskType, String>> {
        self.routing
            .iter()
            .map(|(task, id)| {
                let task = task
                    .parse::<TaskType>()
                    .map_err(|reason| anyhow!("invalid [routing] key: {reason}"))?;
                Ok((task, id.clone()))
            })
            .collect()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            ranking: RankingConfig::default(),
            hybrid: HybridConfig::default(),
            knowledge_base: KnowledgeBaseConfig::default(),
            routing: BTreeMap::new(),
            pipeline: PipelineConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            models: Vec::new(),
        }
    }
}

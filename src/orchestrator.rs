//! Request façade: routing plus the per-request stage machine

use crate::config::AppConfig;
use crate::error::{DiagnosticError, Stage, StageFailure};
use crate::metrics::DiagnosticMetrics;
use crate::models::descriptor::ModelDescriptor;
use crate::models::inference::InferenceEngine;
use crate::models::registry::ModelRegistry;
use crate::preprocessing;
use crate::scoring::hybrid::{HybridMerger, HybridWeights};
use crate::scoring::ranking::ConfidenceRanker;
use crate::scoring::rules::{KnowledgeBase, RuleEngine};
use crate::types::request::{DiagnosticRequest, TaskType};
use crate::types::result::{Diagnosis, DiagnosticReport};
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Tracks one request through `Received → … → Completed | Failed`
struct StageTracker {
    task: TaskType,
    stage: Stage,
}

impl StageTracker {
    fn new(task: TaskType) -> Self {
        debug!(task = %task, stage = %Stage::Received, "Request received");
        Self {
            task,
            stage: Stage::Received,
        }
    }

    fn enter(&mut self, next: Stage) {
        debug!(task = %self.task, from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
    }

    /// Move to `Failed`, keeping the stage that raised `error`
    fn fail(&mut self, error: DiagnosticError) -> StageFailure {
        let failed_in = self.stage;
        warn!(
            task = %self.task,
            stage = %failed_in,
            kind = ?error.kind(),
            error = %error,
            "Request failed"
        );
        self.stage = Stage::Failed;
        StageFailure::new(failed_in, error)
    }
}

/// Entry point for diagnoses.
///
/// Holds no per-request state; every model it touches is owned by the
/// registry and only leased for the duration of a call.
pub struct DiagnosticOrchestrator {
    registry: Arc<ModelRegistry>,
    engine: InferenceEngine,
    ranker: ConfidenceRanker,
    rules: RuleEngine,
    weights: HybridWeights,
    routes: BTreeMap<TaskType, String>,
    default_top_k: Option<usize>,
    metrics: Option<Arc<DiagnosticMetrics>>,
}

impl DiagnosticOrchestrator {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            engine: InferenceEngine::new(),
            ranker: ConfidenceRanker::default(),
            rules: RuleEngine::default(),
            weights: HybridWeights::default(),
            routes: BTreeMap::new(),
            default_top_k: None,
            metrics: None,
        }
    }

    /// Build the registry, register configured models and load the knowledge base
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let registry = Arc::new(ModelRegistry::from_config(&config.registry)?);
        for descriptor in &config.models {
            registry
                .register(descriptor.clone())
                .with_context(|| format!("Failed to register model `{}`", descriptor.id))?;
        }

        let knowledge_base = match &config.knowledge_base.path {
            Some(path) => KnowledgeBase::load_from_path(path)?,
            None => {
                warn!("No knowledge base configured; rule scores will be empty");
                KnowledgeBase::default()
            }
        };

        let mut orchestrator = Self::new(registry)
            .with_ranker(ConfidenceRanker::from_config(&config.ranking))
            .with_knowledge_base(knowledge_base)
            .with_hybrid_weights(config.hybrid.weights()?)
            .with_default_top_k(config.pipeline.top_k());
        for (task, id) in config.routes()? {
            orchestrator = orchestrator.with_route(task, id);
        }

        info!(
            models = config.models.len(),
            routes = config.routing.len(),
            conditions = orchestrator.rules.knowledge_base().len(),
            "Orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn with_ranker(mut self, ranker: ConfidenceRanker) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn with_knowledge_base(mut self, knowledge_base: KnowledgeBase) -> Self {
        self.rules = RuleEngine::new(knowledge_base);
        self
    }

    pub fn with_hybrid_weights(mut self, weights: HybridWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Pin `task` to a specific model id instead of the latest version
    pub fn with_route(mut self, task: TaskType, model_id: impl Into<String>) -> Self {
        self.routes.insert(task, model_id.into());
        self
    }

    pub fn with_default_top_k(mut self, top_k: Option<usize>) -> Self {
        self.default_top_k = top_k;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DiagnosticMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> Option<&Arc<DiagnosticMetrics>> {
        self.metrics.as_ref()
    }

    /// Descriptor that serves `task`: the explicit route, else the latest version
    pub fn resolve(&self, task: TaskType) -> Result<Arc<ModelDescriptor>, DiagnosticError> {
        let descriptor = match self.routes.get(&task) {
            Some(id) => self
                .registry
                .descriptor(id)
                .ok_or_else(|| DiagnosticError::UnknownModel(id.clone()))?,
            None => self
                .registry
                .latest_for_task(task)
                .ok_or_else(|| DiagnosticError::NoModelForTask(task.to_string()))?,
        };

        if descriptor.task_type != task {
            return Err(DiagnosticError::NoModelForTask(format!(
                "{task} (routed model `{}` serves {})",
                descriptor.id, descriptor.task_type
            )));
        }
        Ok(descriptor)
    }

    /// Diagnose with the default top-K
    pub fn diagnose(&self, request: &DiagnosticRequest) -> Result<DiagnosticReport, StageFailure> {
        self.diagnose_with(request, self.default_top_k)
    }

    /// Diagnose, keeping at most `top_k` labels (`None` keeps all)
    pub fn diagnose_with(
        &self,
        request: &DiagnosticRequest,
        top_k: Option<usize>,
    ) -> Result<DiagnosticReport, StageFailure> {
        let started = Instant::now();
        let mut tracker = StageTracker::new(request.task_type());

        let result = self.run(request, top_k, &mut tracker);

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(report) => metrics.record_success(started.elapsed(), report),
                Err(failure) => metrics.record_failure(started.elapsed(), failure.stage),
            }
        }
        result
    }

    fn run(
        &self,
        request: &DiagnosticRequest,
        top_k: Option<usize>,
        tracker: &mut StageTracker,
    ) -> Result<DiagnosticReport, StageFailure> {
        let task = request.task_type();

        tracker.enter(Stage::Loading);
        let descriptor = self.resolve(task).map_err(|e| tracker.fail(e))?;
        let model = self
            .registry
            .get_or_load(&descriptor.id)
            .map_err(|e| tracker.fail(e))?;

        tracker.enter(Stage::Preprocessing);
        let tensor = preprocessing::prepare(request, model.descriptor()).map_err(|e| tracker.fail(e))?;

        tracker.enter(Stage::Inferring);
        let inference_started = Instant::now();
        let raw = self.engine.infer(&model, &tensor).map_err(|e| tracker.fail(e))?;
        if let Some(metrics) = &self.metrics {
            metrics.record_model_time(model.id(), inference_started.elapsed());
        }
        // Scoring needs only the raw output
        drop(model);

        tracker.enter(Stage::Scoring);
        let outcome = match request {
            DiagnosticRequest::Image(_) => {
                let ranked = self.ranker.rank(&raw, top_k).map_err(|e| tracker.fail(e))?;
                Diagnosis::Ranked(ranked)
            }
            DiagnosticRequest::Symptom(symptoms) => {
                let ml_ranked = self.ranker.rank(&raw, None).map_err(|e| tracker.fail(e))?;
                let rule_scores = self.rules.score(&symptoms.normalized());

                tracker.enter(Stage::Merging);
                let merger = HybridMerger::new(self.weights, *self.ranker.thresholds());
                let hybrid = merger
                    .merge(rule_scores, ml_ranked, top_k)
                    .map_err(|e| tracker.fail(e))?;
                Diagnosis::Hybrid(hybrid)
            }
        };

        tracker.enter(Stage::Completed);
        let report = DiagnosticReport::new(task, descriptor.id.clone(), outcome)
            .with_warnings(tensor.warnings().to_vec());
        debug!(
            request_id = %report.request_id,
            model = %report.model_id,
            top = report.top().map(|t| t.label.as_str()).unwrap_or(""),
            "Diagnosis complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::error::ErrorCategory;
    use crate::models::descriptor::fixtures::{image_descriptor, symptom_descriptor};
    use crate::models::loader::FileWeightsLoader;
    use crate::types::result::ConfidenceBand;
    use ::image::{DynamicImage, ImageFormat, Luma, GrayImage};
    use std::io::Cursor;
    use std::path::Path;

    fn white_png() -> Vec<u8> {
        let img = GrayImage::from_pixel(8, 8, Luma([255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn write_linear(dir: &Path, name: &str, weights: &str, bias: &str) {
        std::fs::write(
            dir.join(name),
            format!(r#"{{"format":"linear","activation":"none","weights":{weights},"bias":{bias}}}"#),
        )
        .unwrap();
    }

    fn registry(dir: &Path) -> Arc<ModelRegistry> {
        let loader = FileWeightsLoader::default().with_base_dir(dir);
        Arc::new(ModelRegistry::new(&RegistryConfig::default(), Arc::new(loader)))
    }

    fn symptom_orchestrator(dir: &Path) -> DiagnosticOrchestrator {
        // flu fires on fever+cough, cold on cough+sneezing; logits [0, ln 1.5] give ml {flu: 0.4, cold: 0.6}
        write_linear(
            dir,
            "symptoms_v1.json",
            "[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]",
            "[0.0, 0.4054651081081644]",
        );
        let registry = registry(dir);
        registry
            .register(symptom_descriptor(
                "symptoms_v1",
                &["flu", "cold"],
                &["fever", "cough", "sneezing"],
            ))
            .unwrap();

        DiagnosticOrchestrator::new(registry).with_knowledge_base(KnowledgeBase::from_entries([
            ("flu", vec![("fever", 0.5), ("cough", 0.3)]),
        ]))
    }

    #[test]
    fn test_chest_xray_normal_first() {
        let dir = tempfile::tempdir().unwrap();
        write_linear(
            dir.path(),
            "chest_xray_v1.json",
            "[[1.0, 1.0, 1.0, 1.0], [-1.0, -1.0, -1.0, -1.0]]",
            "[0.0, 0.0]",
        );
        let registry = registry(dir.path());
        registry
            .register(image_descriptor("chest_xray_v1", &["normal", "pneumonia"], [2, 2, 1]))
            .unwrap();
        let orchestrator = DiagnosticOrchestrator::new(registry.clone());

        let report = orchestrator
            .diagnose(&DiagnosticRequest::image(TaskType::ChestXray, white_png()))
            .unwrap();

        let top = report.top().unwrap();
        assert_eq!(report.model_id, "chest_xray_v1");
        assert_eq!(top.label, "normal");
        assert!(top.probability >= 0.5);
        assert_eq!(top.band, ConfidenceBand::High);
        assert!(matches!(report.outcome, Diagnosis::Ranked(_)));
        assert!(registry.is_resident("chest_xray_v1"));
    }

    #[test]
    fn test_symptom_path_merges_rules_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = symptom_orchestrator(dir.path());

        let report = orchestrator
            .diagnose(&DiagnosticRequest::symptoms(["fever", "cough"]))
            .unwrap();

        let hybrid = report.outcome.as_hybrid().unwrap();
        assert_eq!(hybrid.rule_scores.get("flu").map(|s| (s * 10.0).round()), Some(8.0));
        assert!((hybrid.ml_ranked.probability_of("cold").unwrap() - 0.6).abs() < 1e-6);
        assert!((hybrid.ranked.probability_of("flu").unwrap() - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(report.top().unwrap().label, "flu");
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_unknown_symptoms_surface_as_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = symptom_orchestrator(dir.path());

        let report = orchestrator
            .diagnose(&DiagnosticRequest::symptoms(["fever", "third_eye"]))
            .unwrap();
        assert_eq!(report.warnings.len(), 1);

        let failure = orchestrator
            .diagnose(&DiagnosticRequest::symptoms(["third_eye"]))
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Preprocessing);
        assert_eq!(failure.category(), ErrorCategory::BadInput);
    }

    #[test]
    fn test_missing_model_fails_in_loading() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = DiagnosticOrchestrator::new(registry(dir.path()));

        let failure = orchestrator
            .diagnose(&DiagnosticRequest::image(TaskType::SkinLesion, white_png()))
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Loading);
        assert!(matches!(failure.error, DiagnosticError::NoModelForTask(_)));
        assert_eq!(failure.category(), ErrorCategory::ModelUnavailable);

        let registry = orchestrator.registry().clone();
        registry
            .register(image_descriptor("chest_xray_v1", &["normal", "pneumonia"], [2, 2, 1]))
            .unwrap();
        let failure = orchestrator
            .diagnose(&DiagnosticRequest::image(TaskType::ChestXray, white_png()))
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Loading);
        assert!(matches!(failure.error, DiagnosticError::ModelLoad { .. }));
    }

    #[test]
    fn test_routes_override_latest_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let mut v1 = image_descriptor("xr_v1", &["normal", "pneumonia"], [2, 2, 1]);
        v1.version = 1;
        let mut v2 = image_descriptor("xr_v2", &["normal", "pneumonia"], [2, 2, 1]);
        v2.version = 2;
        registry.register(v1).unwrap();
        registry.register(v2).unwrap();

        let latest = DiagnosticOrchestrator::new(registry.clone());
        assert_eq!(latest.resolve(TaskType::ChestXray).unwrap().id, "xr_v2");

        let pinned = DiagnosticOrchestrator::new(registry).with_route(TaskType::ChestXray, "xr_v1");
        assert_eq!(pinned.resolve(TaskType::ChestXray).unwrap().id, "xr_v1");
    }

    #[test]
    fn test_top_k_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(DiagnosticMetrics::new());
        let orchestrator = symptom_orchestrator(dir.path()).with_metrics(metrics.clone());

        let report = orchestrator
            .diagnose_with(&DiagnosticRequest::symptoms(["cough"]), Some(1))
            .unwrap();
        assert_eq!(report.outcome.ranked().len(), 1);
        assert_eq!(report.outcome.ranked().total_labels, 2);

        let _ = orchestrator.diagnose(&DiagnosticRequest::symptoms(Vec::<String>::new()));

        use std::sync::atomic::Ordering;
        assert_eq!(metrics.requests_completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.requests_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_model_stats()["symptoms_v1"].calls, 1);
    }
}

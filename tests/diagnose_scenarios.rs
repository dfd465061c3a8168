use diagnostic_orchestrator::config::RegistryConfig;
use diagnostic_orchestrator::models::descriptor::{InputShape, ModelDescriptor, PreprocessingSpec, SymptomSpec};
use diagnostic_orchestrator::models::loader::{Activation, LinearBackend, ModelBackend, WeightsLoader};
use diagnostic_orchestrator::scoring::rules::KnowledgeBase;
use diagnostic_orchestrator::{
    AppConfig, ConfidenceBand, DiagnosticError, DiagnosticOrchestrator, DiagnosticRequest, ErrorCategory,
    ModelRegistry, Stage, TaskType,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn gray_png(level: u8) -> Vec<u8> {
    let img = GrayImage::from_pixel(12, 12, Luma([level]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Writes weights, knowledge base and config into `dir` and loads the config
fn scenario_config(dir: &Path, xray_weights: &str) -> AppConfig {
    std::fs::create_dir_all(dir.join("models")).unwrap();
    std::fs::write(
        dir.join("models/chest_xray_v1.json"),
        format!(r#"{{"format":"linear","weights":{xray_weights},"bias":[0.0,0.0]}}"#),
    )
    .unwrap();
    // Constant logits [0, ln 1.5]: the model always says flu 0.4, cold 0.6
    std::fs::write(
        dir.join("models/symptoms_v1.json"),
        r#"{"format":"linear","activation":"none","weights":[[0.0,0.0,0.0],[0.0,0.0,0.0]],"bias":[0.0,0.4054651081081644]}"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("knowledge_base.toml"),
        "[conditions.flu]\nfever = 0.5\ncough = 0.3\n",
    )
    .unwrap();

    let config_path = dir.join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[registry]
max_resident_models = 2
load_timeout_ms = 5000
models_dir = "{dir}"

[knowledge_base]
path = "{dir}/knowledge_base.toml"

[metrics]
report_interval_secs = 0

[[models]]
id = "chest_xray_v1"
task_type = "chest_xray"
label_set = ["normal", "pneumonia"]
input_shape = [2, 2, 1]
weights_location = "models/chest_xray_v1.json"
[models.preprocessing]
kind = "image"
channels = 1

[[models]]
id = "symptoms_v1"
task_type = "symptom_ml"
label_set = ["flu", "cold"]
input_shape = [3]
weights_location = "models/symptoms_v1.json"
[models.preprocessing]
kind = "symptoms"
vocabulary = ["fever", "cough", "sneezing"]
"#,
            dir = dir.display()
        ),
    )
    .unwrap();

    AppConfig::load_from_path(&config_path).unwrap()
}

#[test]
fn chest_xray_normal_image_ranks_normal_first() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(
        dir.path(),
        "[[1.0, 1.0, 1.0, 1.0], [-1.0, -1.0, -1.0, -1.0]]",
    );
    let orchestrator = DiagnosticOrchestrator::from_config(&config).unwrap();

    let report = orchestrator
        .diagnose(&DiagnosticRequest::image(TaskType::ChestXray, gray_png(250)))
        .unwrap();

    let ranked = report.outcome.ranked();
    assert_eq!(report.model_id, "chest_xray_v1");
    assert_eq!(ranked.entries[0].label, "normal");
    assert!(ranked.entries[0].probability >= 0.5);
    assert!((ranked.probability_mass() - 1.0).abs() < 1e-4);
    assert!(!report.is_low_confidence());
}

#[test]
fn symptom_hybrid_matches_rule_and_model_blend() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path(), "[[0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]");
    let orchestrator = DiagnosticOrchestrator::from_config(&config).unwrap();

    let report = orchestrator
        .diagnose(&DiagnosticRequest::symptoms(["Fever ", "cough"]))
        .unwrap();

    let hybrid = report.outcome.as_hybrid().unwrap();
    assert!((hybrid.rule_scores.get("flu").unwrap() - 0.8).abs() < 1e-9);
    assert!((hybrid.ml_ranked.probability_of("flu").unwrap() - 0.4).abs() < 1e-6);

    let labels: Vec<&str> = hybrid.ranked.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(labels, vec!["flu", "cold"]);
    assert!((hybrid.ranked.probability_of("flu").unwrap() - 0.667).abs() < 1e-3);
    assert!((hybrid.ranked.probability_of("cold").unwrap() - 0.333).abs() < 1e-3);
}

#[test]
fn error_categories_separate_unavailable_bad_input_and_low_confidence() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path(), "[[0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]");
    let orchestrator = DiagnosticOrchestrator::from_config(&config).unwrap();

    // Undecodable bytes
    let failure = orchestrator
        .diagnose(&DiagnosticRequest::image(TaskType::ChestXray, b"not an image".to_vec()))
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Preprocessing);
    assert_eq!(failure.category(), ErrorCategory::BadInput);
    assert!(matches!(failure.error, DiagnosticError::UnsupportedFormat(_)));

    // No model serves skin lesions
    let failure = orchestrator
        .diagnose(&DiagnosticRequest::image(TaskType::SkinLesion, gray_png(10)))
        .unwrap_err();
    assert_eq!(failure.category(), ErrorCategory::ModelUnavailable);

    // A model with no opinion yields a successful but low-confidence result
    let report = orchestrator
        .diagnose(&DiagnosticRequest::image(TaskType::ChestXray, gray_png(128)))
        .unwrap();
    assert!(report.is_low_confidence());
    assert_eq!(report.top().unwrap().band, ConfidenceBand::Low);
    assert_eq!(report.top().unwrap().label, "normal");
}

#[test]
fn missing_weights_surface_as_model_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = scenario_config(dir.path(), "[[0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]");
    std::fs::remove_file(dir.path().join("models/chest_xray_v1.json")).unwrap();
    let orchestrator = DiagnosticOrchestrator::from_config(&config).unwrap();

    for _ in 0..2 {
        let failure = orchestrator
            .diagnose(&DiagnosticRequest::image(TaskType::ChestXray, gray_png(200)))
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Loading);
        assert!(matches!(failure.error, DiagnosticError::ModelLoad { .. }));
        assert_eq!(failure.category(), ErrorCategory::ModelUnavailable);
    }
    // Failed loads are not cached; each request tried again
    assert_eq!(orchestrator.registry().stats().loads_failed, 2);
}

/// In-memory loader that counts calls and takes a while to "read" weights
struct SlowLoader {
    loads: AtomicUsize,
    delay: Duration,
}

impl WeightsLoader for SlowLoader {
    fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<Box<dyn ModelBackend>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let inputs = descriptor.input_shape.element_count();
        Ok(Box::new(LinearBackend {
            activation: Activation::None,
            weights: vec![vec![0.5; inputs], vec![0.1; inputs]],
            bias: vec![0.0, 0.0],
        }))
    }
}

fn slow_orchestrator(delay: Duration) -> (DiagnosticOrchestrator, Arc<SlowLoader>) {
    let loader = Arc::new(SlowLoader {
        loads: AtomicUsize::new(0),
        delay,
    });
    let registry = Arc::new(ModelRegistry::new(&RegistryConfig::default(), loader.clone()));
    registry
        .register(ModelDescriptor {
            id: "symptoms_v1".to_string(),
            task_type: TaskType::SymptomMl,
            version: 1,
            label_set: vec!["flu".to_string(), "cold".to_string()],
            input_shape: InputShape::new(vec![2]),
            preprocessing: PreprocessingSpec::Symptoms(SymptomSpec {
                vocabulary: vec!["fever".to_string(), "cough".to_string()],
            }),
            weights_location: "memory://symptoms_v1".to_string(),
            temperature: None,
        })
        .unwrap();

    let orchestrator = DiagnosticOrchestrator::new(registry).with_knowledge_base(KnowledgeBase::from_entries([
        ("flu", vec![("fever", 0.6)]),
        ("cold", vec![("cough", 0.6)]),
    ]));
    (orchestrator, loader)
}

#[test]
fn concurrent_requests_share_one_load() {
    let (orchestrator, loader) = slow_orchestrator(Duration::from_millis(100));
    let orchestrator = Arc::new(orchestrator);
    let barrier = Arc::new(Barrier::new(12));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                orchestrator.diagnose(&DiagnosticRequest::symptoms(["fever"]))
            })
        })
        .collect();

    for handle in handles {
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.top().unwrap().label, "flu");
    }
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[test]
fn eviction_under_contention_keeps_requests_working() {
    let (orchestrator, loader) = slow_orchestrator(Duration::from_millis(5));
    let orchestrator = Arc::new(orchestrator);
    let barrier = Arc::new(Barrier::new(5));

    let evictor = {
        let orchestrator = orchestrator.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..50 {
                orchestrator.registry().evict("symptoms_v1");
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..20)
                    .map(|_| orchestrator.diagnose(&DiagnosticRequest::symptoms(["fever", "cough"])))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    evictor.join().unwrap();
    for worker in workers {
        for result in worker.join().unwrap() {
            assert!(result.is_ok());
        }
    }
    assert!(loader.loads.load(Ordering::SeqCst) >= 1);
    assert!(orchestrator.registry().stats().resident <= 1);
}

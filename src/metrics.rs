//! Performance metrics and outcome statistics for the diagnostic orchestrator.

use crate::error::Stage;
use crate::models::registry::{ModelRegistry, RegistryStats};
use crate::types::result::{ConfidenceBand, DiagnosticReport};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

const MAX_LATENCY_SAMPLES: usize = 10_000;
const MAX_MODEL_SAMPLES: usize = 1_000;

/// Metrics collector shared by every request
pub struct DiagnosticMetrics {
    /// Requests that reached `Completed`
    pub requests_completed: AtomicU64,
    /// Requests that reached `Failed`
    pub requests_failed: AtomicU64,
    /// Failures keyed by the stage that raised them
    failures_by_stage: RwLock<BTreeMap<Stage, u64>>,
    /// Top-label band counts, indexed low / medium / high
    band_counts: RwLock<[u64; 3]>,
    /// End-to-end request latencies (in microseconds)
    latencies: RwLock<Vec<u64>>,
    /// Forward pass times per model (in microseconds)
    model_times: RwLock<HashMap<String, Vec<u64>>>,
    start_time: Instant,
}

impl DiagnosticMetrics {
    pub fn new() -> Self {
        Self {
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            failures_by_stage: RwLock::new(BTreeMap::new()),
            band_counts: RwLock::new([0; 3]),
            latencies: RwLock::new(Vec::with_capacity(1000)),
            model_times: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a completed request
    pub fn record_success(&self, latency: Duration, report: &DiagnosticReport) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);

        if let Some(top) = report.top() {
            let index = match top.band {
                ConfidenceBand::Low => 0,
                ConfidenceBand::Medium => 1,
                ConfidenceBand::High => 2,
            };
            if let Ok(mut bands) = self.band_counts.write() {
                bands[index] += 1;
            }
        }
    }

    /// Record a request that failed in `stage`
    pub fn record_failure(&self, latency: Duration, stage: Stage) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);

        if let Ok(mut by_stage) = self.failures_by_stage.write() {
            *by_stage.entry(stage).or_insert(0) += 1;
        }
    }

    /// Record a forward pass time
    pub fn record_model_time(&self, model_id: &str, duration: Duration) {
        if let Ok(mut times) = self.model_times.write() {
            let model_times = times.entry(model_id.to_string()).or_default();
            model_times.push(duration.as_micros() as u64);
            if model_times.len() > MAX_MODEL_SAMPLES {
                model_times.drain(0..MAX_MODEL_SAMPLES / 2);
            }
        }
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut times) = self.latencies.write() {
            times.push(latency.as_micros() as u64);
            if times.len() > MAX_LATENCY_SAMPLES {
                times.drain(0..MAX_LATENCY_SAMPLES / 2);
            }
        }
    }

    /// Request latency statistics
    pub fn get_latency_stats(&self) -> LatencyStats {
        match self.latencies.read() {
            Ok(times) => LatencyStats::from_samples(&times),
            Err(_) => LatencyStats::default(),
        }
    }

    /// Per-model inference time statistics
    pub fn get_model_stats(&self) -> BTreeMap<String, ModelStats> {
        let Ok(times) = self.model_times.read() else {
            return BTreeMap::new();
        };

        times
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(model, samples)| {
                let stats = LatencyStats::from_samples(samples);
                (
                    model.clone(),
                    ModelStats {
                        calls: stats.count,
                        mean_us: stats.mean_us,
                        p50_us: stats.p50_us,
                        p99_us: stats.p99_us,
                    },
                )
            })
            .collect()
    }

    pub fn get_failures_by_stage(&self) -> BTreeMap<Stage, u64> {
        self.failures_by_stage
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Top-label band counts, indexed low / medium / high
    pub fn get_band_distribution(&self) -> [u64; 3] {
        self.band_counts.read().map(|b| *b).unwrap_or_default()
    }

    /// Requests per second since the collector was created
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let total = self.requests_completed.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed);
        if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Log summary statistics, with cache counters when a registry is given
    pub fn print_summary(&self, registry: Option<&RegistryStats>) {
        let completed = self.requests_completed.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);
        let latency = self.get_latency_stats();
        let bands = self.get_band_distribution();

        info!(
            completed,
            failed,
            throughput_per_sec = self.get_throughput(),
            "Diagnostic metrics summary"
        );
        info!(
            mean_us = latency.mean_us,
            p50_us = latency.p50_us,
            p95_us = latency.p95_us,
            p99_us = latency.p99_us,
            max_us = latency.max_us,
            "Request latency"
        );
        info!(
            low = bands[0],
            medium = bands[1],
            high = bands[2],
            "Top-label confidence bands"
        );
        for (stage, count) in self.get_failures_by_stage() {
            info!(stage = %stage, count, "Failures by stage");
        }
        for (model, stats) in self.get_model_stats() {
            info!(
                model = %model,
                calls = stats.calls,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                "Model inference time"
            );
        }
        if let Some(stats) = registry {
            info!(
                resident = stats.resident,
                registered = stats.registered,
                hit_ratio = stats.hit_ratio(),
                loads = stats.loads_started,
                load_failures = stats.loads_failed,
                load_timeouts = stats.load_timeouts,
                evictions = stats.evictions,
                "Model cache"
            );
        }
    }
}

impl Default for DiagnosticMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        let percentile = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];

        Self {
            count: count as u64,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: sorted[count / 2],
            p95_us: percentile(0.95),
            p99_us: percentile(0.99),
            max_us: sorted[count - 1],
        }
    }
}

/// Model-specific statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStats {
    pub calls: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Logs a metrics summary on a fixed interval
pub struct MetricsReporter {
    metrics: Arc<DiagnosticMetrics>,
    registry: Option<Arc<ModelRegistry>>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<DiagnosticMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            registry: None,
            interval_secs,
        }
    }

    /// Include model cache counters in each summary
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = self.registry.as_ref().map(|r| r.stats());
            self.metrics.print_summary(stats.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::request::TaskType;
    use crate::types::result::{BandThresholds, Diagnosis, RankedResult};

    fn report(probabilities: &[(&str, f64)]) -> DiagnosticReport {
        let ranked = RankedResult::from_distribution(
            probabilities.iter().map(|(l, p)| (l.to_string(), *p)).collect(),
            &BandThresholds::default(),
            None,
        );
        DiagnosticReport::new(TaskType::ChestXray, "xr".to_string(), Diagnosis::Ranked(ranked))
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = DiagnosticMetrics::new();

        metrics.record_success(Duration::from_micros(100), &report(&[("a", 0.9), ("b", 0.1)]));
        metrics.record_success(Duration::from_micros(300), &report(&[("a", 0.5), ("b", 0.5)]));
        metrics.record_failure(Duration::from_micros(50), Stage::Preprocessing);

        assert_eq!(metrics.requests_completed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.requests_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_band_distribution(), [1, 0, 1]);
        assert_eq!(
            metrics.get_failures_by_stage().get(&Stage::Preprocessing),
            Some(&1)
        );

        let latency = metrics.get_latency_stats();
        assert_eq!(latency.count, 3);
        assert_eq!(latency.max_us, 300);
        assert_eq!(latency.p50_us, 100);
    }

    #[test]
    fn test_model_times() {
        let metrics = DiagnosticMetrics::new();
        for us in [10, 20, 30] {
            metrics.record_model_time("xr", Duration::from_micros(us));
        }

        let stats = metrics.get_model_stats();
        assert_eq!(stats["xr"].calls, 3);
        assert_eq!(stats["xr"].mean_us, 20);
    }

    #[test]
    fn test_empty_stats() {
        let metrics = DiagnosticMetrics::new();
        assert_eq!(metrics.get_latency_stats(), LatencyStats::default());
        assert!(metrics.get_model_stats().is_empty());
    }
}

//! Diagnostic Orchestrator - Batch Runner
//!
//! Reads newline-delimited JSON requests, diagnoses them on a bounded worker
//! pool and prints one JSON result per line, in input order.

use anyhow::{Context, Result};
use clap::Parser;
use diagnostic_orchestrator::{
    config::{AppConfig, LoggingConfig},
    error::{ErrorCategory, ErrorKind, Stage},
    metrics::{DiagnosticMetrics, MetricsReporter},
    DiagnosticOrchestrator, DiagnosticReport, DiagnosticRequest, TaskType,
};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "diagnose", about = "Run diagnostic requests through the orchestrator")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,

    /// NDJSON request file (reads stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Labels kept per result, overriding [pipeline].default_top_k
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Concurrent diagnoses, overriding [pipeline].workers
    #[arg(short, long)]
    workers: Option<usize>,
}

/// One input line
#[derive(Debug, Deserialize)]
struct RequestLine {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    input: RequestInput,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestInput {
    Image { task_type: TaskType, path: PathBuf },
    Symptoms { symptoms: Vec<String> },
}

/// One output line
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ResultLine {
    Ok {
        id: Option<String>,
        report: DiagnosticReport,
    },
    Failed {
        id: Option<String>,
        stage: Stage,
        kind: ErrorKind,
        category: ErrorCategory,
        error: String,
    },
    Invalid {
        id: Option<String>,
        line: usize,
        error: String,
    },
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("diagnostic_orchestrator={}", logging.level).parse()?)
        .add_directive(format!("diagnose={}", logging.level).parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.pretty().init(),
    }
    Ok(())
}

fn read_lines(input: Option<&PathBuf>) -> Result<Vec<String>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    reader
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .context("Failed to read requests")
}

/// Parse, load and diagnose one line; runs on the blocking pool
fn process_line(
    orchestrator: &DiagnosticOrchestrator,
    line_no: usize,
    line: &str,
    top_k: Option<usize>,
) -> ResultLine {
    let parsed: RequestLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(line = line_no, error = %e, "Failed to parse request");
            return ResultLine::Invalid {
                id: None,
                line: line_no,
                error: e.to_string(),
            };
        }
    };

    let request = match parsed.input {
        RequestInput::Symptoms { symptoms } => DiagnosticRequest::symptoms(symptoms),
        RequestInput::Image { task_type, path } => match std::fs::read(&path) {
            Ok(bytes) => DiagnosticRequest::image(task_type, bytes),
            Err(e) => {
                warn!(line = line_no, path = %path.display(), error = %e, "Failed to read image");
                return ResultLine::Invalid {
                    id: parsed.id,
                    line: line_no,
                    error: format!("failed to read {}: {e}", path.display()),
                };
            }
        },
    };

    match orchestrator.diagnose_with(&request, top_k) {
        Ok(report) => ResultLine::Ok {
            id: parsed.id,
            report,
        },
        Err(failure) => {
            error!(
                line = line_no,
                stage = %failure.stage,
                error = %failure.error,
                "Diagnosis failed"
            );
            ResultLine::Failed {
                id: parsed.id,
                stage: failure.stage,
                kind: failure.kind(),
                category: failure.category(),
                error: failure.error.to_string(),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = AppConfig::load_from_path(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    init_tracing(&config.logging)?;
    info!(config = %args.config.display(), "Configuration loaded");

    let metrics = Arc::new(DiagnosticMetrics::new());
    let orchestrator = Arc::new(DiagnosticOrchestrator::from_config(&config)?.with_metrics(metrics.clone()));

    if config.metrics.report_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.metrics.report_interval_secs)
            .with_registry(orchestrator.registry().clone());
        tokio::spawn(reporter.start());
    }

    let lines = read_lines(args.input.as_ref())?;
    let top_k = args.top_k.or(config.pipeline.top_k());
    let num_workers = args.workers.unwrap_or(config.pipeline.workers).max(1);
    info!(requests = lines.len(), workers = num_workers, "Processing requests");

    // Semaphore to limit concurrent diagnoses
    let semaphore = Arc::new(Semaphore::new(num_workers));
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(lines.len());

    for (index, line) in lines.into_iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let permit = semaphore.clone().acquire_owned().await?;
        let orchestrator = orchestrator.clone();

        tasks.push(tokio::task::spawn_blocking(move || {
            let result = process_line(&orchestrator, index + 1, &line, top_k);
            drop(permit);
            result
        }));
    }

    let results = futures::future::join_all(tasks).await;
    let mut stdout = std::io::stdout().lock();
    for result in results {
        let line = result.context("Diagnosis task panicked")?;
        serde_json::to_writer(&mut stdout, &line)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "All requests processed"
    );
    metrics.print_summary(Some(&orchestrator.registry().stats()));

    Ok(())
}

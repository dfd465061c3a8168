//! Demo Asset Generator
//!
//! Writes linear demo models, synthetic images and a random NDJSON request
//! batch matching `config/config.toml`, so the batch runner can be tried
//! without trained weights.

use anyhow::{Context, Result};
use clap::Parser;
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::Rng;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const XRAY_SIDE: u32 = 32;
const LESION_SIDE: u32 = 16;

const SYMPTOMS: [&str; 8] = [
    "fever",
    "cough",
    "sneezing",
    "headache",
    "nausea",
    "fatigue",
    "rash",
    "sore_throat",
];
const CONDITIONS: [&str; 4] = ["flu", "cold", "migraine", "allergy"];

/// Symptom → condition affinity used to shape the demo symptom model
const AFFINITY: [[f32; 8]; 4] = [
    [2.0, 1.2, 0.2, 0.6, 0.3, 1.5, 0.0, 0.8],
    [0.4, 1.4, 1.8, 0.3, 0.0, 0.6, 0.0, 1.2],
    [0.0, 0.0, 0.0, 2.2, 1.6, 0.5, 0.0, 0.0],
    [0.0, 0.3, 1.6, 0.2, 0.0, 0.2, 1.8, 0.4],
];

#[derive(Parser, Debug)]
#[command(name = "demo_assets", about = "Generate demo models, images and requests")]
struct Args {
    /// Output directory
    #[arg(short, long, default_value = "demo")]
    out: PathBuf,

    /// Number of requests to generate
    #[arg(short, long, default_value_t = 100)]
    count: usize,

    /// Share of requests that are symptom checks
    #[arg(long, default_value_t = 0.5)]
    symptom_rate: f64,
}

/// Random asset generator
struct AssetGenerator {
    rng: rand::rngs::ThreadRng,
}

impl AssetGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    fn noise(&mut self, scale: f32) -> f32 {
        self.rng.gen_range(-scale..scale)
    }

    /// Bright images score `normal`, dark images `pneumonia`
    fn chest_xray_model(&mut self) -> serde_json::Value {
        let inputs = (XRAY_SIDE * XRAY_SIDE) as f32;
        let normal: Vec<f32> = (0..XRAY_SIDE * XRAY_SIDE)
            .map(|_| 6.0 / inputs + self.noise(0.5 / inputs))
            .collect();
        let pneumonia: Vec<f32> = normal.iter().map(|w| -w).collect();
        json!({
            "format": "linear",
            "activation": "none",
            "weights": [normal, pneumonia],
            "bias": [-3.0, 3.0],
        })
    }

    /// Red-dominant lesions lean `malignant`; emits probabilities directly
    fn skin_lesion_model(&mut self) -> serde_json::Value {
        let pixels = (LESION_SIDE * LESION_SIDE) as usize;
        let per_pixel = 8.0 / pixels as f32;
        let mut benign = Vec::with_capacity(pixels * 3);
        let mut malignant = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            for channel in 0..3 {
                let red = if channel == 0 { per_pixel } else { -per_pixel / 2.0 };
                malignant.push(red + self.noise(per_pixel / 10.0));
                benign.push(-red + self.noise(per_pixel / 10.0));
            }
        }
        json!({
            "format": "linear",
            "activation": "softmax",
            "weights": [benign, malignant],
            "bias": [0.0, 0.0],
        })
    }

    fn symptom_model(&mut self) -> serde_json::Value {
        let weights: Vec<Vec<f32>> = AFFINITY
            .iter()
            .map(|row| row.iter().map(|w| w + self.noise(0.1)).collect())
            .collect();
        json!({
            "format": "linear",
            "activation": "none",
            "weights": weights,
            "bias": vec![-1.0_f32; CONDITIONS.len()],
        })
    }

    fn chest_xray_image(&mut self) -> GrayImage {
        let base: u8 = self.rng.gen_range(20..235);
        GrayImage::from_fn(XRAY_SIDE * 2, XRAY_SIDE * 2, |_, _| {
            Luma([base.saturating_add(self.rng.gen_range(0..20))])
        })
    }

    fn skin_lesion_image(&mut self) -> RgbImage {
        let tint = [
            self.rng.gen_range(80..255),
            self.rng.gen_range(40..200),
            self.rng.gen_range(40..200),
        ];
        RgbImage::from_fn(LESION_SIDE * 3, LESION_SIDE * 3, |_, _| Rgb(tint))
    }

    fn symptom_set(&mut self) -> Vec<String> {
        let count = self.rng.gen_range(1..=4);
        let mut picked: Vec<String> = (0..count)
            .map(|_| SYMPTOMS[self.rng.gen_range(0..SYMPTOMS.len())].to_string())
            .collect();
        // Occasional unknown code to exercise warnings
        if self.rng.gen_bool(0.1) {
            picked.push("itchy_elbow".to_string());
        }
        picked
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn write_knowledge_base(path: &Path) -> Result<()> {
    let mut toml = String::new();
    for (condition, row) in CONDITIONS.iter().zip(AFFINITY.iter()) {
        toml.push_str(&format!("[conditions.{condition}]\n"));
        for (symptom, weight) in SYMPTOMS.iter().zip(row.iter()) {
            if *weight >= 1.0 {
                toml.push_str(&format!("{symptom} = {:.2}\n", weight / 4.0));
            }
        }
        toml.push('\n');
    }
    fs::write(path, toml).with_context(|| format!("Failed to write {}", path.display()))
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("demo_assets=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let models_dir = args.out.join("models");
    let images_dir = args.out.join("images");
    fs::create_dir_all(&models_dir)?;
    fs::create_dir_all(&images_dir)?;

    info!(out = %args.out.display(), count = args.count, "Generating demo assets");

    let mut generator = AssetGenerator::new();
    write_json(&models_dir.join("chest_xray_v1.json"), &generator.chest_xray_model())?;
    write_json(&models_dir.join("skin_lesion_v1.json"), &generator.skin_lesion_model())?;
    write_json(&models_dir.join("symptoms_v1.json"), &generator.symptom_model())?;
    write_knowledge_base(&args.out.join("knowledge_base.toml"))?;
    info!("Models and knowledge base written");

    let requests_path = args.out.join("requests.ndjson");
    let mut requests = fs::File::create(&requests_path)
        .with_context(|| format!("Failed to create {}", requests_path.display()))?;
    let mut rng = rand::thread_rng();
    let (mut images, mut symptom_checks) = (0, 0);

    for i in 0..args.count {
        let id = format!("req_{:06}", i + 1);
        let line = if rng.gen_bool(args.symptom_rate.clamp(0.0, 1.0)) {
            symptom_checks += 1;
            json!({ "id": id, "type": "symptoms", "symptoms": generator.symptom_set() })
        } else {
            images += 1;
            let (task, path) = if rng.gen_bool(0.5) {
                let path = images_dir.join(format!("{id}_xray.png"));
                generator.chest_xray_image().save(&path)?;
                ("chest_xray", path)
            } else {
                let path = images_dir.join(format!("{id}_lesion.png"));
                generator.skin_lesion_image().save(&path)?;
                ("skin_lesion", path)
            };
            json!({ "id": id, "type": "image", "task_type": task, "path": path })
        };
        writeln!(requests, "{line}")?;
    }

    info!(
        path = %requests_path.display(),
        images,
        symptom_checks,
        "Completed! Request batch written"
    );
    Ok(())
}

//! Deterministic symptom → condition rule engine

use crate::types::request::normalize_code;
use crate::types::result::RuleScore;
use anyhow::{bail, Context, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// Static mapping condition → {symptom code → weight}
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub conditions: BTreeMap<String, BTreeMap<String, f64>>,
}

impl KnowledgeBase {
    /// Load the knowledge base artifact (TOML or JSON, by extension)
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let kb: KnowledgeBase = Config::builder()
            .add_source(File::from(path))
            .build()
            .with_context(|| format!("Failed to read knowledge base {}", path.display()))?
            .try_deserialize()
            .context("Failed to deserialize knowledge base")?;

        let kb = kb.normalized();
        kb.validate()?;
        info!(
            conditions = kb.conditions.len(),
            path = %path.display(),
            "Knowledge base loaded"
        );
        Ok(kb)
    }

    /// Build from `(condition, [(symptom, weight)])` pairs
    pub fn from_entries<'a, I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, S)>,
        S: IntoIterator<Item = (&'a str, f64)>,
    {
        let conditions = entries
            .into_iter()
            .map(|(condition, symptoms)| {
                let symptoms = symptoms
                    .into_iter()
                    .map(|(code, weight)| (code.to_string(), weight))
                    .collect();
                (condition.to_string(), symptoms)
            })
            .collect();
        KnowledgeBase { conditions }.normalized()
    }

    /// Symptom codes lower-cased and trimmed, as requests are
    fn normalized(self) -> Self {
        let conditions = self
            .conditions
            .into_iter()
            .map(|(condition, symptoms)| {
                let symptoms = symptoms
                    .into_iter()
                    .map(|(code, weight)| (normalize_code(&code), weight))
                    .collect();
                (condition, symptoms)
            })
            .collect();
        KnowledgeBase { conditions }
    }

    /// Weights must be finite and non-negative
    pub fn validate(&self) -> Result<()> {
        for (condition, symptoms) in &self.conditions {
            for (code, weight) in symptoms {
                if !weight.is_finite() || *weight < 0.0 {
                    bail!("weight {weight} for `{code}` in condition `{condition}` must be finite and non-negative");
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Scores conditions by summing the weights of matched symptoms, clipped to [0, 1]
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    knowledge_base: KnowledgeBase,
}

impl RuleEngine {
    pub fn new(knowledge_base: KnowledgeBase) -> Self {
        Self { knowledge_base }
    }

    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.knowledge_base
    }

    /// Rule score for every condition with at least one matched symptom.
    ///
    /// `symptoms` must already be normalized.
    pub fn score(&self, symptoms: &BTreeSet<String>) -> RuleScore {
        self.knowledge_base
            .conditions
            .iter()
            .filter_map(|(condition, weights)| {
                let matched: Vec<f64> = weights
                    .iter()
                    .filter(|(code, _)| symptoms.contains(*code))
                    .map(|(_, weight)| *weight)
                    .collect();
                if matched.is_empty() {
                    return None;
                }
                let total: f64 = matched.iter().sum();
                Some((condition.clone(), total.clamp(0.0, 1.0)))
            })
            .collect()
    }
}

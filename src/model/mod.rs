//! Pluggable direction classifiers.
//!
//! A `Classifier` is a stateless factory: `train` never mutates it and always
//! returns a brand-new `FittedModel`, so the backtester gets a fresh fit at
//! every walk-forward step.

mod forest;
mod logistic;

pub use forest::{ForestConfig, RandomForest};
pub use logistic::{LogisticConfig, LogisticRegression};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::FitError;
use crate::models::Outcome;

pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Fit on `features[i]` -> `labels[i]`.
    ///
    /// Fails with `FitError::SingleClass` rather than fitting a degenerate model.
    fn train(&self, features: &[&[f64]], labels: &[Outcome]) -> Result<Box<dyn FittedModel>, FitError>;
}

pub trait FittedModel: Send {
    /// P(Up) per row, or `None` if the model can only produce a hard label
    fn predict_proba(&self, features: &[&[f64]]) -> Option<Vec<f64>>;

    /// Hard labels per row. The backtester falls back to this whenever
    /// `predict_proba` returns `None`.
    fn predict(&self, features: &[&[f64]]) -> Vec<Outcome>;
}

/// Hard labels for probabilistic models: Up when P(Up) >= 0.5
pub fn labels_from_probabilities(probs: &[f64]) -> Vec<Outcome> {
    probs
        .iter()
        .map(|&p| Outcome::from_probability(p, 0.5))
        .collect()
}

/// Number of distinct classes present in a label set
pub fn distinct_classes(labels: &[Outcome]) -> usize {
    let ups = labels.iter().any(Outcome::is_up);
    let downs = labels.iter().any(|l| !l.is_up());
    usize::from(ups) + usize::from(downs)
}

/// Shared precondition for every classifier's `train`
pub fn check_training_set(features: &[&[f64]], labels: &[Outcome]) -> Result<(), FitError> {
    if features.len() != labels.len() {
        return Err(FitError::ShapeMismatch {
            features: features.len(),
            labels: labels.len(),
        });
    }
    if labels.is_empty() {
        return Err(FitError::Empty);
    }
    if distinct_classes(labels) < 2 {
        return Err(FitError::SingleClass);
    }
    Ok(())
}

/// Which classifier to use and its hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    RandomForest(ForestConfig),
    LogisticRegression(LogisticConfig),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::RandomForest(ForestConfig::default())
    }
}

impl ModelConfig {
    /// Override the random seed where the model has one
    pub fn with_seed(self, seed: u64) -> Self {
        match self {
            ModelConfig::RandomForest(cfg) => ModelConfig::RandomForest(ForestConfig { seed, ..cfg }),
            other => other,
        }
    }
}

pub fn build_classifier(config: &ModelConfig) -> Arc<dyn Classifier> {
    match config {
        ModelConfig::RandomForest(cfg) => Arc::new(RandomForest::new(cfg.clone())),
        ModelConfig::LogisticRegression(cfg) => Arc::new(LogisticRegression::new(cfg.clone())),
    }
}

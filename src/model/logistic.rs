use serde::{Deserialize, Serialize};

use super::{check_training_set, labels_from_probabilities, Classifier, FittedModel};
use crate::error::FitError;
use crate::models::Outcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticConfig {
    pub learning_rate: f64,
    pub epochs: usize,
    /// L2 penalty on the weights (not the bias)
    pub l2: f64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 300,
            l2: 0.0,
        }
    }
}

/// Batch gradient-descent logistic regression on standardised features
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    config: LogisticConfig,
}

impl LogisticRegression {
    pub fn new(config: LogisticConfig) -> Self {
        Self { config }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Classifier for LogisticRegression {
    fn name(&self) -> &str {
        "logistic_regression"
    }

    fn train(&self, features: &[&[f64]], labels: &[Outcome]) -> Result<Box<dyn FittedModel>, FitError> {
        check_training_set(features, labels)?;

        let n = features.len() as f64;
        let dims = features[0].len();

        // Column means and standard deviations from the training rows only
        let mut means = vec![0.0; dims];
        for row in features {
            for (m, v) in means.iter_mut().zip(row.iter()) {
                *m += v / n;
            }
        }
        let mut scales = vec![0.0; dims];
        for row in features {
            for ((s, v), m) in scales.iter_mut().zip(row.iter()).zip(&means) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in &mut scales {
            *s = if *s > 0.0 { s.sqrt() } else { 1.0 };
        }

        let samples: Vec<(Vec<f64>, f64)> = features
            .iter()
            .zip(labels)
            .map(|(row, y)| (standardise(row, &means, &scales), y.as_f64()))
            .collect();

        let mut bias = 0.0;
        let mut weights = vec![0.0; dims];

        for _epoch in 0..self.config.epochs {
            let mut grad_bias = 0.0;
            let mut grad_weights = vec![0.0; dims];

            for (x, y) in &samples {
                let z = bias + weights.iter().zip(x).map(|(w, f)| w * f).sum::<f64>();
                let error = sigmoid(z) - y;

                grad_bias += error;
                for (g, f) in grad_weights.iter_mut().zip(x) {
                    *g += error * f;
                }
            }

            bias -= self.config.learning_rate * grad_bias / n;
            for (w, g) in weights.iter_mut().zip(&grad_weights) {
                *w -= self.config.learning_rate * (g / n + self.config.l2 * *w);
            }
        }

        Ok(Box::new(FittedLogistic {
            means,
            scales,
            weights,
            bias,
        }))
    }
}

fn standardise(row: &[f64], means: &[f64], scales: &[f64]) -> Vec<f64> {
    row.iter()
        .zip(means)
        .zip(scales)
        .map(|((v, m), s)| (v - m) / s)
        .collect()
}

struct FittedLogistic {
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl FittedLogistic {
    fn probabilities(&self, features: &[&[f64]]) -> Vec<f64> {
        features
            .iter()
            .map(|row| {
                let x = standardise(row, &self.means, &self.scales);
                let z = self.bias + self.weights.iter().zip(&x).map(|(w, f)| w * f).sum::<f64>();
                sigmoid(z)
            })
            .collect()
    }
}

impl FittedModel for FittedLogistic {
    fn predict_proba(&self, features: &[&[f64]]) -> Option<Vec<f64>> {
        Some(self.probabilities(features))
    }

    fn predict(&self, features: &[&[f64]]) -> Vec<Outcome> {
        labels_from_probabilities(&self.probabilities(features))
    }
}

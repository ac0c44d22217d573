use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backtest::{check_threshold, BacktestConfig};
use crate::error::ConfigError;
use crate::features::FeatureConfig;
use crate::model::ModelConfig;

/// Full run configuration loaded from YAML. Every section may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub features: FeatureConfig,
    pub backtest: BacktestConfig,
    pub model: ModelConfig,
    pub sweep: SweepConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Decision thresholds re-run by the `sweep` command
    #[serde(default = "default_sweep_thresholds")]
    pub thresholds: Vec<f64>,
}

fn default_sweep_thresholds() -> Vec<f64> {
    vec![0.4, 0.5, 0.6, 0.7, 0.8]
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            thresholds: default_sweep_thresholds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for CSV/JSON exports and the text report
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// Write one row per prediction (large for big universes)
    #[serde(default = "default_true")]
    pub write_predictions: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_true() -> bool { true }

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            write_predictions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration: {}", path.display()))?;

        Ok(config)
    }

    /// Load with environment variable overrides.
    ///
    /// Without a path the built-in defaults are used as the base.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `TCG_*` overrides; unparseable values leave the setting as is
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var("TCG_START") {
            self.backtest.start = val.parse().unwrap_or(self.backtest.start);
        }
        if let Some(val) = var("TCG_STEP") {
            self.backtest.step = val.parse().unwrap_or(self.backtest.step);
        }
        if let Some(val) = var("TCG_THRESHOLD") {
            self.backtest.threshold = val.parse().unwrap_or(self.backtest.threshold);
        }
        if let Some(val) = var("TCG_CONCURRENCY") {
            self.backtest.concurrency = val.parse().unwrap_or(self.backtest.concurrency);
        }
        if let Some(val) = var("TCG_EXCLUDED_GROUPS") {
            self.backtest.excluded_groups = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(val) = var("TCG_MODEL_SEED") {
            if let Ok(seed) = val.parse() {
                self.model = self.model.clone().with_seed(seed);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.features.validate()?;
        self.backtest.validate()?;
        for &t in &self.sweep.thresholds {
            check_threshold(t)?;
        }
        Ok(())
    }
}

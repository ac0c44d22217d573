use chrono::NaiveDate;
use thiserror::Error;

/// Data-integrity failure while assembling one entity's timeline
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    #[error("entity {entity_id} has more than one observation for period {period_start}")]
    DuplicatePeriod {
        entity_id: String,
        period_start: NaiveDate,
    },
}

/// Why a classifier refused to fit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FitError {
    #[error("training labels contain a single class")]
    SingleClass,
    #[error("no training samples")]
    Empty,
    #[error("feature/label length mismatch: {features} rows vs {labels} labels")]
    ShapeMismatch { features: usize, labels: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("no predictions were recorded; nothing to score")]
    NoPredictions,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("backtest step must be at least 1")]
    ZeroStep,
    #[error("threshold {0} is outside [0, 1]")]
    ThresholdOutOfRange(f64),
    #[error("window lengths must be at least 1 (got 0 in {0})")]
    ZeroWindow(&'static str),
    #[error("fixed training window must hold at least 2 rows")]
    FixedWindowTooSmall,
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
}

/// Top-level failure of a backtest run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("entity worker failed: {0}")]
    Worker(String),
}

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One weekly sales aggregate for a single card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    /// Start of the fixed-length period (a week in the scraped data)
    pub period_start: NaiveDate,
    pub volume: u64,
    pub min_price: f64,
    pub max_price: f64,
    pub avg_price: f64,
}

impl Observation {
    /// Read a numeric field by name
    pub fn field(&self, field: Field) -> f64 {
        match field {
            Field::AvgPrice => self.avg_price,
            Field::Volume => self.volume as f64,
            Field::MinPrice => self.min_price,
            Field::MaxPrice => self.max_price,
        }
    }
}

/// Observation fields a feature can be computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    AvgPrice,
    Volume,
    MinPrice,
    MaxPrice,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::AvgPrice => "avg_price",
            Field::Volume => "volume",
            Field::MinPrice => "min_price",
            Field::MaxPrice => "max_price",
        }
    }
}

/// Direction of the next observed period's average price.
/// `Down` covers ties as well as decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Up,
    Down,
}

impl Outcome {
    /// Label for a move from `current` to `next`: strictly higher is `Up`
    pub fn from_move(current: f64, next: f64) -> Self {
        if next > current {
            Outcome::Up
        } else {
            Outcome::Down
        }
    }

    /// Convert a probability of `Up` into a hard label
    pub fn from_probability(p_up: f64, threshold: f64) -> Self {
        if p_up >= threshold {
            Outcome::Up
        } else {
            Outcome::Down
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Outcome::Up)
    }

    /// 1.0 for `Up`, 0.0 otherwise
    pub fn as_f64(&self) -> f64 {
        if self.is_up() {
            1.0
        } else {
            0.0
        }
    }

    pub fn as_u8(&self) -> u8 {
        if self.is_up() {
            1
        } else {
            0
        }
    }
}

/// A single admitted sample: features known as of `period_start`, plus the
/// supervision label which looks one observed period ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity_id: String,
    pub period_start: NaiveDate,
    pub label: Outcome,
    /// Values in the column order of the owning `FeatureTable::names`
    pub values: Vec<f64>,
}

/// Cleaned feature rows for one entity, in ascending period order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub entity_id: String,
    pub names: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column index for a feature name
    pub fn column(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Value of a named feature on a given row
    pub fn value(&self, row: usize, name: &str) -> Option<f64> {
        let col = self.column(name)?;
        self.rows.get(row).and_then(|r| r.values.get(col)).copied()
    }

    pub fn labels(&self) -> Vec<Outcome> {
        self.rows.iter().map(|r| r.label).collect()
    }
}

/// One out-of-sample prediction produced by the walk-forward backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub entity_id: String,
    pub period_start: NaiveDate,
    /// Decision threshold in force when the label was produced
    pub threshold: f64,
    pub actual: Outcome,
    pub predicted: Outcome,
    /// P(Up); absent when the model could only give a hard label
    pub probability: Option<f64>,
}

impl PredictionRecord {
    pub fn is_correct(&self) -> bool {
        self.actual == self.predicted
    }
}

//! Point-in-time feature derivation for a single entity.
//!
//! Every value on row `t` is computed from observations `0..=t` of the same
//! entity. The label is the only thing that looks ahead (to row `t + 1`) and it
//! is never fed to a model as an input.
//!
//! Windows are counted in observed rows by default. A missing week is not
//! filled in, so across a gap `lag1` refers to the last *observed* week, not
//! the previous calendar week. `Alignment::Calendar` is the stricter opt-in
//! that treats any window spanning a gap as undefined.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{FeatureRow, FeatureTable, Field, Observation, Outcome};
use crate::timeline::Timeline;

/// One derived column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSpec {
    /// The field's value on the current row
    Base { field: Field },
    /// The field's value `k` observed rows back
    Lag { field: Field, k: usize },
    /// Mean over the current row and the `w - 1` before it
    RollingMean { field: Field, w: usize },
    /// Sum over the current row and the `w - 1` before it
    RollingSum { field: Field, w: usize },
    /// Current value divided by `RollingMean { field, w }`
    Ratio { field: Field, w: usize },
    /// Share of `Up` labels among the `w` most recently revealed labels
    Trend { w: usize },
}

impl FeatureSpec {
    pub fn name(&self) -> String {
        match self {
            FeatureSpec::Base { field } => field.as_str().to_string(),
            FeatureSpec::Lag { field, k } => format!("lag{}_{}", k, field.as_str()),
            FeatureSpec::RollingMean { field, w } => format!("roll{}_mean_{}", w, field.as_str()),
            FeatureSpec::RollingSum { field, w } => format!("roll{}_sum_{}", w, field.as_str()),
            FeatureSpec::Ratio { field, w } => format!("{}_vs_roll{}", field.as_str(), w),
            FeatureSpec::Trend { w } => format!("trend{}", w),
        }
    }

    /// Contiguous rows (current included) needed before the value is defined
    pub fn history(&self) -> usize {
        match *self {
            FeatureSpec::Base { .. } => 1,
            FeatureSpec::Lag { k, .. } => k + 1,
            FeatureSpec::RollingMean { w, .. }
            | FeatureSpec::RollingSum { w, .. }
            | FeatureSpec::Ratio { w, .. } => w,
            // labels of rows t-w..t-1 need rows t-w..=t
            FeatureSpec::Trend { w } => w + 1,
        }
    }

    fn window_len(&self) -> usize {
        match *self {
            FeatureSpec::Base { .. } => 1,
            FeatureSpec::Lag { k, .. } => k,
            FeatureSpec::RollingMean { w, .. }
            | FeatureSpec::RollingSum { w, .. }
            | FeatureSpec::Ratio { w, .. }
            | FeatureSpec::Trend { w } => w,
        }
    }
}

/// How lag and rolling windows treat missing periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Alignment {
    /// Windows run over observed rows; gaps are ignored
    #[default]
    ObservedRows,
    /// Windows (and labels) must not span a missing period of `period_days`
    Calendar { period_days: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Feed the current avg price and volume to the model
    #[serde(default = "default_true")]
    pub include_base: bool,
    /// Lag orders, applied to both avg price and volume
    #[serde(default = "default_lag_orders")]
    pub lag_orders: Vec<usize>,
    /// `avg_price / rolling mean(avg_price, w)`
    #[serde(default = "default_price_ratio_windows")]
    pub price_ratio_windows: Vec<usize>,
    /// `volume / rolling mean(volume, w)`
    #[serde(default = "default_volume_ratio_windows")]
    pub volume_ratio_windows: Vec<usize>,
    #[serde(default = "default_trend_windows")]
    pub trend_windows: Vec<usize>,
    /// Any further columns, e.g. `roll4_mean_avg_price`
    #[serde(default)]
    pub extra: Vec<FeatureSpec>,
    #[serde(default)]
    pub alignment: Alignment,
}

fn default_true() -> bool { true }
fn default_lag_orders() -> Vec<usize> { vec![1, 2] }
fn default_price_ratio_windows() -> Vec<usize> { vec![2, 4, 8, 16] }
fn default_volume_ratio_windows() -> Vec<usize> { vec![2, 4] }
fn default_trend_windows() -> Vec<usize> { vec![2, 3, 4, 8, 16] }

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            include_base: true,
            lag_orders: default_lag_orders(),
            price_ratio_windows: default_price_ratio_windows(),
            volume_ratio_windows: default_volume_ratio_windows(),
            trend_windows: default_trend_windows(),
            extra: Vec::new(),
            alignment: Alignment::ObservedRows,
        }
    }
}

impl FeatureConfig {
    /// A config with no columns at all; useful as a base for explicit `extra` lists
    pub fn empty() -> Self {
        Self {
            include_base: false,
            lag_orders: Vec::new(),
            price_ratio_windows: Vec::new(),
            volume_ratio_windows: Vec::new(),
            trend_windows: Vec::new(),
            extra: Vec::new(),
            alignment: Alignment::ObservedRows,
        }
    }

    /// Expand the shorthand lists into concrete columns, in a stable order and
    /// without duplicates
    pub fn specs(&self) -> Vec<FeatureSpec> {
        let mut specs = Vec::new();

        if self.include_base {
            specs.push(FeatureSpec::Base { field: Field::AvgPrice });
            specs.push(FeatureSpec::Base { field: Field::Volume });
        }
        for &k in &self.lag_orders {
            specs.push(FeatureSpec::Lag { field: Field::AvgPrice, k });
        }
        for &k in &self.lag_orders {
            specs.push(FeatureSpec::Lag { field: Field::Volume, k });
        }
        for &w in &self.price_ratio_windows {
            specs.push(FeatureSpec::Ratio { field: Field::AvgPrice, w });
        }
        for &w in &self.volume_ratio_windows {
            specs.push(FeatureSpec::Ratio { field: Field::Volume, w });
        }
        for &w in &self.trend_windows {
            specs.push(FeatureSpec::Trend { w });
        }
        specs.extend(self.extra.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        specs.retain(|s| seen.insert(s.clone()));
        specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs().iter().map(FeatureSpec::name).collect()
    }

    /// Rows of history needed before the first row can be admitted
    pub fn longest_window(&self) -> usize {
        self.specs().iter().map(FeatureSpec::history).max().unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lag_orders.contains(&0) {
            return Err(ConfigError::ZeroWindow("lag_orders"));
        }
        if self.price_ratio_windows.contains(&0) {
            return Err(ConfigError::ZeroWindow("price_ratio_windows"));
        }
        if self.volume_ratio_windows.contains(&0) {
            return Err(ConfigError::ZeroWindow("volume_ratio_windows"));
        }
        if self.trend_windows.contains(&0) {
            return Err(ConfigError::ZeroWindow("trend_windows"));
        }
        if self.extra.iter().any(|s| s.window_len() == 0) {
            return Err(ConfigError::ZeroWindow("extra"));
        }
        if let Alignment::Calendar { period_days: 0 } = self.alignment {
            return Err(ConfigError::ZeroWindow("alignment.period_days"));
        }
        Ok(())
    }
}

/// Length of the contiguous run of rows ending at each index.
/// In observed-row mode every row continues the run.
fn contiguous_runs(obs: &[Observation], alignment: Alignment) -> Vec<usize> {
    let mut runs = Vec::with_capacity(obs.len());
    for (t, o) in obs.iter().enumerate() {
        let run = match alignment {
            Alignment::ObservedRows => t + 1,
            Alignment::Calendar { period_days } => {
                if t > 0
                    && o.period_start - obs[t - 1].period_start
                        == Duration::days(i64::from(period_days))
                {
                    runs[t - 1] + 1
                } else {
                    1
                }
            }
        };
        runs.push(run);
    }
    runs
}

/// Next-period direction for each row, `None` where the future is unknown
fn next_period_labels(obs: &[Observation], runs: &[usize]) -> Vec<Option<Outcome>> {
    (0..obs.len())
        .map(|t| {
            let next = t + 1;
            if next < obs.len() && runs[next] > 1 {
                Some(Outcome::from_move(obs[t].avg_price, obs[next].avg_price))
            } else {
                None
            }
        })
        .collect()
}

fn window_values<'a>(
    obs: &'a [Observation],
    t: usize,
    w: usize,
    field: Field,
) -> impl Iterator<Item = f64> + 'a {
    obs[t + 1 - w..=t].iter().map(move |o| o.field(field))
}

fn compute(
    spec: &FeatureSpec,
    obs: &[Observation],
    labels: &[Option<Outcome>],
    runs: &[usize],
    t: usize,
) -> Option<f64> {
    let window = spec.window_len();
    if window == 0 || runs[t] < spec.history() {
        return None;
    }

    let value = match *spec {
        FeatureSpec::Base { field } => obs[t].field(field),
        FeatureSpec::Lag { field, k } => obs[t - k].field(field),
        FeatureSpec::RollingMean { field, w } => {
            window_values(obs, t, w, field).sum::<f64>() / w as f64
        }
        FeatureSpec::RollingSum { field, w } => window_values(obs, t, w, field).sum::<f64>(),
        FeatureSpec::Ratio { field, w } => {
            let mean = window_values(obs, t, w, field).sum::<f64>() / w as f64;
            if mean == 0.0 {
                return None;
            }
            obs[t].field(field) / mean
        }
        FeatureSpec::Trend { w } => {
            // labels t-w..t-1 are settled by prices up to row t; label t is not
            let mut ups = 0usize;
            for label in &labels[t - w..t] {
                match label {
                    Some(Outcome::Up) => ups += 1,
                    Some(Outcome::Down) => {}
                    None => return None,
                }
            }
            ups as f64 / w as f64
        }
    };

    value.is_finite().then_some(value)
}

/// Derive the cleaned feature table for one entity.
///
/// Rows whose label or any configured feature is undefined are dropped, not
/// imputed. An entity shorter than the longest window yields an empty table.
pub fn derive_features(timeline: &Timeline, config: &FeatureConfig) -> FeatureTable {
    let specs = config.specs();
    let names: Vec<String> = specs.iter().map(FeatureSpec::name).collect();
    let obs = &timeline.observations;

    let runs = contiguous_runs(obs, config.alignment);
    let labels = next_period_labels(obs, &runs);

    let rows = (0..obs.len())
        .filter_map(|t| {
            let label = labels[t]?;
            let values = specs
                .iter()
                .map(|spec| compute(spec, obs, &labels, &runs, t))
                .collect::<Option<Vec<f64>>>()?;

            Some(FeatureRow {
                entity_id: timeline.entity_id.clone(),
                period_start: obs[t].period_start,
                label,
                values,
            })
        })
        .collect();

    FeatureTable {
        entity_id: timeline.entity_id.clone(),
        names,
        rows,
    }
}

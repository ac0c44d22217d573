//! Walk-forward backtest.
//!
//! At every step the classifier is fitted from scratch on rows strictly before
//! the evaluation block and scored on the next `step` rows, so no prediction
//! ever sees its own label or anything after it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, PipelineError};
use crate::model::{distinct_classes, Classifier};
use crate::models::{FeatureTable, Outcome, PredictionRecord};
use crate::timeline::entity_group;

/// How much history each walk-forward fit sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingWindow {
    /// Every row before the evaluation block
    #[default]
    Expanding,
    /// Only the last `rows` rows before the evaluation block
    Fixed { rows: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// First evaluated row index
    pub start: usize,
    /// Rows evaluated per fit
    pub step: usize,
    /// Minimum P(Up) to call `Up`
    pub threshold: f64,
    pub window: TrainingWindow,
    /// Separates the group prefix from the rest of an entity id
    pub group_delimiter: char,
    /// Entity groups left out of every run
    pub excluded_groups: Vec<String>,
    /// Entities backtested in parallel by the async runner
    pub concurrency: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start: 4,
            step: 1,
            threshold: 0.6,
            window: TrainingWindow::Expanding,
            group_delimiter: '-',
            excluded_groups: Vec::new(),
            concurrency: 4,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step == 0 {
            return Err(ConfigError::ZeroStep);
        }
        check_threshold(self.threshold)?;
        if let TrainingWindow::Fixed { rows } = self.window {
            if rows < 2 {
                return Err(ConfigError::FixedWindowTooSmall);
            }
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    pub fn is_excluded(&self, entity_id: &str) -> bool {
        let group = entity_group(entity_id, self.group_delimiter);
        self.excluded_groups.iter().any(|g| g == group)
    }
}

pub fn check_threshold(threshold: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::ThresholdOutOfRange(threshold));
    }
    Ok(())
}

/// Thresholds in ascending order with repeats removed.
///
/// A repeated threshold would re-run the same walk-forward and land in the same
/// evaluation group, counting every prediction twice.
pub fn distinct_thresholds(thresholds: &[f64]) -> Vec<f64> {
    let mut distinct = thresholds.to_vec();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup_by(|a, b| a == b);
    distinct
}

/// Bookkeeping for one entity at one threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity_id: String,
    pub threshold: f64,
    /// Feature rows available to the backtest
    pub rows: usize,
    pub steps_attempted: usize,
    pub skipped_single_class: usize,
    pub skipped_fit_error: usize,
    pub predictions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityBacktest {
    pub summary: EntitySummary,
    pub records: Vec<PredictionRecord>,
}

/// Merged result over every entity (and every threshold, for a sweep)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktestRun {
    pub records: Vec<PredictionRecord>,
    pub entities: Vec<EntitySummary>,
    pub excluded_entities: Vec<String>,
}

impl BacktestRun {
    fn merge(&mut self, other: BacktestRun) {
        self.records.extend(other.records);
        self.entities.extend(other.entities);
        for id in other.excluded_entities {
            if !self.excluded_entities.contains(&id) {
                self.excluded_entities.push(id);
            }
        }
    }

    /// Sort into (threshold, entity, period) order.
    ///
    /// Every aggregate is computed from this order, so the result does not
    /// depend on which worker finished first.
    pub fn canonicalize(&mut self) {
        sort_records(&mut self.records);
        self.entities.sort_by(|a, b| {
            a.threshold
                .total_cmp(&b.threshold)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        self.excluded_entities.sort();
    }

    pub fn skipped_steps(&self) -> usize {
        self.entities
            .iter()
            .map(|e| e.skipped_single_class + e.skipped_fit_error)
            .sum()
    }
}

/// Canonical record order: threshold, then entity, then period
pub fn sort_records(records: &mut [PredictionRecord]) {
    records.sort_by(|a, b| {
        a.threshold
            .total_cmp(&b.threshold)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
            .then_with(|| a.period_start.cmp(&b.period_start))
    });
}

/// Walk forward through one entity's feature rows.
///
/// Steps run for `i = start, start + step, ...` while `i < rows - step`,
/// fitting on the training window ending at `i` and predicting rows
/// `i..i + step`. A step whose training labels hold a single class, or whose
/// fit fails, is skipped and counted; it never aborts the entity.
pub fn backtest_entity(
    table: &FeatureTable,
    classifier: &dyn Classifier,
    config: &BacktestConfig,
    threshold: f64,
) -> EntityBacktest {
    let n = table.len();
    let step = config.step.max(1);
    let end = n.saturating_sub(step);

    let mut summary = EntitySummary {
        entity_id: table.entity_id.clone(),
        threshold,
        rows: n,
        steps_attempted: 0,
        skipped_single_class: 0,
        skipped_fit_error: 0,
        predictions: 0,
    };
    let mut records = Vec::new();

    let mut i = config.start;
    while i < end {
        summary.steps_attempted += 1;

        let lo = match config.window {
            TrainingWindow::Expanding => 0,
            TrainingWindow::Fixed { rows } => i.saturating_sub(rows),
        };
        let train = &table.rows[lo..i];
        let test = &table.rows[i..i + step];

        let train_x: Vec<&[f64]> = train.iter().map(|r| r.values.as_slice()).collect();
        let train_y: Vec<Outcome> = train.iter().map(|r| r.label).collect();

        if distinct_classes(&train_y) < 2 {
            debug!(entity = %table.entity_id, step = i, train_rows = train.len(), "single-class training window, skipping step");
            summary.skipped_single_class += 1;
            i += step;
            continue;
        }

        let model = match classifier.train(&train_x, &train_y) {
            Ok(model) => model,
            Err(e) => {
                warn!(entity = %table.entity_id, step = i, error = %e, "fit failed, skipping step");
                summary.skipped_fit_error += 1;
                i += step;
                continue;
            }
        };

        let test_x: Vec<&[f64]> = test.iter().map(|r| r.values.as_slice()).collect();
        let scored: Vec<(Outcome, Option<f64>)> = match model.predict_proba(&test_x) {
            Some(probs) => probs
                .into_iter()
                .map(|p| (Outcome::from_probability(p, threshold), Some(p)))
                .collect(),
            None => model.predict(&test_x).into_iter().map(|o| (o, None)).collect(),
        };

        for (row, (predicted, probability)) in test.iter().zip(scored) {
            records.push(PredictionRecord {
                entity_id: table.entity_id.clone(),
                period_start: row.period_start,
                threshold,
                actual: row.label,
                predicted,
                probability,
            });
        }

        i += step;
    }

    summary.predictions = records.len();
    debug!(
        entity = %table.entity_id,
        rows = n,
        predictions = summary.predictions,
        skipped = summary.skipped_single_class + summary.skipped_fit_error,
        "entity backtested"
    );

    EntityBacktest { summary, records }
}

fn split_excluded<'a>(
    tables: &'a [FeatureTable],
    config: &BacktestConfig,
) -> (Vec<&'a FeatureTable>, Vec<String>) {
    let mut kept = Vec::new();
    let mut excluded = Vec::new();
    for table in tables {
        if config.is_excluded(&table.entity_id) {
            excluded.push(table.entity_id.clone());
        } else {
            kept.push(table);
        }
    }
    (kept, excluded)
}

/// Backtest every entity in turn at a single threshold
pub fn run_backtest(
    tables: &[FeatureTable],
    classifier: &dyn Classifier,
    config: &BacktestConfig,
    threshold: f64,
) -> BacktestRun {
    let (kept, excluded) = split_excluded(tables, config);
    if !excluded.is_empty() {
        info!(count = excluded.len(), "entities excluded by group");
    }

    let mut run = BacktestRun {
        excluded_entities: excluded,
        ..BacktestRun::default()
    };
    for table in kept {
        let result = backtest_entity(table, classifier, config, threshold);
        run.records.extend(result.records);
        run.entities.push(result.summary);
    }

    run.canonicalize();
    run
}

/// Same as [`run_backtest`], with entities fanned out over blocking workers.
///
/// At most `config.concurrency` entities are fitted at once. Results are
/// merged by concatenation and then put in canonical order.
pub async fn run_backtest_concurrent(
    tables: Arc<Vec<FeatureTable>>,
    classifier: Arc<dyn Classifier>,
    config: &BacktestConfig,
    threshold: f64,
) -> Result<BacktestRun, PipelineError> {
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let shared_config = Arc::new(config.clone());

    let mut run = BacktestRun::default();
    let mut handles = Vec::new();

    for (idx, table) in tables.iter().enumerate() {
        if config.is_excluded(&table.entity_id) {
            run.excluded_entities.push(table.entity_id.clone());
            continue;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;
        let tables = Arc::clone(&tables);
        let classifier = Arc::clone(&classifier);
        let config = Arc::clone(&shared_config);

        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            backtest_entity(&tables[idx], classifier.as_ref(), &config, threshold)
        }));
    }

    if !run.excluded_entities.is_empty() {
        info!(count = run.excluded_entities.len(), "entities excluded by group");
    }

    for handle in handles {
        let result = handle
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;
        run.records.extend(result.records);
        run.entities.push(result.summary);
    }

    run.canonicalize();
    Ok(run)
}

/// Re-run the full walk-forward once per distinct threshold.
///
/// Every threshold gets its own fits; records are tagged with the threshold
/// that produced them.
pub fn run_threshold_sweep(
    tables: &[FeatureTable],
    classifier: &dyn Classifier,
    config: &BacktestConfig,
    thresholds: &[f64],
) -> BacktestRun {
    let mut sweep = BacktestRun::default();
    for threshold in distinct_thresholds(thresholds) {
        info!(threshold, "sweep pass");
        sweep.merge(run_backtest(tables, classifier, config, threshold));
    }
    sweep.canonicalize();
    sweep
}

/// Async counterpart of [`run_threshold_sweep`]
pub async fn run_threshold_sweep_concurrent(
    tables: Arc<Vec<FeatureTable>>,
    classifier: Arc<dyn Classifier>,
    config: &BacktestConfig,
    thresholds: &[f64],
) -> Result<BacktestRun, PipelineError> {
    let mut sweep = BacktestRun::default();
    for threshold in distinct_thresholds(thresholds) {
        info!(threshold, "sweep pass");
        let run =
            run_backtest_concurrent(Arc::clone(&tables), Arc::clone(&classifier), config, threshold)
                .await?;
        sweep.merge(run);
    }
    sweep.canonicalize();
    Ok(sweep)
}

//! End-to-end run: timelines -> feature tables -> walk-forward -> metrics.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backtest::{
    check_threshold, distinct_thresholds, run_threshold_sweep, run_threshold_sweep_concurrent,
    EntitySummary,
};
use crate::config::AppConfig;
use crate::error::{PipelineError, TimelineError};
use crate::evaluate::{evaluate, Evaluation};
use crate::features::{derive_features, FeatureConfig};
use crate::model::build_classifier;
use crate::models::{FeatureTable, PredictionRecord};
use crate::timeline::{RawObservation, TimelineStore};

/// Everything a run produced, for export and reporting
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub model: String,
    pub feature_names: Vec<String>,
    pub entities_loaded: usize,
    pub observations: usize,
    pub rejected: usize,
    pub integrity_failures: Vec<TimelineError>,
    pub excluded_entities: Vec<String>,
    pub entities: Vec<EntitySummary>,
    pub records: Vec<PredictionRecord>,
    pub evaluation: Evaluation,
}

impl RunOutput {
    pub fn skipped_steps(&self) -> usize {
        self.entities
            .iter()
            .map(|e| e.skipped_single_class + e.skipped_fit_error)
            .sum()
    }
}

/// One feature table per entity, in entity-id order.
/// Entities with too little history come back with zero rows.
pub fn derive_tables(store: &TimelineStore, config: &FeatureConfig) -> Vec<FeatureTable> {
    store
        .timelines
        .values()
        .map(|timeline| derive_features(timeline, config))
        .collect()
}

/// Validate and group raw records, then run [`run_store`]
pub async fn run(
    config: &AppConfig,
    raws: Vec<RawObservation>,
    thresholds: &[f64],
) -> Result<RunOutput, PipelineError> {
    run_store(config, TimelineStore::build(raws), thresholds).await
}

/// Backtest every admitted entity at each threshold and score the result.
///
/// An empty `thresholds` slice means the configured single threshold; repeats
/// are run once.
/// Zero predictions overall is an error.
pub async fn run_store(
    config: &AppConfig,
    store: TimelineStore,
    thresholds: &[f64],
) -> Result<RunOutput, PipelineError> {
    config.validate()?;

    let thresholds = if thresholds.is_empty() {
        vec![config.backtest.threshold]
    } else {
        distinct_thresholds(thresholds)
    };
    for &t in &thresholds {
        check_threshold(t)?;
    }

    info!(
        entities = store.len(),
        observations = store.total_observations(),
        rejected = store.rejected_count(),
        "timelines built"
    );
    for failure in &store.integrity_failures {
        warn!(error = %failure, "entity dropped");
    }

    let tables = derive_tables(&store, &config.features);
    let feature_rows: usize = tables.iter().map(FeatureTable::len).sum();
    info!(
        tables = tables.len(),
        rows = feature_rows,
        columns = config.features.names().len(),
        "features derived"
    );

    let classifier = build_classifier(&config.model);
    let model = classifier.name().to_string();
    info!(model = %model, thresholds = ?thresholds, concurrency = config.backtest.concurrency, "starting walk-forward");

    let run = if config.backtest.concurrency > 1 {
        run_threshold_sweep_concurrent(Arc::new(tables), classifier, &config.backtest, &thresholds).await?
    } else {
        run_threshold_sweep(&tables, classifier.as_ref(), &config.backtest, &thresholds)
    };

    info!(
        predictions = run.records.len(),
        skipped_steps = run.skipped_steps(),
        excluded = run.excluded_entities.len(),
        "walk-forward finished"
    );

    let evaluation = evaluate(&run.records)?;

    Ok(RunOutput {
        model,
        feature_names: config.features.names(),
        entities_loaded: store.len(),
        observations: store.total_observations(),
        rejected: store.rejected_count(),
        integrity_failures: store.integrity_failures,
        excluded_entities: run.excluded_entities,
        entities: run.entities,
        records: run.records,
        evaluation,
    })
}

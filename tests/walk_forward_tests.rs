//! Walk-forward tests for the card price-direction backtest
//!
//! These tests exercise the full path from raw weekly records to metrics:
//! 1. Labels look exactly one observed week ahead
//! 2. Nothing after a prediction's period can change it
//! 3. Short, degenerate and malformed entities are skipped, never fatal
//! 4. Merge order and worker scheduling never change the result
//! 5. Exports land where the report says they do
//!
//! Run with: cargo test --test walk_forward_tests

use chrono::{Duration, NaiveDate};
use std::sync::Arc;

use tcg_price_direction::backtest::{run_backtest, run_backtest_concurrent, BacktestConfig};
use tcg_price_direction::config::AppConfig;
use tcg_price_direction::error::{EvalError, PipelineError, TimelineError};
use tcg_price_direction::evaluate::evaluate;
use tcg_price_direction::features::{derive_features, Alignment, FeatureConfig};
use tcg_price_direction::model::{build_classifier, ForestConfig, ModelConfig};
use tcg_price_direction::models::{FeatureRow, FeatureTable, Outcome};
use tcg_price_direction::output;
use tcg_price_direction::pipeline;
use tcg_price_direction::timeline::{RawObservation, TimelineStore};

fn week(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 7).unwrap() + Duration::weeks(i as i64)
}

fn raw(entity: &str, i: usize, price: f64) -> RawObservation {
    RawObservation {
        entity_id: Some(entity.to_string()),
        period_start: Some(week(i).format("%Y-%m-%d").to_string()),
        volume: Some(((i * 3) % 7 + 1) as f64),
        min_price: Some(price * 0.9),
        max_price: Some(price * 1.1),
        avg_price: Some(price),
    }
}

fn weekly(entity: &str, prices: &[f64]) -> Vec<RawObservation> {
    prices.iter().enumerate().map(|(i, &p)| raw(entity, i, p)).collect()
}

/// Prices that wander up and down so every training window sees both classes
fn wobble(n: usize, phase: usize) -> Vec<f64> {
    (0..n).map(|t| 10.0 + ((t * 7 + phase * 3) % 5) as f64).collect()
}

fn small_features() -> FeatureConfig {
    FeatureConfig {
        include_base: true,
        lag_orders: vec![1],
        price_ratio_windows: vec![2],
        trend_windows: vec![2],
        ..FeatureConfig::empty()
    }
}

fn test_config(concurrency: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.features = small_features();
    config.model = ModelConfig::RandomForest(ForestConfig {
        n_trees: 10,
        ..ForestConfig::default()
    });
    config.backtest.concurrency = concurrency;
    config
}

fn universe() -> Vec<RawObservation> {
    let mut raws = Vec::new();
    for k in 0..4 {
        raws.extend(weekly(&format!("sv{}-{}", k % 2 + 1, k), &wobble(24, k)));
    }
    raws
}

// ============================================================================
// LABELS
// ============================================================================

#[test]
fn test_labels_follow_next_observed_week() {
    let store = TimelineStore::build(weekly("sv1-1", &[10.0, 12.0, 12.0, 9.0]));
    let config = FeatureConfig {
        include_base: true,
        ..FeatureConfig::empty()
    };

    let table = derive_features(&store.timelines["sv1-1"], &config);

    // 10 -> 12 up, 12 -> 12 flat counts as down, 12 -> 9 down; last week has no label
    assert_eq!(table.labels(), vec![Outcome::Up, Outcome::Down, Outcome::Down]);
}

#[test]
fn test_shuffled_input_gives_same_features() {
    let mut raws = weekly("sv1-1", &wobble(12, 0));
    let ordered = TimelineStore::build(raws.clone());
    raws.reverse();
    let shuffled = TimelineStore::build(raws);

    let config = small_features();
    assert_eq!(
        derive_features(&ordered.timelines["sv1-1"], &config),
        derive_features(&shuffled.timelines["sv1-1"], &config)
    );
}

// ============================================================================
// NO LOOK-AHEAD
// ============================================================================

#[test]
fn test_future_prices_do_not_change_past_predictions() {
    let prices = wobble(30, 1);
    let mut shocked = prices.clone();
    for p in shocked.iter_mut().skip(20) {
        *p = 1000.0 + *p;
    }

    let config = small_features();
    let classifier = build_classifier(&ModelConfig::RandomForest(ForestConfig {
        n_trees: 8,
        ..ForestConfig::default()
    }));
    let bt = BacktestConfig::default();

    let run_for = |prices: &[f64]| {
        let store = TimelineStore::build(weekly("sv1-1", prices));
        let table = derive_features(&store.timelines["sv1-1"], &config);
        run_backtest(&[table], classifier.as_ref(), &bt, 0.5)
    };

    let base = run_for(&prices);
    let after = run_for(&shocked);

    // Week 19's label looks at week 20, so only predictions before week 20 are comparable
    let cutoff = week(20);
    let before: Vec<_> = base.records.iter().filter(|r| r.period_start < cutoff).collect();
    let before_shock: Vec<_> = after.records.iter().filter(|r| r.period_start < cutoff).collect();

    assert!(!before.is_empty());
    assert_eq!(before.len(), before_shock.len());
    for (a, b) in before.iter().zip(&before_shock) {
        assert_eq!(a.period_start, b.period_start);
        assert_eq!(a.predicted, b.predicted);
        assert_eq!(a.probability, b.probability);
    }
}

#[test]
fn test_evaluated_rows_start_at_start_and_skip_last() {
    let rows: Vec<FeatureRow> = (0..14)
        .map(|i| FeatureRow {
            entity_id: "sv1-1".to_string(),
            period_start: week(i),
            label: if i >= 10 || i % 4 == 0 { Outcome::Up } else { Outcome::Down },
            values: vec![i as f64],
        })
        .collect();
    let table = FeatureTable {
        entity_id: "sv1-1".to_string(),
        names: vec!["index".to_string()],
        rows,
    };

    let classifier = build_classifier(&ModelConfig::default());
    let run = run_backtest(&[table], classifier.as_ref(), &BacktestConfig::default(), 0.5);

    // rows 4..=12; row 13 is never scored because i < rows - step
    assert_eq!(run.records.len(), 9);
    assert!(run.records.iter().all(|r| r.period_start >= week(4)));
    assert!(run.records.iter().all(|r| r.period_start < week(13)));
}

// ============================================================================
// WINDOW INSUFFICIENCY AND DEGENERATE ENTITIES
// ============================================================================

#[test]
fn test_short_entity_contributes_no_rows() {
    let store = TimelineStore::build(weekly("sv1-1", &wobble(10, 0)));
    let table = derive_features(&store.timelines["sv1-1"], &FeatureConfig::default());
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_all_entities_too_short_is_an_error() {
    let mut config = test_config(1);
    config.features = FeatureConfig::default();

    let mut raws = weekly("sv1-1", &wobble(10, 0));
    raws.extend(weekly("sv1-2", &wobble(12, 1)));

    let result = pipeline::run(&config, raws, &[]).await;
    assert!(matches!(result, Err(PipelineError::Eval(EvalError::NoPredictions))));
}

#[tokio::test]
async fn test_flat_entity_is_skipped_not_fatal() {
    let mut raws = weekly("sv1-flat", &[7.5; 24]);
    raws.extend(weekly("sv1-live", &wobble(24, 2)));

    let out = pipeline::run(&test_config(1), raws, &[]).await.unwrap();

    let flat = out.entities.iter().find(|e| e.entity_id == "sv1-flat").unwrap();
    assert!(flat.steps_attempted > 0);
    assert_eq!(flat.skipped_single_class, flat.steps_attempted);
    assert_eq!(flat.predictions, 0);

    assert!(out.records.iter().all(|r| r.entity_id == "sv1-live"));
    assert!(out.evaluation.total_predictions() > 0);
}

#[tokio::test]
async fn test_malformed_and_duplicate_records_are_reported() {
    let mut raws = universe();
    let mut bad = raw("sv1-0", 40, 3.0);
    bad.volume = Some(-2.0);
    raws.push(bad);
    raws.push(RawObservation::default());
    raws.extend(weekly("sv9-dupe", &wobble(24, 0)));
    raws.push(raw("sv9-dupe", 3, 99.0));

    let out = pipeline::run(&test_config(1), raws, &[]).await.unwrap();

    assert_eq!(out.rejected, 2);
    assert_eq!(out.entities_loaded, 4);
    assert_eq!(
        out.integrity_failures,
        vec![TimelineError::DuplicatePeriod {
            entity_id: "sv9-dupe".to_string(),
            period_start: week(3),
        }]
    );
    assert!(out.records.iter().all(|r| r.entity_id != "sv9-dupe"));
}

#[test]
fn test_calendar_alignment_breaks_windows_at_gaps() {
    let mut raws = weekly("sv1-1", &wobble(12, 0));
    // drop week 6
    raws.remove(6);
    let store = TimelineStore::build(raws);
    let timeline = &store.timelines["sv1-1"];

    let observed = derive_features(timeline, &small_features());
    let calendar = derive_features(
        timeline,
        &FeatureConfig {
            alignment: Alignment::Calendar { period_days: 7 },
            ..small_features()
        },
    );

    assert!(calendar.len() < observed.len());
    assert!(calendar.rows.iter().all(|r| r.period_start != week(5)));
    assert!(observed.rows.iter().any(|r| r.period_start == week(5)));
}

// ============================================================================
// END TO END
// ============================================================================

fn alternating_table(entity: &str, n: usize) -> FeatureTable {
    FeatureTable {
        entity_id: entity.to_string(),
        names: vec!["parity".to_string(), "bias".to_string()],
        rows: (0..n)
            .map(|i| FeatureRow {
                entity_id: entity.to_string(),
                period_start: week(i),
                label: if i % 2 == 0 { Outcome::Up } else { Outcome::Down },
                values: vec![(i % 2) as f64, 1.0],
            })
            .collect(),
    }
}

#[test]
fn test_two_entities_twenty_rows_thirty_predictions() {
    let tables = vec![alternating_table("sv1-1", 20), alternating_table("sv2-1", 20)];
    let classifier = build_classifier(&ModelConfig::RandomForest(ForestConfig {
        n_trees: 10,
        ..ForestConfig::default()
    }));
    let cfg = BacktestConfig::default();

    let run = run_backtest(&tables, classifier.as_ref(), &cfg, 0.5);
    assert_eq!(run.records.len(), 30);
    assert_eq!(run.entities.iter().map(|e| e.predictions).sum::<usize>(), 30);

    let eval = evaluate(&run.records).unwrap();
    assert_eq!(eval.thresholds.len(), 1);
    assert_eq!(eval.thresholds[0].predictions, 30);
    assert_eq!(eval.thresholds[0].confusion.total(), 30);
    // parity decides the label exactly
    assert!(eval.thresholds[0].accuracy > 0.9);
}

#[tokio::test]
async fn test_threshold_sweep_is_monotone_in_up_calls() {
    let thresholds = [0.4, 0.5, 0.6, 0.7, 0.8];
    let out = pipeline::run(&test_config(1), universe(), &thresholds).await.unwrap();

    assert_eq!(out.evaluation.thresholds.len(), thresholds.len());
    let up_calls: Vec<usize> = out
        .evaluation
        .thresholds
        .iter()
        .map(|t| t.confusion.true_positive + t.confusion.false_positive)
        .collect();
    for pair in up_calls.windows(2) {
        assert!(pair[0] >= pair[1], "UP calls rose with the threshold: {:?}", up_calls);
    }

    let recall: Vec<f64> = out.evaluation.thresholds.iter().map(|t| t.recall).collect();
    for pair in recall.windows(2) {
        assert!(pair[0] >= pair[1], "recall rose with the threshold: {:?}", recall);
    }

    // every threshold scores the same periods
    let counts: Vec<usize> = out.evaluation.thresholds.iter().map(|t| t.predictions).collect();
    assert!(counts.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_repeated_sweep_threshold_is_counted_once() {
    let config = test_config(1);
    let once = pipeline::run(&config, universe(), &[0.5]).await.unwrap();
    let twice = pipeline::run(&config, universe(), &[0.5, 0.5]).await.unwrap();

    assert_eq!(twice.evaluation.thresholds.len(), 1);
    assert_eq!(twice.records, once.records);
    assert_eq!(twice.evaluation, once.evaluation);
    assert_eq!(twice.entities.len(), once.entities.len());
}

// ============================================================================
// ORDER INDEPENDENCE
// ============================================================================

#[tokio::test]
async fn test_input_order_does_not_change_metrics() {
    let config = test_config(1);
    let raws = universe();
    let mut reversed = raws.clone();
    reversed.reverse();

    let a = pipeline::run(&config, raws, &[]).await.unwrap();
    let b = pipeline::run(&config, reversed, &[]).await.unwrap();

    assert_eq!(a.records, b.records);
    assert_eq!(a.evaluation, b.evaluation);
}

#[tokio::test]
async fn test_concurrent_matches_sequential() {
    let sequential = pipeline::run(&test_config(1), universe(), &[0.5, 0.6]).await.unwrap();
    let concurrent = pipeline::run(&test_config(4), universe(), &[0.5, 0.6]).await.unwrap();

    assert_eq!(sequential.records, concurrent.records);
    assert_eq!(sequential.evaluation, concurrent.evaluation);
    assert_eq!(sequential.entities, concurrent.entities);
}

#[tokio::test]
async fn test_concurrent_runner_honours_exclusions() {
    let tables = Arc::new(vec![alternating_table("promo-1", 12), alternating_table("sv1-1", 12)]);
    let cfg = BacktestConfig {
        excluded_groups: vec!["promo".to_string()],
        concurrency: 2,
        ..BacktestConfig::default()
    };

    let run = run_backtest_concurrent(tables, build_classifier(&ModelConfig::default()), &cfg, 0.6)
        .await
        .unwrap();

    assert_eq!(run.excluded_entities, vec!["promo-1".to_string()]);
    assert!(run.records.iter().all(|r| r.entity_id == "sv1-1"));
}

// ============================================================================
// EXPORTS
// ============================================================================

#[tokio::test]
async fn test_write_all_exports() {
    let out = pipeline::run(&test_config(2), universe(), &[0.5, 0.7]).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    output::write_all(&out, dir.path(), true).unwrap();

    for name in [
        "predictions.csv",
        "metrics.csv",
        "entity_accuracy.csv",
        "period_accuracy.csv",
        "summary.json",
        "report.txt",
    ] {
        assert!(dir.path().join(name).exists(), "missing {}", name);
    }

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["model"], "random_forest");
    assert_eq!(summary["evaluation"]["thresholds"].as_array().unwrap().len(), 2);

    let predictions = std::fs::read_to_string(dir.path().join("predictions.csv")).unwrap();
    assert_eq!(predictions.lines().count(), out.records.len() + 1);

    let report = std::fs::read_to_string(dir.path().join("report.txt")).unwrap();
    assert!(report.contains("METRICS BY THRESHOLD"));
}

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::backtest::EntitySummary;
use crate::evaluate::{Evaluation, ThresholdReport};
use crate::models::{FeatureTable, PredictionRecord};
use crate::pipeline::RunOutput;

/// Export every out-of-sample prediction to CSV
/// Format: entity_id, period_start, threshold, actual, predicted, probability, correct
pub fn export_predictions_csv(records: &[PredictionRecord], path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record([
        "entity_id",
        "period_start",
        "threshold",
        "actual",
        "predicted",
        "probability",
        "correct",
    ])?;

    for r in records {
        wtr.write_record(&[
            r.entity_id.clone(),
            r.period_start.format("%Y-%m-%d").to_string(),
            format!("{:.2}", r.threshold),
            r.actual.as_u8().to_string(),
            r.predicted.as_u8().to_string(),
            r.probability.map(|p| format!("{:.4}", p)).unwrap_or_default(),
            u8::from(r.is_correct()).to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Export one row of headline metrics per threshold
pub fn export_metrics_csv(evaluation: &Evaluation, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record([
        "threshold",
        "predictions",
        "true_positive",
        "false_positive",
        "true_negative",
        "false_negative",
        "precision",
        "recall",
        "f1",
        "accuracy",
        "accuracy_ci_lower",
        "accuracy_ci_upper",
        "predicted_up_rate",
        "actual_up_rate",
        "brier_score",
    ])?;

    for t in &evaluation.thresholds {
        wtr.write_record(&[
            format!("{:.2}", t.threshold),
            t.predictions.to_string(),
            t.confusion.true_positive.to_string(),
            t.confusion.false_positive.to_string(),
            t.confusion.true_negative.to_string(),
            t.confusion.false_negative.to_string(),
            format!("{:.4}", t.precision),
            format!("{:.4}", t.recall),
            format!("{:.4}", t.f1),
            format!("{:.4}", t.accuracy),
            format!("{:.4}", t.accuracy_ci_lower),
            format!("{:.4}", t.accuracy_ci_upper),
            format!("{:.4}", t.predicted_up_rate),
            format!("{:.4}", t.actual_up_rate),
            t.brier_score.map(|b| format!("{:.4}", b)).unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Per-entity accuracy, best first within each threshold
pub fn export_entity_accuracy_csv(evaluation: &Evaluation, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record(["threshold", "rank", "entity_id", "predictions", "correct", "accuracy"])?;

    for t in &evaluation.thresholds {
        for (rank, e) in t.entity_accuracy.iter().enumerate() {
            wtr.write_record(&[
                format!("{:.2}", t.threshold),
                (rank + 1).to_string(),
                e.entity_id.clone(),
                e.predictions.to_string(),
                e.correct.to_string(),
                format!("{:.4}", e.accuracy),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Per-period accuracy, oldest first within each threshold
pub fn export_period_accuracy_csv(evaluation: &Evaluation, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record(["threshold", "period_start", "predictions", "correct", "accuracy"])?;

    for t in &evaluation.thresholds {
        for p in &t.period_accuracy {
            wtr.write_record(&[
                format!("{:.2}", t.threshold),
                p.period_start.format("%Y-%m-%d").to_string(),
                p.predictions.to_string(),
                p.correct.to_string(),
                format!("{:.4}", p.accuracy),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Derived feature rows for every entity, one CSV row per admitted period
pub fn export_features_csv(tables: &[FeatureTable], path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let Some(first) = tables.first() else {
        wtr.flush()?;
        return Ok(());
    };

    let mut header = vec!["entity_id".to_string(), "period_start".to_string()];
    header.extend(first.names.iter().cloned());
    header.push("label".to_string());
    wtr.write_record(&header)?;

    for table in tables {
        for row in &table.rows {
            let mut record = vec![row.entity_id.clone(), row.period_start.format("%Y-%m-%d").to_string()];
            record.extend(row.values.iter().map(|v| format!("{:.6}", v)));
            record.push(row.label.as_u8().to_string());
            wtr.write_record(&record)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    model: &'a str,
    feature_names: &'a [String],
    entities_loaded: usize,
    observations: usize,
    rejected_observations: usize,
    integrity_failures: Vec<String>,
    excluded_entities: &'a [String],
    skipped_steps: usize,
    entities: &'a [EntitySummary],
    evaluation: &'a Evaluation,
}

/// Export run bookkeeping and the full evaluation (without per-prediction rows) to JSON
pub fn export_summary_json(output: &RunOutput, path: &Path) -> Result<()> {
    let doc = SummaryDocument {
        model: &output.model,
        feature_names: &output.feature_names,
        entities_loaded: output.entities_loaded,
        observations: output.observations,
        rejected_observations: output.rejected,
        integrity_failures: output.integrity_failures.iter().map(ToString::to_string).collect(),
        excluded_entities: &output.excluded_entities,
        skipped_steps: output.skipped_steps(),
        entities: &output.entities,
        evaluation: &output.evaluation,
    };

    let json = serde_json::to_string_pretty(&doc)?;
    let mut file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Write every export plus the text report into `dir`
pub fn write_all(output: &RunOutput, dir: &Path, write_predictions: bool) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output dir {}", dir.display()))?;

    if write_predictions {
        export_predictions_csv(&output.records, &dir.join("predictions.csv"))?;
    }
    export_metrics_csv(&output.evaluation, &dir.join("metrics.csv"))?;
    export_entity_accuracy_csv(&output.evaluation, &dir.join("entity_accuracy.csv"))?;
    export_period_accuracy_csv(&output.evaluation, &dir.join("period_accuracy.csv"))?;
    export_summary_json(output, &dir.join("summary.json"))?;

    let report = generate_report(output);
    std::fs::write(dir.join("report.txt"), report)
        .with_context(|| format!("Failed to write report in {}", dir.display()))?;
    Ok(())
}

fn push_threshold_block(report: &mut String, t: &ThresholdReport) {
    report.push_str(&format!("Threshold {:.2}  (n={})\n", t.threshold, t.predictions));
    report.push_str(&format!(
        "  Accuracy:  {:.1}% (95% CI: {:.1}%-{:.1}%)\n",
        t.accuracy * 100.0,
        t.accuracy_ci_lower * 100.0,
        t.accuracy_ci_upper * 100.0
    ));
    report.push_str(&format!(
        "  Precision: {:.3}  Recall: {:.3}  F1: {:.3}\n",
        t.precision, t.recall, t.f1
    ));
    report.push_str(&format!(
        "  Confusion: TP={} FP={} TN={} FN={}\n",
        t.confusion.true_positive, t.confusion.false_positive, t.confusion.true_negative, t.confusion.false_negative
    ));
    report.push_str(&format!(
        "  Called UP: {:.1}% of periods (actual UP rate {:.1}%)\n",
        t.predicted_up_rate * 100.0,
        t.actual_up_rate * 100.0
    ));
    if let Some(brier) = t.brier_score {
        report.push_str(&format!("  Brier score: {:.4}\n", brier));
    }
}

/// Generate a human-readable summary report
pub fn generate_report(output: &RunOutput) -> String {
    let mut report = String::new();

    report.push_str("╔══════════════════════════════════════════════════════════════════╗\n");
    report.push_str("║      TCG PRICE DIRECTION - WALK-FORWARD BACKTEST REPORT          ║\n");
    report.push_str("╚══════════════════════════════════════════════════════════════════╝\n\n");

    report.push_str("📊 DATA SUMMARY\n");
    report.push_str("─────────────────────────────────────────\n");
    report.push_str(&format!("Model: {}\n", output.model));
    report.push_str(&format!("Features: {} columns\n", output.feature_names.len()));
    report.push_str(&format!("Entities loaded: {}\n", output.entities_loaded));
    report.push_str(&format!("Observations: {}\n", output.observations));
    report.push_str(&format!("Rejected observations: {}\n", output.rejected));
    report.push_str(&format!("Entities dropped (integrity): {}\n", output.integrity_failures.len()));
    report.push_str(&format!("Entities excluded by group: {}\n", output.excluded_entities.len()));
    report.push_str(&format!("Walk-forward steps skipped: {}\n", output.skipped_steps()));
    if let (Some(first), Some(last)) = (
        output.records.iter().map(|r| r.period_start).min(),
        output.records.iter().map(|r| r.period_start).max(),
    ) {
        report.push_str(&format!("Predicted periods: {} to {}\n", first, last));
    }
    report.push('\n');

    report.push_str("📈 METRICS BY THRESHOLD\n");
    report.push_str("─────────────────────────────────────────\n");
    for t in &output.evaluation.thresholds {
        push_threshold_block(&mut report, t);
        report.push('\n');
    }

    if let Some(best) = output.evaluation.best_by_f1() {
        if output.evaluation.thresholds.len() > 1 {
            report.push_str(&format!("Best F1 at threshold {:.2} (F1={:.3})\n\n", best.threshold, best.f1));
        }

        report.push_str(&format!("🎯 TOP ENTITIES (threshold {:.2})\n", best.threshold));
        report.push_str("─────────────────────────────────────────\n");
        for e in best.entity_accuracy.iter().take(10) {
            report.push_str(&format!(
                "  {:<20} {:.1}% ({}/{})\n",
                e.entity_id,
                e.accuracy * 100.0,
                e.correct,
                e.predictions
            ));
        }
        report.push('\n');

        if !best.calibration.is_empty() {
            report.push_str("🔎 CALIBRATION\n");
            report.push_str("─────────────────────────────────────────\n");
            for b in &best.calibration {
                report.push_str(&format!(
                    "  P(UP) {:.1}-{:.1}: mean {:.2}, observed {:.2} [n={}]\n",
                    b.lower, b.upper, b.mean_probability, b.observed_up_rate, b.count
                ));
            }
            report.push('\n');
        }
    }

    report.push_str("═══════════════════════════════════════════════════════════════════\n");

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::evaluate;
    use crate::models::Outcome;
    use chrono::NaiveDate;

    fn records() -> Vec<PredictionRecord> {
        vec![
            PredictionRecord {
                entity_id: "sv1-1".to_string(),
                period_start: NaiveDate::from_ymd_opt(2024, 2, 4).unwrap(),
                threshold: 0.6,
                actual: Outcome::Up,
                predicted: Outcome::Up,
                probability: Some(0.72),
            },
            PredictionRecord {
                entity_id: "sv1-2".to_string(),
                period_start: NaiveDate::from_ymd_opt(2024, 2, 4).unwrap(),
                threshold: 0.6,
                actual: Outcome::Up,
                predicted: Outcome::Down,
                probability: None,
            },
        ]
    }

    #[test]
    fn test_predictions_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        export_predictions_csv(&records(), &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "entity_id,period_start,threshold,actual,predicted,probability,correct");
        assert_eq!(lines[1], "sv1-1,2024-02-04,0.60,1,1,0.7200,1");
        assert_eq!(lines[2], "sv1-2,2024-02-04,0.60,1,0,,0");
    }

    #[test]
    fn test_metrics_csv_has_row_per_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let eval = evaluate(&records()).unwrap();
        export_metrics_csv(&eval, &path).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "0.60");
        assert_eq!(&rows[0][1], "2");
        assert_eq!(&rows[0][9], "0.5000");
    }
}

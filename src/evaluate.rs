use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;

use crate::backtest::sort_records;
use crate::error::EvalError;
use crate::models::{Outcome, PredictionRecord};

/// Confidence level for accuracy intervals
const CONFIDENCE: f64 = 0.95;

/// Equal-width calibration buckets over [0, 1]
const CALIBRATION_BUCKETS: usize = 10;

/// Two-sided z-score for a confidence level
fn z_score(confidence: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0),
        Err(_) => 1.96,
    }
}

/// Wilson score interval for a binomial proportion.
///
/// Returns (lower_bound, upper_bound); (0, 1) when there are no trials.
pub fn wilson_score_interval(successes: usize, total: usize, confidence: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 1.0);
    }

    let n = total as f64;
    let p_hat = successes as f64 / n;
    let z = z_score(confidence);
    let z_squared = z * z;

    let denominator = 1.0 + z_squared / n;
    let center = (p_hat + z_squared / (2.0 * n)) / denominator;
    let margin = z * ((p_hat * (1.0 - p_hat) + z_squared / (4.0 * n)) / n).sqrt() / denominator;

    ((center - margin).max(0.0), (center + margin).min(1.0))
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Counts with `Up` as the positive class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionMatrix {
    pub fn add(&mut self, actual: Outcome, predicted: Outcome) {
        match (actual, predicted) {
            (Outcome::Up, Outcome::Up) => self.true_positive += 1,
            (Outcome::Down, Outcome::Up) => self.false_positive += 1,
            (Outcome::Down, Outcome::Down) => self.true_negative += 1,
            (Outcome::Up, Outcome::Down) => self.false_negative += 1,
        }
    }

    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a PredictionRecord>,
    {
        let mut cm = Self::default();
        for r in records {
            cm.add(r.actual, r.predicted);
        }
        cm
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn correct(&self) -> usize {
        self.true_positive + self.true_negative
    }

    /// 0 when nothing was predicted `Up`
    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    /// 0 when nothing was actually `Up`
    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAccuracy {
    pub entity_id: String,
    pub predictions: usize,
    pub correct: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodAccuracy {
    pub period_start: NaiveDate,
    pub predictions: usize,
    pub correct: usize,
    pub accuracy: f64,
}

/// Predicted probability vs. realised Up rate over one probability band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_probability: f64,
    pub observed_up_rate: f64,
}

/// All metrics for the predictions made at one decision threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub threshold: f64,
    pub predictions: usize,
    pub confusion: ConfusionMatrix,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub accuracy_ci_lower: f64,
    pub accuracy_ci_upper: f64,
    /// Share of predictions that were `Up`
    pub predicted_up_rate: f64,
    /// Share of actual outcomes that were `Up`
    pub actual_up_rate: f64,
    /// Mean squared error of P(Up); `None` without probabilistic records
    pub brier_score: Option<f64>,
    pub calibration: Vec<CalibrationBucket>,
    /// Best first
    pub entity_accuracy: Vec<EntityAccuracy>,
    /// Oldest period first
    pub period_accuracy: Vec<PeriodAccuracy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// One report per distinct threshold, ascending
    pub thresholds: Vec<ThresholdReport>,
}

impl Evaluation {
    pub fn total_predictions(&self) -> usize {
        self.thresholds.iter().map(|t| t.predictions).sum()
    }

    pub fn report(&self, threshold: f64) -> Option<&ThresholdReport> {
        self.thresholds.iter().find(|t| t.threshold == threshold)
    }

    /// Threshold with the highest F1; ties go to the lower threshold
    pub fn best_by_f1(&self) -> Option<&ThresholdReport> {
        self.thresholds
            .iter()
            .fold(None, |best: Option<&ThresholdReport>, t| match best {
                Some(b) if b.f1 >= t.f1 => Some(b),
                _ => Some(t),
            })
    }
}

/// Score a set of prediction records.
///
/// Records are put in canonical order first, so entity merge order never
/// changes any statistic. An empty set is an error, never a zero score.
pub fn evaluate(records: &[PredictionRecord]) -> Result<Evaluation, EvalError> {
    if records.is_empty() {
        return Err(EvalError::NoPredictions);
    }

    let mut sorted = records.to_vec();
    sort_records(&mut sorted);

    let mut thresholds = Vec::new();
    let mut begin = 0;
    while begin < sorted.len() {
        let threshold = sorted[begin].threshold;
        let end = sorted[begin..]
            .iter()
            .position(|r| r.threshold.to_bits() != threshold.to_bits())
            .map_or(sorted.len(), |offset| begin + offset);
        thresholds.push(threshold_report(threshold, &sorted[begin..end]));
        begin = end;
    }

    Ok(Evaluation { thresholds })
}

fn threshold_report(threshold: f64, records: &[PredictionRecord]) -> ThresholdReport {
    let confusion = ConfusionMatrix::from_records(records);
    let total = confusion.total();
    let (ci_lower, ci_upper) = wilson_score_interval(confusion.correct(), total, CONFIDENCE);

    ThresholdReport {
        threshold,
        predictions: total,
        confusion,
        precision: confusion.precision(),
        recall: confusion.recall(),
        f1: confusion.f1(),
        accuracy: confusion.accuracy(),
        accuracy_ci_lower: ci_lower,
        accuracy_ci_upper: ci_upper,
        predicted_up_rate: ratio(confusion.true_positive + confusion.false_positive, total),
        actual_up_rate: ratio(confusion.true_positive + confusion.false_negative, total),
        brier_score: brier_score(records),
        calibration: calibration(records),
        entity_accuracy: entity_accuracy(records),
        period_accuracy: period_accuracy(records),
    }
}

fn brier_score(records: &[PredictionRecord]) -> Option<f64> {
    let scored: Vec<f64> = records
        .iter()
        .filter_map(|r| r.probability.map(|p| (p - r.actual.as_f64()).powi(2)))
        .collect();
    if scored.is_empty() {
        None
    } else {
        Some(scored.iter().sum::<f64>() / scored.len() as f64)
    }
}

fn calibration(records: &[PredictionRecord]) -> Vec<CalibrationBucket> {
    // (count, sum of p, ups)
    let mut buckets = vec![(0usize, 0.0f64, 0usize); CALIBRATION_BUCKETS];
    for r in records {
        let Some(p) = r.probability else { continue };
        let idx = ((p * CALIBRATION_BUCKETS as f64) as usize).min(CALIBRATION_BUCKETS - 1);
        let bucket = &mut buckets[idx];
        bucket.0 += 1;
        bucket.1 += p;
        if r.actual.is_up() {
            bucket.2 += 1;
        }
    }

    let width = 1.0 / CALIBRATION_BUCKETS as f64;
    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, (count, _, _))| *count > 0)
        .map(|(idx, (count, sum_p, ups))| CalibrationBucket {
            lower: idx as f64 * width,
            upper: (idx + 1) as f64 * width,
            count,
            mean_probability: sum_p / count as f64,
            observed_up_rate: ratio(ups, count),
        })
        .collect()
}

fn entity_accuracy(records: &[PredictionRecord]) -> Vec<EntityAccuracy> {
    let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for r in records {
        let entry = counts.entry(r.entity_id.as_str()).or_default();
        entry.0 += 1;
        if r.is_correct() {
            entry.1 += 1;
        }
    }

    let mut ranked: Vec<EntityAccuracy> = counts
        .into_iter()
        .map(|(entity_id, (predictions, correct))| EntityAccuracy {
            entity_id: entity_id.to_string(),
            predictions,
            correct,
            accuracy: ratio(correct, predictions),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.accuracy
            .total_cmp(&a.accuracy)
            .then_with(|| b.predictions.cmp(&a.predictions))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    ranked
}

fn period_accuracy(records: &[PredictionRecord]) -> Vec<PeriodAccuracy> {
    let mut counts: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
    for r in records {
        let entry = counts.entry(r.period_start).or_default();
        entry.0 += 1;
        if r.is_correct() {
            entry.1 += 1;
        }
    }

    counts
        .into_iter()
        .map(|(period_start, (predictions, correct))| PeriodAccuracy {
            period_start,
            predictions,
            correct,
            accuracy: ratio(correct, predictions),
        })
        .collect()
}

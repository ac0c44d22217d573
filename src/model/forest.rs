//! Bagged Gini decision trees for the binary up/down label.
//!
//! Each tree is grown on a bootstrap sample with a random subset of features
//! considered at every split. P(Up) is the mean over trees of the Up
//! frequency in the leaf a row falls into.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{check_training_set, labels_from_probabilities, Classifier, FittedModel};
use crate::error::FitError;
use crate::models::Outcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    /// A node with fewer samples than this becomes a leaf
    pub min_samples_split: usize,
    /// Splits leaving fewer samples than this on either side are ignored
    pub min_samples_leaf: usize,
    /// Features tried per split; `None` = ceil(sqrt(n_features))
    pub max_features: Option<usize>,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 12,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            bootstrap: true,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        p_up: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn p_up(&self, row: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { p_up } => return *p_up,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    // NaN or <= threshold goes left
                    let v = row.get(*feature).copied().unwrap_or(f64::NAN);
                    node = if v.is_nan() || v <= *threshold { left } else { right };
                }
            }
        }
    }
}

fn gini(ups: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let p = ups as f64 / total as f64;
    2.0 * p * (1.0 - p)
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

struct TreeBuilder<'a> {
    config: &'a ForestConfig,
    features: &'a [&'a [f64]],
    ups: Vec<bool>,
    max_features: usize,
    rng: StdRng,
}

impl<'a> TreeBuilder<'a> {
    fn leaf(&self, indices: &[usize]) -> Node {
        let ups = indices.iter().filter(|&&i| self.ups[i]).count();
        Node::Leaf {
            p_up: ups as f64 / indices.len().max(1) as f64,
        }
    }

    fn build(&mut self, indices: &[usize], depth: usize) -> Node {
        let n = indices.len();
        let ups = indices.iter().filter(|&&i| self.ups[i]).count();

        if depth >= self.config.max_depth
            || n < self.config.min_samples_split.max(2)
            || ups == 0
            || ups == n
        {
            return self.leaf(indices);
        }

        let Some(split) = self.best_split(indices) else {
            return self.leaf(indices);
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .copied()
            .partition(|&i| self.features[i][split.feature] <= split.threshold);

        Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: Box::new(self.build(&left, depth + 1)),
            right: Box::new(self.build(&right, depth + 1)),
        }
    }

    fn best_split(&mut self, indices: &[usize]) -> Option<SplitCandidate> {
        let n_features = self.features[indices[0]].len();
        let mut candidates: Vec<usize> = (0..n_features).collect();
        candidates.shuffle(&mut self.rng);
        candidates.truncate(self.max_features);

        let n = indices.len();
        let total_ups = indices.iter().filter(|&&i| self.ups[i]).count();
        let min_leaf = self.config.min_samples_leaf.max(1);
        let mut best: Option<SplitCandidate> = None;

        for feature in candidates {
            let mut sorted: Vec<(f64, bool)> = indices
                .iter()
                .map(|&i| (self.features[i][feature], self.ups[i]))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_ups = 0usize;
            for split_at in 1..n {
                if sorted[split_at - 1].1 {
                    left_ups += 1;
                }
                let (lo, hi) = (sorted[split_at - 1].0, sorted[split_at].0);
                if lo == hi || split_at < min_leaf || n - split_at < min_leaf {
                    continue;
                }

                let left_n = split_at;
                let right_n = n - split_at;
                let impurity = (left_n as f64 * gini(left_ups, left_n)
                    + right_n as f64 * gini(total_ups - left_ups, right_n))
                    / n as f64;

                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (lo + hi) / 2.0,
                        impurity,
                    });
                }
            }
        }

        // only split if it actually separates the classes better
        best.filter(|b| b.impurity < gini(total_ups, n))
    }
}

/// Random forest classifier factory
#[derive(Debug, Clone)]
pub struct RandomForest {
    config: ForestConfig,
}

impl RandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self { config }
    }
}

impl Classifier for RandomForest {
    fn name(&self) -> &str {
        "random_forest"
    }

    fn train(&self, features: &[&[f64]], labels: &[Outcome]) -> Result<Box<dyn FittedModel>, FitError> {
        check_training_set(features, labels)?;

        let n = features.len();
        let n_features = features[0].len();
        let max_features = self
            .config
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt().ceil() as usize)
            .clamp(1, n_features.max(1));

        let mut trees = Vec::with_capacity(self.config.n_trees.max(1));
        for t in 0..self.config.n_trees.max(1) {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(t as u64));
            let sample: Vec<usize> = if self.config.bootstrap {
                (0..n).map(|_| rng.gen_range(0..n)).collect()
            } else {
                (0..n).collect()
            };

            let mut builder = TreeBuilder {
                config: &self.config,
                features,
                ups: labels.iter().map(Outcome::is_up).collect(),
                max_features,
                rng,
            };
            trees.push(builder.build(&sample, 0));
        }

        Ok(Box::new(FittedForest { trees }))
    }
}

struct FittedForest {
    trees: Vec<Node>,
}

impl FittedForest {
    fn probabilities(&self, features: &[&[f64]]) -> Vec<f64> {
        let n = self.trees.len() as f64;
        features
            .iter()
            .map(|row| self.trees.iter().map(|t| t.p_up(row)).sum::<f64>() / n)
            .collect()
    }
}

impl FittedModel for FittedForest {
    fn predict_proba(&self, features: &[&[f64]]) -> Option<Vec<f64>> {
        Some(self.probabilities(features))
    }

    fn predict(&self, features: &[&[f64]]) -> Vec<Outcome> {
        labels_from_probabilities(&self.probabilities(features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable() -> (Vec<Vec<f64>>, Vec<Outcome>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            let v = i as f64;
            x.push(vec![v, (i % 3) as f64]);
            y.push(if v >= 20.0 { Outcome::Up } else { Outcome::Down });
        }
        (x, y)
    }

    fn refs(x: &[Vec<f64>]) -> Vec<&[f64]> {
        x.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn test_learns_threshold_rule() {
        let (x, y) = separable();
        let forest = RandomForest::new(ForestConfig {
            n_trees: 15,
            ..ForestConfig::default()
        });
        let model = forest.train(&refs(&x), &y).unwrap();

        let queries = [vec![2.0, 1.0], vec![37.0, 1.0]];
        let probs = model.predict_proba(&refs(&queries)).unwrap();
        assert!(probs[0] < 0.3, "low value should be Down, got {}", probs[0]);
        assert!(probs[1] > 0.7, "high value should be Up, got {}", probs[1]);
        assert_eq!(model.predict(&refs(&queries)), vec![Outcome::Down, Outcome::Up]);
    }

    #[test]
    fn test_same_seed_same_probabilities() {
        let (x, y) = separable();
        let forest = RandomForest::new(ForestConfig {
            n_trees: 10,
            ..ForestConfig::default()
        });
        let queries = [vec![19.5, 0.0], vec![21.0, 2.0]];

        let a = forest.train(&refs(&x), &y).unwrap().predict_proba(&refs(&queries));
        let b = forest.train(&refs(&x), &y).unwrap().predict_proba(&refs(&queries));
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_class_is_refused() {
        let x = vec![vec![1.0], vec![2.0]];
        let forest = RandomForest::new(ForestConfig::default());
        let result = forest.train(&refs(&x), &[Outcome::Up, Outcome::Up]);
        assert!(matches!(result, Err(FitError::SingleClass)));
    }

    #[test]
    fn test_probabilities_are_bounded() {
        let (x, y) = separable();
        let model = RandomForest::new(ForestConfig {
            n_trees: 5,
            max_depth: 2,
            ..ForestConfig::default()
        })
        .train(&refs(&x), &y)
        .unwrap();

        for p in model.predict_proba(&refs(&x)).unwrap() {
            assert!((0.0..=1.0).contains(&p));
        }
    }
}

//! Gradient-boosted trees with a softmax objective.
//!
//! Each round grows one regression tree per class on the Newton statistics of the
//! multiclass log-loss, using a row subsample and a column subsample drawn from a single
//! seeded generator. Features are binned once per fit and shared by every tree. With a validation set, rounds past the best validation log-loss are
//! discarded once `early_stopping_rounds` pass without improvement.

use ndarray::{Array2, ArrayView2, Axis};
use rand::{rngs::SmallRng, seq::index, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    check_positive, check_unit_fraction,
    early_stopping::{EarlyStopping, IterationTrace, StoppingDecision},
    func::{log_loss, softmax_rows},
    tree::{grow, BinnedFeatures, GrowthLimits, Newton, Tree, MAX_BINS},
    Classifier, FittedModel, LabeledMatrix, Learner, ModelError,
};

/// Algorithm identifier.
pub const NAME: &str = "gradient_boosting";

const MIN_HESSIAN: f64 = 1e-6;

/// Boosting hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    /// Maximum boosting rounds.
    pub n_estimators: usize,
    /// Shrinkage applied to every tree.
    pub learning_rate: f32,
    /// Maximum tree depth.
    pub max_depth: usize,
    /// Minimum hessian mass per leaf.
    pub min_child_weight: f64,
    /// Fraction of rows drawn per round.
    pub subsample: f64,
    /// Fraction of columns drawn per round.
    pub colsample: f64,
    /// L2 penalty on leaf weights.
    pub lambda: f64,
    /// Rounds without validation improvement before stopping.
    pub early_stopping_rounds: Option<usize>,
    /// Histogram bins per feature when searching for splits.
    pub max_bins: usize,
    /// Seed of the sampling generator.
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 500,
            learning_rate: 0.1,
            max_depth: 6,
            min_child_weight: 1.0,
            subsample: 0.8,
            colsample: 0.8,
            lambda: 1.0,
            early_stopping_rounds: Some(15),
            max_bins: MAX_BINS,
            seed: 42,
        }
    }
}

impl BoostingParams {
    fn check(&self) -> Result<(), ModelError> {
        check_positive("n_estimators", self.n_estimators)?;
        check_unit_fraction("subsample", self.subsample)?;
        check_unit_fraction("colsample", self.colsample)?;
        if !(2..=usize::from(u16::MAX)).contains(&self.max_bins) {
            return Err(ModelError::InvalidParameter {
                name: "max_bins",
                reason: format!("{} is outside 2..=65535", self.max_bins),
            });
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ModelError::InvalidParameter {
                name: "learning_rate",
                reason: format!("{} is not positive", self.learning_rate),
            });
        }
        if self.lambda < 0.0 || self.min_child_weight < 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "lambda",
                reason: "lambda and min_child_weight must be non-negative".into(),
            });
        }
        Ok(())
    }
}

/// Fitted boosted ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    n_classes: usize,
    n_features: usize,
    learning_rate: f32,
    base_scores: Vec<f32>,
    rounds: Vec<Vec<Tree>>,
    trace: IterationTrace,
}

impl GradientBoostedTrees {
    /// Number of boosting rounds kept.
    #[must_use]
    pub fn n_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// How the fit ended.
    #[must_use]
    pub const fn trace(&self) -> IterationTrace {
        self.trace
    }

    fn initial_scores(&self, rows: usize) -> Array2<f32> {
        initial_scores(&self.base_scores, rows)
    }
}

fn initial_scores(base_scores: &[f32], rows: usize) -> Array2<f32> {
    let mut scores = Array2::zeros((rows, base_scores.len()));
    for mut row in scores.rows_mut() {
        for (cell, &base) in row.iter_mut().zip(base_scores) {
            *cell = base;
        }
    }
    scores
}

/// Log class priors, floored so that an absent class still gets a finite score.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn log_priors(targets: &[usize], n_classes: usize) -> Vec<f32> {
    let mut counts = vec![0_usize; n_classes];
    for &target in targets {
        counts[target] += 1;
    }
    let total = targets.len() as f64;
    counts
        .iter()
        .map(|&count| ((count as f64 / total).max(1e-6)).ln() as f32)
        .collect()
}

fn add_tree(scores: &mut Array2<f32>, x: ArrayView2<'_, f32>, tree: &Tree, class: usize, rate: f32) {
    for (row, mut score) in x.axis_iter(Axis(0)).zip(scores.axis_iter_mut(Axis(0))) {
        score[class] += rate * tree.value(row);
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn draw(rng: &mut SmallRng, total: usize, fraction: f64) -> Vec<usize> {
    let amount = ((total as f64) * fraction).ceil() as usize;
    if amount >= total {
        return (0..total).collect();
    }
    let mut picked = index::sample(rng, total, amount.max(1)).into_vec();
    picked.sort_unstable();
    picked
}

impl Learner for BoostingParams {
    fn fit(
        &self,
        train: &LabeledMatrix<'_>,
        validation: Option<&LabeledMatrix<'_>>,
    ) -> Result<FittedModel, ModelError> {
        self.check()?;
        train.validate()?;
        if let Some(validation) = validation {
            train.check_compatible(validation)?;
        }
        let (rows, n_classes) = (train.rows(), train.n_classes);
        let base_scores = log_priors(train.targets, n_classes);
        let mut scores = initial_scores(&base_scores, rows);
        let mut validation_scores =
            validation.map(|validation| initial_scores(&base_scores, validation.rows()));

        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut stopper = self
            .early_stopping_rounds
            .filter(|_| validation.is_some())
            .map(|patience| EarlyStopping::new(patience, 0.0));
        let mut rounds: Vec<Vec<Tree>> = Vec::new();
        let mut best_loss = None;
        let mut stopped_early = false;
        let mut gradients = vec![0.0_f64; rows];
        let mut hessians = vec![0.0_f64; rows];
        let limits = GrowthLimits {
            max_depth: self.max_depth,
            min_samples_split: 2,
        };
        let binned = BinnedFeatures::new(train.features, self.max_bins);

        for round in 0..self.n_estimators {
            let mut probabilities = scores.clone();
            softmax_rows(&mut probabilities);
            let samples = draw(&mut rng, rows, self.subsample);
            let features = draw(&mut rng, train.n_features(), self.colsample);

            let mut trees = Vec::with_capacity(n_classes);
            for class in 0..n_classes {
                for (idx, &target) in train.targets.iter().enumerate() {
                    let p = f64::from(probabilities[[idx, class]]);
                    let y = if target == class { 1.0 } else { 0.0 };
                    gradients[idx] = p - y;
                    hessians[idx] = (p * (1.0 - p)).max(MIN_HESSIAN);
                }
                let criterion = Newton {
                    gradients: &gradients,
                    hessians: &hessians,
                    lambda: self.lambda,
                    min_child_weight: self.min_child_weight,
                };
                let tree = grow(&binned, &criterion, samples.clone(), &features, limits);
                add_tree(&mut scores, train.features, &tree, class, self.learning_rate);
                if let (Some(validation), Some(validation_scores)) =
                    (validation, validation_scores.as_mut())
                {
                    add_tree(
                        validation_scores,
                        validation.features,
                        &tree,
                        class,
                        self.learning_rate,
                    );
                }
                trees.push(tree);
            }
            rounds.push(trees);

            if let (Some(validation), Some(validation_scores)) = (validation, &validation_scores) {
                let mut probabilities = validation_scores.clone();
                softmax_rows(&mut probabilities);
                let loss = log_loss(probabilities.view(), validation.targets);
                if let Some(stopper) = stopper.as_mut() {
                    match stopper.check(loss, round) {
                        StoppingDecision::NewBest => best_loss = Some(loss),
                        StoppingDecision::NoImprovement { .. } => {}
                        StoppingDecision::Stop => {
                            stopped_early = true;
                            break;
                        }
                    }
                } else {
                    best_loss = Some(loss);
                }
            }
        }

        let iterations_run = rounds.len();
        let best_iteration = stopper
            .as_ref()
            .map_or(iterations_run - 1, EarlyStopping::best_step);
        rounds.truncate(best_iteration + 1);

        Ok(FittedModel::GradientBoosting(GradientBoostedTrees {
            n_classes,
            n_features: train.n_features(),
            learning_rate: self.learning_rate,
            base_scores,
            rounds,
            trace: IterationTrace {
                iterations_run,
                best_iteration,
                best_validation_loss: best_loss,
                stopped_early,
            },
        }))
    }
}

impl Classifier for GradientBoostedTrees {
    fn name(&self) -> &str {
        NAME
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut scores = self.initial_scores(features.nrows());
        for trees in &self.rounds {
            for (class, tree) in trees.iter().enumerate() {
                add_tree(&mut scores, features, tree, class, self.learning_rate);
            }
        }
        softmax_rows(&mut scores);
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    fn encoded(dataset: &Dataset) -> (Array2<f32>, Vec<usize>) {
        let ids: Vec<usize> = (0..dataset.len()).collect();
        let targets = dataset
            .labels()
            .iter()
            .map(|label| usize::from(*label == "B"))
            .collect();
        (dataset.features(&ids), targets)
    }

    #[test]
    fn early_stopping_keeps_best_round() {
        let (x, y) = encoded(&Dataset::synthetic(&["A", "B"], 40, 4, 3));
        let (vx, vy) = encoded(&Dataset::synthetic(&["A", "B"], 10, 4, 4));
        let params = BoostingParams {
            n_estimators: 300,
            early_stopping_rounds: Some(3),
            ..BoostingParams::default()
        };
        let train = LabeledMatrix::new(x.view(), &y, 2);
        let validation = LabeledMatrix::new(vx.view(), &vy, 2);
        let FittedModel::GradientBoosting(model) = params.fit(&train, Some(&validation)).unwrap()
        else {
            panic!("wrong variant");
        };
        let trace = model.trace();
        assert_eq!(model.n_rounds(), trace.best_iteration + 1);
        assert!(trace.iterations_run >= model.n_rounds());
        assert!(trace.best_validation_loss.is_some());
        if trace.stopped_early {
            assert_eq!(trace.iterations_run, trace.best_iteration + 4);
        }
    }

    #[test]
    fn same_seed_same_model() {
        let (x, y) = encoded(&Dataset::synthetic(&["A", "B"], 20, 4, 9));
        let train = LabeledMatrix::new(x.view(), &y, 2);
        let params = BoostingParams {
            n_estimators: 10,
            ..BoostingParams::default()
        };
        assert_eq!(params.fit(&train, None).unwrap(), params.fit(&train, None).unwrap());
    }

    #[test]
    fn coarse_histograms_still_separate_classes() {
        let (x, y) = encoded(&Dataset::synthetic(&["A", "B"], 30, 4, 11));
        let train = LabeledMatrix::new(x.view(), &y, 2);
        let params = BoostingParams {
            n_estimators: 15,
            max_bins: 4,
            ..BoostingParams::default()
        };
        let model = params.fit(&train, None).unwrap();
        assert_eq!(model.predict(x.view()), y);

        let too_few = BoostingParams {
            max_bins: 1,
            ..BoostingParams::default()
        };
        assert!(matches!(
            too_few.fit(&train, None),
            Err(ModelError::InvalidParameter { name: "max_bins", .. })
        ));
    }

    #[test]
    fn rejects_zero_subsample() {
        let x = Array2::<f32>::zeros((2, 1));
        let train = LabeledMatrix::new(x.view(), &[0, 1], 2);
        let params = BoostingParams {
            subsample: 0.0,
            ..BoostingParams::default()
        };
        assert!(matches!(
            params.fit(&train, None),
            Err(ModelError::InvalidParameter { name: "subsample", .. })
        ));
    }
}

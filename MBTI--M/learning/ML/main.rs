//! Pluggable multiclass classifiers.
//!
//! Every algorithm is configured through [`AlgorithmConfig`], trained through the
//! [`Learner`] trait and produces a [`FittedModel`], which the rest of the workspace only
//! ever sees through the [`Classifier`] capability.

/// Gradient-boosted decision trees with a softmax objective.
pub mod boosting;
/// Linear discriminant analysis.
pub mod discriminant;
/// Patience-based early stopping.
pub mod early_stopping;
/// Bagged random forest over `linfa-trees`.
pub mod forest;
/// Numeric helpers shared by the learners.
pub mod func;
/// Multinomial logistic regression over `linfa-logistic`.
pub mod logistic;
/// Training report types.
pub mod reporter;
/// Histogram regression trees for boosting.
pub mod tree;

use std::fmt;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use boosting::{BoostingParams, GradientBoostedTrees};
pub use discriminant::{LdaParams, LinearDiscriminant};
pub use early_stopping::{EarlyStopping, IterationTrace, StoppingDecision};
pub use forest::{ForestParams, RandomForest};
pub use logistic::{LogisticParams, LogisticRegression};

/// Anything that maps feature rows to a probability distribution over classes.
pub trait Classifier: Send + Sync + fmt::Debug {
    /// Algorithm name.
    fn name(&self) -> &str;

    /// Width of the probability rows.
    fn n_classes(&self) -> usize;

    /// Expected number of feature columns.
    fn n_features(&self) -> usize;

    /// Class probabilities, one row per input row, each summing to one.
    ///
    /// Callers pass exactly [`Classifier::n_features`] columns.
    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Array2<f32>;

    /// Most probable class per row.
    fn predict(&self, features: ArrayView2<'_, f32>) -> Vec<usize> {
        func::argmax_rows(self.predict_proba(features).view())
    }
}

/// Trains a [`FittedModel`] from encoded data.
pub trait Learner {
    /// Fits on `train`; iterative learners may watch `validation` to stop early.
    fn fit(
        &self,
        train: &LabeledMatrix<'_>,
        validation: Option<&LabeledMatrix<'_>>,
    ) -> Result<FittedModel, ModelError>;
}

/// Feature matrix with integer class targets.
#[derive(Debug, Clone, Copy)]
pub struct LabeledMatrix<'a> {
    /// One row per sample.
    pub features: ArrayView2<'a, f32>,
    /// Class index per row.
    pub targets: &'a [usize],
    /// Number of classes the targets are drawn from.
    pub n_classes: usize,
}

impl<'a> LabeledMatrix<'a> {
    /// Bundles features and targets.
    #[must_use]
    pub const fn new(features: ArrayView2<'a, f32>, targets: &'a [usize], n_classes: usize) -> Self {
        Self {
            features,
            targets,
            n_classes,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.features.nrows()
    }

    /// Number of feature columns.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Checks shape, target range, and finiteness.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.n_classes < 2 {
            return Err(ModelError::TooFewClasses(self.n_classes));
        }
        if self.rows() == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if self.targets.len() != self.rows() {
            return Err(ModelError::ShapeMismatch {
                expected: self.rows(),
                found: self.targets.len(),
            });
        }
        if let Some(&target) = self.targets.iter().find(|&&t| t >= self.n_classes) {
            return Err(ModelError::TargetOutOfRange {
                target,
                n_classes: self.n_classes,
            });
        }
        if self.features.iter().any(|value| !value.is_finite()) {
            return Err(ModelError::NonFiniteFeature);
        }
        Ok(())
    }

    /// Checks that `other` can be scored by a model trained on `self`.
    pub fn check_compatible(&self, other: &LabeledMatrix<'_>) -> Result<(), ModelError> {
        if other.n_features() != self.n_features() {
            return Err(ModelError::ShapeMismatch {
                expected: self.n_features(),
                found: other.n_features(),
            });
        }
        if other.n_classes != self.n_classes {
            return Err(ModelError::ShapeMismatch {
                expected: self.n_classes,
                found: other.n_classes,
            });
        }
        other.validate()
    }
}

/// Failures while fitting a learner.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    /// No rows to fit.
    #[error("training set is empty")]
    EmptyTrainingSet,
    /// Fewer than two classes.
    #[error("need at least two classes, found {0}")]
    TooFewClasses(usize),
    /// Row, column, or class counts disagree.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Expected size.
        expected: usize,
        /// Actual size.
        found: usize,
    },
    /// A target outside `0..n_classes`.
    #[error("target {target} outside 0..{n_classes}")]
    TargetOutOfRange {
        /// Offending target.
        target: usize,
        /// Number of classes.
        n_classes: usize,
    },
    /// NaN or infinite feature value.
    #[error("features contain NaN or infinite values")]
    NonFiniteFeature,
    /// A class has no training rows.
    #[error("class {0} has no training rows")]
    EmptyClass(usize),
    /// Covariance matrix is not positive definite.
    #[error("pooled covariance is singular; increase shrinkage")]
    SingularCovariance,
    /// The underlying solver or tree builder failed.
    #[error("learner backend failed: {0}")]
    Backend(String),
    /// Hyperparameter out of range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Algorithm choice plus hyperparameters, as written in pipeline configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Gradient-boosted trees.
    GradientBoosting(BoostingParams),
    /// Random forest.
    RandomForest(ForestParams),
    /// Linear discriminant analysis.
    LinearDiscriminant(LdaParams),
    /// Multinomial logistic regression.
    LogisticRegression(LogisticParams),
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self::GradientBoosting(BoostingParams::default())
    }
}

impl AlgorithmConfig {
    /// Every identifier [`AlgorithmConfig::from_name`] accepts.
    pub const NAMES: [&'static str; 4] = [
        boosting::NAME,
        forest::NAME,
        discriminant::NAME,
        logistic::NAME,
    ];

    /// Stable algorithm identifier.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GradientBoosting(_) => boosting::NAME,
            Self::RandomForest(_) => forest::NAME,
            Self::LinearDiscriminant(_) => discriminant::NAME,
            Self::LogisticRegression(_) => logistic::NAME,
        }
    }

    /// Default configuration for an identifier accepted by [`AlgorithmConfig::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            boosting::NAME => Some(Self::GradientBoosting(BoostingParams::default())),
            forest::NAME => Some(Self::RandomForest(ForestParams::default())),
            discriminant::NAME => Some(Self::LinearDiscriminant(LdaParams::default())),
            logistic::NAME => Some(Self::LogisticRegression(LogisticParams::default())),
            _ => None,
        }
    }

    /// Hyperparameters as JSON, for logs and reports.
    #[must_use]
    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Learner for AlgorithmConfig {
    fn fit(
        &self,
        train: &LabeledMatrix<'_>,
        validation: Option<&LabeledMatrix<'_>>,
    ) -> Result<FittedModel, ModelError> {
        match self {
            Self::GradientBoosting(params) => params.fit(train, validation),
            Self::RandomForest(params) => params.fit(train, validation),
            Self::LinearDiscriminant(params) => params.fit(train, validation),
            Self::LogisticRegression(params) => params.fit(train, validation),
        }
    }
}

/// A trained model of any supported algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum FittedModel {
    /// Gradient-boosted trees.
    GradientBoosting(GradientBoostedTrees),
    /// Random forest.
    RandomForest(RandomForest),
    /// Linear discriminant analysis.
    LinearDiscriminant(LinearDiscriminant),
    /// Multinomial logistic regression.
    LogisticRegression(LogisticRegression),
}

impl FittedModel {
    fn inner(&self) -> &dyn Classifier {
        match self {
            Self::GradientBoosting(model) => model,
            Self::RandomForest(model) => model,
            Self::LinearDiscriminant(model) => model,
            Self::LogisticRegression(model) => model,
        }
    }

    /// How the iterative fit ended, for learners that iterate.
    #[must_use]
    pub const fn trace(&self) -> Option<IterationTrace> {
        match self {
            Self::GradientBoosting(model) => Some(model.trace()),
            Self::LogisticRegression(model) => model.trace(),
            Self::RandomForest(_) | Self::LinearDiscriminant(_) => None,
        }
    }
}

impl Classifier for FittedModel {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn n_classes(&self) -> usize {
        self.inner().n_classes()
    }

    fn n_features(&self) -> usize {
        self.inner().n_features()
    }

    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Array2<f32> {
        self.inner().predict_proba(features)
    }
}

/// Rejects a fraction outside `(0, 1]`.
fn check_unit_fraction(name: &'static str, value: f64) -> Result<(), ModelError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ModelError::InvalidParameter {
            name,
            reason: format!("{value} is outside (0, 1]"),
        })
    }
}

/// Rejects a zero count.
fn check_positive(name: &'static str, value: usize) -> Result<(), ModelError> {
    if value == 0 {
        Err(ModelError::InvalidParameter {
            name,
            reason: "must be at least 1".into(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    fn blobs() -> (Array2<f32>, Vec<usize>) {
        let dataset = Dataset::synthetic(&["A", "B", "C"], 30, 6, 7);
        let ids: Vec<usize> = (0..dataset.len()).collect();
        let targets = dataset
            .labels()
            .iter()
            .map(|label| match *label {
                "A" => 0,
                "B" => 1,
                _ => 2,
            })
            .collect();
        (dataset.features(&ids), targets)
    }

    fn quick_configs() -> Vec<AlgorithmConfig> {
        vec![
            AlgorithmConfig::GradientBoosting(BoostingParams {
                n_estimators: 20,
                ..BoostingParams::default()
            }),
            AlgorithmConfig::RandomForest(ForestParams {
                n_trees: 10,
                ..ForestParams::default()
            }),
            AlgorithmConfig::LinearDiscriminant(LdaParams::default()),
            AlgorithmConfig::LogisticRegression(LogisticParams {
                max_iter: 200,
                ..LogisticParams::default()
            }),
        ]
    }

    #[test]
    fn every_algorithm_fits_separable_blobs() {
        let (x, y) = blobs();
        let train = LabeledMatrix::new(x.view(), &y, 3);
        for config in quick_configs() {
            let model = config.fit(&train, None).unwrap();
            assert_eq!(model.name(), config.name());
            assert_eq!(model.n_classes(), 3);
            assert_eq!(model.n_features(), 6);
            let proba = model.predict_proba(x.view());
            for row in proba.rows() {
                assert!((row.sum() - 1.0).abs() < 1e-5, "{}", config.name());
                assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
            }
            let hits = model
                .predict(x.view())
                .iter()
                .zip(&y)
                .filter(|(p, t)| p == t)
                .count();
            assert!(hits >= 85, "{} only got {hits}/90", config.name());
        }
    }

    #[test]
    fn fitted_models_survive_json() {
        let (x, y) = blobs();
        let train = LabeledMatrix::new(x.view(), &y, 3);
        for config in quick_configs() {
            let model = config.fit(&train, None).unwrap();
            let json = serde_json::to_string(&model).unwrap();
            let restored: FittedModel = serde_json::from_str(&json).unwrap();
            assert_eq!(restored.predict(x.view()), model.predict(x.view()));
        }
    }

    #[test]
    fn config_parses_with_partial_params() {
        let config: AlgorithmConfig =
            serde_json::from_str(r#"{"algorithm":"random_forest","n_trees":7}"#).unwrap();
        match config {
            AlgorithmConfig::RandomForest(params) => {
                assert_eq!(params.n_trees, 7);
                assert_eq!(params.min_samples_split, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            AlgorithmConfig::from_name("logistic_regression").map(|c| c.name()),
            Some("logistic_regression")
        );
        assert!(AlgorithmConfig::from_name("svm").is_none());
    }

    #[test]
    fn validate_rejects_bad_inputs() {
        let x = Array2::<f32>::zeros((2, 3));
        assert_eq!(
            LabeledMatrix::new(x.view(), &[0, 5], 3).validate(),
            Err(ModelError::TargetOutOfRange {
                target: 5,
                n_classes: 3
            })
        );
        assert_eq!(
            LabeledMatrix::new(x.view(), &[0], 3).validate(),
            Err(ModelError::ShapeMismatch {
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            LabeledMatrix::new(x.view(), &[0, 0], 1).validate(),
            Err(ModelError::TooFewClasses(1))
        );
        let mut bad = x.clone();
        bad[[1, 1]] = f32::NAN;
        assert_eq!(
            LabeledMatrix::new(bad.view(), &[0, 1], 3).validate(),
            Err(ModelError::NonFiniteFeature)
        );
    }
}

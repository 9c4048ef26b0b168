//! Random forest of Gini decision trees.
//!
//! Each member is a `linfa-trees` decision tree fitted on a bootstrap of the rows and a
//! random subspace of the columns. Tree `t` draws both from a generator seeded with
//! `seed + t`, so the forest is reproducible and independent of tree order. Class
//! probabilities are the fraction of member votes.

use linfa::DatasetBase;
use linfa_trees::{DecisionTree, SplitQuality};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{rngs::SmallRng, seq::index, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{check_positive, Classifier, FittedModel, LabeledMatrix, Learner, ModelError};

/// Algorithm identifier.
pub const NAME: &str = "random_forest";

/// Forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    /// Number of trees.
    pub n_trees: usize,
    /// Maximum tree depth.
    pub max_depth: usize,
    /// Nodes with fewer rows are not split.
    pub min_samples_split: usize,
    /// Columns drawn for each tree; `None` means the square root of the feature count.
    pub max_features: Option<usize>,
    /// Train each tree on a bootstrap sample.
    pub bootstrap: bool,
    /// Base seed.
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 20,
            min_samples_split: 5,
            max_features: None,
            bootstrap: true,
            seed: 42,
        }
    }
}

/// One tree and the columns it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Member {
    columns: Vec<usize>,
    tree: DecisionTree<f32, usize>,
}

/// Fitted forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    n_classes: usize,
    n_features: usize,
    members: Vec<Member>,
}

impl RandomForest {
    /// Number of trees.
    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.members.len()
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sqrt_features(n_features: usize) -> usize {
    ((n_features as f64).sqrt().floor() as usize).max(1)
}

impl Learner for ForestParams {
    #[allow(clippy::cast_precision_loss)]
    fn fit(
        &self,
        train: &LabeledMatrix<'_>,
        _validation: Option<&LabeledMatrix<'_>>,
    ) -> Result<FittedModel, ModelError> {
        check_positive("n_trees", self.n_trees)?;
        check_positive("min_samples_split", self.min_samples_split)?;
        if let Some(max_features) = self.max_features {
            check_positive("max_features", max_features)?;
        }
        train.validate()?;
        let (rows, n_features) = (train.rows(), train.n_features());
        let subspace = self
            .max_features
            .unwrap_or_else(|| sqrt_features(n_features))
            .min(n_features);
        let params = DecisionTree::<f32, usize>::params()
            .split_quality(SplitQuality::Gini)
            .max_depth(Some(self.max_depth))
            .min_weight_split(self.min_samples_split as f32);

        let members = (0..self.n_trees)
            .map(|t| {
                let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(t as u64));
                let sample: Vec<usize> = if self.bootstrap {
                    (0..rows).map(|_| rng.gen_range(0..rows)).collect()
                } else {
                    (0..rows).collect()
                };
                let mut columns = index::sample(&mut rng, n_features, subspace).into_vec();
                columns.sort_unstable();
                let records = train
                    .features
                    .select(Axis(0), &sample)
                    .select(Axis(1), &columns);
                let targets: Array1<usize> = sample.iter().map(|&row| train.targets[row]).collect();
                let tree = linfa::traits::Fit::fit(&params, &DatasetBase::new(records, targets))
                    .map_err(|err: linfa::Error| ModelError::Backend(err.to_string()))?;
                Ok(Member { columns, tree })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        Ok(FittedModel::RandomForest(RandomForest {
            n_classes: train.n_classes,
            n_features,
            members,
        }))
    }
}

impl Classifier for RandomForest {
    fn name(&self) -> &str {
        NAME
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    #[allow(clippy::cast_precision_loss)]
    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut proba = Array2::zeros((features.nrows(), self.n_classes));
        for member in &self.members {
            let records = features.select(Axis(1), &member.columns);
            let votes: Array1<usize> = linfa::traits::Predict::predict(&member.tree, &records);
            for (mut row, &class) in proba.axis_iter_mut(Axis(0)).zip(votes.iter()) {
                row[class] += 1.0;
            }
        }
        proba /= self.members.len() as f32;
        proba
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sqrt_rule_never_hits_zero() {
        assert_eq!(sqrt_features(60), 7);
        assert_eq!(sqrt_features(1), 1);
    }

    #[test]
    fn trees_differ_but_forest_is_reproducible() {
        let x = array![[0.0_f32, 1.0], [0.2, 0.9], [0.1, 1.1], [1.0, 0.0], [0.9, 0.1], [1.1, 0.2]];
        let y = [0, 0, 0, 1, 1, 1];
        let train = LabeledMatrix::new(x.view(), &y, 2);
        let params = ForestParams {
            n_trees: 8,
            min_samples_split: 2,
            ..ForestParams::default()
        };
        let first = params.fit(&train, None).unwrap();
        let second = params.fit(&train, None).unwrap();
        let queries = array![[0.05_f32, 1.0], [1.0, 0.05], [0.5, 0.5]];
        assert_eq!(first.predict_proba(queries.view()), second.predict_proba(queries.view()));
        let FittedModel::RandomForest(forest) = first else {
            panic!("wrong variant");
        };
        assert_eq!(forest.n_trees(), 8);
        assert!(forest.members.iter().all(|member| member.columns.len() == 1));
        assert_eq!(forest.predict(array![[0.05_f32, 1.0], [1.0, 0.05]].view()), vec![0, 1]);
    }

    #[test]
    fn vote_fractions_form_a_distribution() {
        let x = array![[0.0_f32, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [0.5, 0.5], [0.2, 0.8]];
        let y = [0, 1, 2, 0, 1, 2];
        let train = LabeledMatrix::new(x.view(), &y, 3);
        let params = ForestParams {
            n_trees: 5,
            max_features: Some(2),
            min_samples_split: 2,
            ..ForestParams::default()
        };
        let model = params.fit(&train, None).unwrap();
        for row in model.predict_proba(x.view()).rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn oversized_subspace_is_clamped() {
        let x = array![[0.0_f32], [1.0], [0.1], [0.9]];
        let train = LabeledMatrix::new(x.view(), &[0, 1, 0, 1], 2);
        let params = ForestParams {
            n_trees: 3,
            max_features: Some(10),
            min_samples_split: 2,
            ..ForestParams::default()
        };
        let FittedModel::RandomForest(forest) = params.fit(&train, None).unwrap() else {
            panic!("wrong variant");
        };
        assert!(forest.members.iter().all(|member| member.columns == [0]));
    }
}

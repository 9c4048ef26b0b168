//! Linear discriminant analysis with a shrunk pooled covariance.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{func::softmax_rows, Classifier, FittedModel, LabeledMatrix, Learner, ModelError};

/// Algorithm identifier.
pub const NAME: &str = "linear_discriminant";

/// LDA hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdaParams {
    /// Blend between the pooled covariance (0) and a scaled identity (1).
    pub shrinkage: f64,
}

impl Default for LdaParams {
    fn default() -> Self {
        Self { shrinkage: 1e-3 }
    }
}

/// Fitted discriminant: `score_c(x) = coef_c · x + intercept_c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDiscriminant {
    coef: Array2<f64>,
    intercept: Array1<f64>,
}

/// Lower-triangular `L` with `L Lᵀ = a`, or `None` when `a` is not positive definite.
fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let dot: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let pivot = a[[i, i]] - dot;
                if pivot <= f64::EPSILON * a[[i, i]].abs().max(1.0) {
                    return None;
                }
                l[[i, i]] = pivot.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - dot) / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solves `L Lᵀ x = b`.
fn cholesky_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let dot: f64 = (0..i).map(|k| l[[i, k]] * y[k]).sum();
        y[i] = (b[i] - dot) / l[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let dot: f64 = (i + 1..n).map(|k| l[[k, i]] * x[k]).sum();
        x[i] = (y[i] - dot) / l[[i, i]];
    }
    x
}

impl Learner for LdaParams {
    #[allow(clippy::cast_precision_loss)]
    fn fit(
        &self,
        train: &LabeledMatrix<'_>,
        _validation: Option<&LabeledMatrix<'_>>,
    ) -> Result<FittedModel, ModelError> {
        if !(0.0..=1.0).contains(&self.shrinkage) {
            return Err(ModelError::InvalidParameter {
                name: "shrinkage",
                reason: format!("{} is outside [0, 1]", self.shrinkage),
            });
        }
        train.validate()?;
        let (rows, d, k) = (train.rows(), train.n_features(), train.n_classes);
        let x = train.features.mapv(f64::from);

        let mut counts = vec![0_usize; k];
        let mut means = Array2::<f64>::zeros((k, d));
        for (row, &target) in x.axis_iter(Axis(0)).zip(train.targets) {
            counts[target] += 1;
            let mut mean = means.row_mut(target);
            mean += &row;
        }
        for (class, mut mean) in means.axis_iter_mut(Axis(0)).enumerate() {
            if counts[class] == 0 {
                return Err(ModelError::EmptyClass(class));
            }
            mean /= counts[class] as f64;
        }

        let mut centered = x;
        for (mut row, &target) in centered.axis_iter_mut(Axis(0)).zip(train.targets) {
            row -= &means.row(target);
        }
        let dof = if rows > k { rows - k } else { rows };
        let mut covariance = centered.t().dot(&centered) / dof as f64;
        let trace_mean = covariance.diag().sum() / d as f64;
        covariance *= 1.0 - self.shrinkage;
        for i in 0..d {
            covariance[[i, i]] += self.shrinkage * trace_mean;
        }
        let l = cholesky(&covariance).ok_or(ModelError::SingularCovariance)?;

        let mut coef = Array2::<f64>::zeros((k, d));
        let mut intercept = Array1::<f64>::zeros(k);
        for class in 0..k {
            let mean = means.row(class).to_owned();
            let weights = cholesky_solve(&l, &mean);
            let prior = counts[class] as f64 / rows as f64;
            intercept[class] = -0.5 * mean.dot(&weights) + prior.ln();
            coef.row_mut(class).assign(&weights);
        }
        Ok(FittedModel::LinearDiscriminant(LinearDiscriminant {
            coef,
            intercept,
        }))
    }
}

impl Classifier for LinearDiscriminant {
    fn name(&self) -> &str {
        NAME
    }

    fn n_classes(&self) -> usize {
        self.coef.nrows()
    }

    fn n_features(&self) -> usize {
        self.coef.ncols()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Array2<f32> {
        let scores = features.mapv(f64::from).dot(&self.coef.t()) + &self.intercept;
        let mut proba = scores.mapv(|score| score as f32);
        softmax_rows(&mut proba);
        proba
    }
}

//! Multinomial logistic regression on standardized features.
//!
//! Fitting is delegated to `linfa-logistic`, which minimises the summed log-loss plus
//! `alpha / 2 · ‖W‖²` with L-BFGS; `alpha = 1 / C`. With a validation set and
//! `early_stopping_rounds`, the solver runs in warm-started stages of
//! [`STAGE_ITERATIONS`] iterations and the coefficients of the best validation stage are
//! kept.

use linfa::DatasetBase;
use linfa_logistic::{error::Error as SolverError, MultiFittedLogisticRegression, MultiLogisticRegression};
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{
    check_positive,
    early_stopping::{EarlyStopping, IterationTrace, StoppingDecision},
    func::log_loss,
    Classifier, FittedModel, LabeledMatrix, Learner, ModelError,
};

/// Algorithm identifier.
pub const NAME: &str = "logistic_regression";

/// Solver iterations per early-stopping check.
pub const STAGE_ITERATIONS: usize = 10;

type Solved = MultiFittedLogisticRegression<f64, usize>;

/// Logistic regression hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticParams {
    /// Inverse regularization strength.
    pub c: f64,
    /// Maximum L-BFGS iterations.
    pub max_iter: usize,
    /// Gradient norm below which the solver stops.
    pub tol: f64,
    /// Stages without validation improvement before stopping.
    pub early_stopping_rounds: Option<usize>,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 1000,
            tol: 1e-4,
            early_stopping_rounds: None,
        }
    }
}

impl LogisticParams {
    fn solver(&self, iterations: usize) -> MultiLogisticRegression<f64> {
        MultiLogisticRegression::default()
            .alpha(1.0 / self.c)
            .max_iterations(iterations as u64)
            .gradient_tolerance(self.tol)
    }

    fn check(&self) -> Result<(), ModelError> {
        check_positive("max_iter", self.max_iter)?;
        if !(self.c > 0.0 && self.c.is_finite()) {
            return Err(ModelError::InvalidParameter {
                name: "c",
                reason: format!("{} is not positive", self.c),
            });
        }
        if !(self.tol > 0.0 && self.tol.is_finite()) {
            return Err(ModelError::InvalidParameter {
                name: "tol",
                reason: format!("{} is not positive", self.tol),
            });
        }
        Ok(())
    }

    /// Solver stages with a validation check after each one.
    fn fit_staged(
        &self,
        dataset: &DatasetBase<Array2<f64>, Array1<usize>>,
        patience: usize,
        validation: &LabeledMatrix<'_>,
        validation_z: &Array2<f64>,
    ) -> Result<(Solved, IterationTrace), ModelError> {
        let stages = self.max_iter.div_ceil(STAGE_ITERATIONS);
        let mut stopper = EarlyStopping::new(patience, 0.0);
        let mut current: Option<Solved> = None;
        let mut best: Option<(Solved, f64)> = None;
        let mut stopped_early = false;
        let mut iterations_run = 0;

        for stage in 0..stages {
            iterations_run = stage + 1;
            let mut solver = self.solver(STAGE_ITERATIONS);
            if let Some(previous) = &current {
                solver = solver.initial_params(warm_start(previous)?);
            }
            let fitted = solve(&solver, dataset)?;
            let settled = current
                .as_ref()
                .is_some_and(|previous| largest_change(previous, &fitted) < self.tol);
            let loss = log_loss(
                class_probabilities(&fitted, validation_z, validation.n_classes).view(),
                validation.targets,
            );
            match stopper.check(loss, stage) {
                StoppingDecision::NewBest => best = Some((fitted.clone(), loss)),
                StoppingDecision::NoImprovement { .. } => {}
                StoppingDecision::Stop => {
                    stopped_early = true;
                    break;
                }
            }
            if settled {
                break;
            }
            current = Some(fitted);
        }

        let (model, best_loss) = best.ok_or_else(|| {
            ModelError::Backend("validation loss never produced a best stage".into())
        })?;
        Ok((
            model,
            IterationTrace {
                iterations_run,
                best_iteration: stopper.best_step(),
                best_validation_loss: Some(best_loss),
                stopped_early,
            },
        ))
    }
}

/// Fitted logistic regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    n_classes: usize,
    mean: Array1<f64>,
    scale: Array1<f64>,
    model: Solved,
    trace: Option<IterationTrace>,
}

impl LogisticRegression {
    /// How the staged fit ended, counted in solver stages; `None` for a single solve.
    #[must_use]
    pub const fn trace(&self) -> Option<IterationTrace> {
        self.trace
    }
}

fn standardize(x: ArrayView2<'_, f32>, mean: &Array1<f64>, scale: &Array1<f64>) -> Array2<f64> {
    (x.mapv(f64::from) - mean) / scale
}

fn solve(
    solver: &MultiLogisticRegression<f64>,
    dataset: &DatasetBase<Array2<f64>, Array1<usize>>,
) -> Result<Solved, ModelError> {
    linfa::traits::Fit::fit(solver, dataset)
        .map_err(|err: SolverError| ModelError::Backend(err.to_string()))
}

/// Coefficients with the intercept appended as the last row, the layout the solver
/// accepts as a starting point.
fn warm_start(model: &Solved) -> Result<Array2<f64>, ModelError> {
    concatenate(
        Axis(0),
        &[model.params().view(), model.intercept().view().insert_axis(Axis(0))],
    )
    .map_err(|err| ModelError::Backend(err.to_string()))
}

fn largest_change(before: &Solved, after: &Solved) -> f64 {
    let coef = before.params().iter().zip(after.params().iter());
    let intercept = before.intercept().iter().zip(after.intercept().iter());
    coef.chain(intercept)
        .fold(0.0_f64, |acc, (a, b)| acc.max((a - b).abs()))
}

/// Solver probabilities spread over every class index; classes absent from training get 0.
#[allow(clippy::cast_possible_truncation)]
fn class_probabilities(model: &Solved, z: &Array2<f64>, n_classes: usize) -> Array2<f32> {
    let dense = model.predict_probabilities(z);
    let mut proba = Array2::zeros((z.nrows(), n_classes));
    for (column, &class) in model.classes().iter().enumerate() {
        proba
            .column_mut(class)
            .assign(&dense.column(column).mapv(|p| p as f32));
    }
    proba
}

impl Learner for LogisticParams {
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
        let d = train.n_features();
        let x = train.features.mapv(f64::from);
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
        let scale = x
            .var_axis(Axis(0), 0.0)
            .mapv(|var| if var > 1e-12 { var.sqrt() } else { 1.0 });
        let z = standardize(train.features, &mean, &scale);
        let dataset = DatasetBase::new(z, Array1::from(train.targets.to_vec()));

        let (model, trace) = match (self.early_stopping_rounds, validation) {
            (Some(patience), Some(validation)) => {
                let validation_z = standardize(validation.features, &mean, &scale);
                let (model, trace) = self.fit_staged(&dataset, patience, validation, &validation_z)?;
                (model, Some(trace))
            }
            _ => (solve(&self.solver(self.max_iter), &dataset)?, None),
        };
        Ok(FittedModel::LogisticRegression(LogisticRegression {
            n_classes: train.n_classes,
            mean,
            scale,
            model,
            trace,
        }))
    }
}

impl Classifier for LogisticRegression {
    fn name(&self) -> &str {
        NAME
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn n_features(&self) -> usize {
        self.mean.len()
    }

    fn predict_proba(&self, features: ArrayView2<'_, f32>) -> Array2<f32> {
        let z = standardize(features, &self.mean, &self.scale);
        class_probabilities(&self.model, &z, self.n_classes)
    }
}

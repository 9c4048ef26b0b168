//! Patience-based early stopping on a validation loss.

use serde::{Deserialize, Serialize};

/// Result of checking a new loss value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingDecision {
    /// New best value.
    NewBest,
    /// No improvement, but patience not exhausted.
    NoImprovement {
        /// Consecutive checks without improvement.
        count: usize,
        /// Checks remaining before stopping.
        remaining: usize,
    },
    /// Patience exhausted.
    Stop,
}

/// Tracks the best validation loss and how long it has gone unimproved.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_value: f64,
    best_step: usize,
    counter: usize,
}

impl EarlyStopping {
    /// Stops after `patience` consecutive checks that fail to beat the best by `min_delta`.
    #[must_use]
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience: patience.max(1),
            min_delta,
            best_value: f64::INFINITY,
            best_step: 0,
            counter: 0,
        }
    }

    /// Records the loss observed at `step`.
    pub fn check(&mut self, value: f64, step: usize) -> StoppingDecision {
        if value < self.best_value - self.min_delta {
            self.best_value = value;
            self.best_step = step;
            self.counter = 0;
            return StoppingDecision::NewBest;
        }
        self.counter += 1;
        if self.counter >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::NoImprovement {
                count: self.counter,
                remaining: self.patience - self.counter,
            }
        }
    }

    /// Step with the lowest loss so far.
    #[must_use]
    pub const fn best_step(&self) -> usize {
        self.best_step
    }

    /// Lowest loss so far.
    #[must_use]
    pub const fn best_value(&self) -> f64 {
        self.best_value
    }
}

/// How an iterative learner's run ended, kept with the model for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationTrace {
    /// Iterations (boosting rounds or optimizer steps) executed.
    pub iterations_run: usize,
    /// Iteration whose state the model keeps.
    pub best_iteration: usize,
    /// Validation loss at `best_iteration`, when a validation set was supplied.
    pub best_validation_loss: Option<f64>,
    /// True when patience ran out before the iteration budget.
    pub stopped_early: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_without_improvement() {
        let mut stopper = EarlyStopping::new(2, 0.0);
        assert_eq!(stopper.check(1.0, 0), StoppingDecision::NewBest);
        assert_eq!(stopper.check(0.5, 1), StoppingDecision::NewBest);
        assert_eq!(
            stopper.check(0.6, 2),
            StoppingDecision::NoImprovement {
                count: 1,
                remaining: 1
            }
        );
        assert_eq!(stopper.check(0.7, 3), StoppingDecision::Stop);
        assert_eq!(stopper.best_step(), 1);
        assert!((stopper.best_value() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn min_delta_ignores_tiny_gains() {
        let mut stopper = EarlyStopping::new(3, 0.1);
        stopper.check(1.0, 0);
        assert!(matches!(
            stopper.check(0.95, 1),
            StoppingDecision::NoImprovement { .. }
        ));
        assert_eq!(stopper.check(0.8, 2), StoppingDecision::NewBest);
    }
}

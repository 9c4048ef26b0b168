use serde::{Deserialize, Serialize};

use super::early_stopping::IterationTrace;
use crate::metrics::ClassificationReport;

/// Rows per partition used for a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSizes {
    /// Training rows.
    pub train: usize,
    /// Validation rows.
    pub validation: usize,
    /// Test rows.
    pub test: usize,
}

/// Report describing a training run and its held-out quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Algorithm identifier.
    pub algorithm: String,
    /// Hyperparameters used.
    pub params: serde_json::Value,
    /// Rows per partition.
    pub partitions: PartitionSizes,
    /// Accuracy on the training partition.
    pub train_accuracy: f64,
    /// Accuracy on the validation partition.
    pub validation_accuracy: f64,
    /// Accuracy on the test partition.
    pub test_accuracy: f64,
    /// `train_accuracy - test_accuracy`; large values indicate overfitting.
    pub train_test_gap: f64,
    /// Multiclass log-loss on the test partition.
    pub test_log_loss: f64,
    /// Per-class precision/recall/F1 on the test partition.
    pub test_report: ClassificationReport,
    /// Iteration bookkeeping for iterative learners.
    pub trace: Option<IterationTrace>,
    /// Wall-clock fit time in milliseconds.
    pub fit_millis: u64,
}

impl TrainingReport {
    /// Renders a concise summary string.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = format!(
            "[ML] algorithm={} train_acc={:.4} val_acc={:.4} test_acc={:.4} gap={:.4} macro_f1={:.4} fit_ms={}",
            self.algorithm,
            self.train_accuracy,
            self.validation_accuracy,
            self.test_accuracy,
            self.train_test_gap,
            self.test_report.macro_f1,
            self.fit_millis
        );
        if let Some(trace) = self.trace {
            line.push_str(&format!(
                " iterations={} best={}",
                trace.iterations_run,
                trace.best_iteration + 1
            ));
        }
        line
    }
}

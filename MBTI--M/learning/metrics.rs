//! Classification quality metrics over encoded predictions.

use serde::{Deserialize, Serialize};

pub use crate::classifiers::func::log_loss;

/// Fraction of positions where `predicted` equals `truth`; zero for empty input.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
    hits as f64 / truth.len() as f64
}

/// Counts indexed `[true class][predicted class]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Tallies paired truth/prediction indices.
    #[must_use]
    pub fn new(truth: &[usize], predicted: &[usize], n_classes: usize) -> Self {
        let mut counts = vec![vec![0; n_classes]; n_classes];
        for (&t, &p) in truth.iter().zip(predicted) {
            counts[t][p] += 1;
        }
        Self { counts }
    }

    /// Rows with true class `truth` predicted as `predicted`.
    #[must_use]
    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts[truth][predicted]
    }

    /// Number of classes.
    #[must_use]
    pub fn n_classes(&self) -> usize {
        self.counts.len()
    }

    /// Raw counts.
    #[must_use]
    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }
}

/// Precision, recall, and F1 for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Class name.
    pub label: String,
    /// Correct among rows predicted as this class.
    pub precision: f64,
    /// Correct among rows of this class.
    pub recall: f64,
    /// Harmonic mean of precision and recall.
    pub f1: f64,
    /// Rows of this class.
    pub support: usize,
}

/// Per-class and averaged metrics for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    /// One entry per class, in codec order.
    pub classes: Vec<ClassMetrics>,
    /// Overall accuracy.
    pub accuracy: f64,
    /// Unweighted mean F1.
    pub macro_f1: f64,
    /// Support-weighted mean F1.
    pub weighted_f1: f64,
    /// Underlying confusion matrix.
    pub confusion: ConfusionMatrix,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassificationReport {
    /// Builds the report; `labels[i]` names class `i`. Undefined ratios count as zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(truth: &[usize], predicted: &[usize], labels: &[String]) -> Self {
        let confusion = ConfusionMatrix::new(truth, predicted, labels.len());
        let classes: Vec<ClassMetrics> = labels
            .iter()
            .enumerate()
            .map(|(class, label)| {
                let hits = confusion.get(class, class);
                let support = confusion.support(class);
                let precision = ratio(hits, confusion.predicted(class));
                let recall = ratio(hits, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: label.clone(),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();
        let macro_f1 = if classes.is_empty() {
            0.0
        } else {
            classes.iter().map(|c| c.f1).sum::<f64>() / classes.len() as f64
        };
        let total: usize = classes.iter().map(|c| c.support).sum();
        let weighted_f1 = if total == 0 {
            0.0
        } else {
            classes.iter().map(|c| c.f1 * c.support as f64).sum::<f64>() / total as f64
        };
        Self {
            classes,
            accuracy: accuracy(truth, predicted),
            macro_f1,
            weighted_f1,
            confusion,
        }
    }

    /// Plain-text table in the usual precision/recall/F1/support layout.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "{:>10} {:>9} {:>9} {:>9} {:>9}\n",
            "", "precision", "recall", "f1-score", "support"
        );
        for class in &self.classes {
            out.push_str(&format!(
                "{:>10} {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
                class.label, class.precision, class.recall, class.f1, class.support
            ));
        }
        let total: usize = self.classes.iter().map(|c| c.support).sum();
        out.push_str(&format!(
            "{:>10} {:>9} {:>9} {:>9.4} {:>9}\n",
            "accuracy", "", "", self.accuracy, total
        ));
        out.push_str(&format!(
            "{:>10} {:>9} {:>9} {:>9.4} {:>9}\n",
            "macro f1", "", "", self.macro_f1, total
        ));
        out
    }
}

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    artifact::{ArtifactError, ModelArtifact},
    classifiers::{
        func::log_loss,
        reporter::{PartitionSizes, TrainingReport},
        AlgorithmConfig, Classifier, FittedModel, LabeledMatrix, Learner, ModelError,
    },
    codec::{CodecError, LabelCodec},
    dataset::Dataset,
    metrics::{accuracy, ClassificationReport},
    splitter::{SplitError, SplitManifest},
    telemetry::LearningTelemetry,
};

/// Failures while training or evaluating.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// A partition the run needs has no rows.
    #[error("{0} partition is empty")]
    EmptyPartition(&'static str),
    /// The manifest does not describe this dataset.
    #[error(transparent)]
    Split(#[from] SplitError),
    /// A label could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The learner rejected the data or its parameters.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Dataset width differs from what the model expects.
    #[error("dataset has {found} features, model expects {expected}")]
    FeatureMismatch {
        /// Model feature count.
        expected: usize,
        /// Dataset feature count.
        found: usize,
    },
}

/// Everything a training run produces; nothing is written to disk.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Fitted model.
    pub model: FittedModel,
    /// Codec fitted on the training labels.
    pub codec: LabelCodec,
    /// Quality report.
    pub report: TrainingReport,
}

impl TrainingOutcome {
    /// Packages the outcome as an artifact ready to save.
    pub fn into_artifact(self) -> Result<ModelArtifact, ArtifactError> {
        ModelArtifact::new(self.model, self.codec, Some(self.report))
    }
}

/// Scores of a model on one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Rows scored.
    pub rows: usize,
    /// Accuracy.
    pub accuracy: f64,
    /// Multiclass log-loss.
    pub log_loss: f64,
    /// Per-class breakdown.
    pub report: ClassificationReport,
}

/// Scores `model` on the records `ids` of `dataset`.
pub fn evaluate(
    model: &dyn Classifier,
    codec: &LabelCodec,
    dataset: &Dataset,
    ids: &[usize],
) -> Result<Evaluation, TrainingError> {
    if dataset.feature_dim() != model.n_features() {
        return Err(TrainingError::FeatureMismatch {
            expected: model.n_features(),
            found: dataset.feature_dim(),
        });
    }
    if ids.is_empty() {
        return Err(TrainingError::EmptyPartition("evaluation"));
    }
    let truth = codec.encode_all(&dataset.labels_of(ids))?;
    let probabilities = model.predict_proba(dataset.features(ids).view());
    let predicted = crate::classifiers::func::argmax_rows(probabilities.view());
    Ok(Evaluation {
        rows: ids.len(),
        accuracy: accuracy(&truth, &predicted),
        log_loss: log_loss(probabilities.view(), &truth),
        report: ClassificationReport::new(&truth, &predicted, codec.classes()),
    })
}

/// Fits the configured algorithm on a split dataset and measures it.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    algorithm: AlgorithmConfig,
}

impl Trainer {
    /// Creates a trainer for `algorithm`.
    #[must_use]
    pub const fn new(algorithm: AlgorithmConfig) -> Self {
        Self { algorithm }
    }

    /// Configured algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> &AlgorithmConfig {
        &self.algorithm
    }

    /// Trains without telemetry.
    pub fn train(
        &self,
        dataset: &Dataset,
        manifest: &SplitManifest,
    ) -> Result<TrainingOutcome, TrainingError> {
        self.train_with_telemetry(dataset, manifest, None)
    }

    /// Trains on `manifest.train_ids`, stops early on `validation_ids`, and reports on all
    /// three partitions.
    pub fn train_with_telemetry(
        &self,
        dataset: &Dataset,
        manifest: &SplitManifest,
        telemetry: Option<&LearningTelemetry>,
    ) -> Result<TrainingOutcome, TrainingError> {
        manifest.verify(dataset.len())?;
        for (name, ids) in [
            ("train", &manifest.train_ids),
            ("validation", &manifest.validation_ids),
            ("test", &manifest.test_ids),
        ] {
            if ids.is_empty() {
                return Err(TrainingError::EmptyPartition(name));
            }
        }

        let codec = LabelCodec::fit(dataset.labels_of(&manifest.train_ids))?;
        let train_y = codec.encode_all(&dataset.labels_of(&manifest.train_ids))?;
        let validation_y = codec.encode_all(&dataset.labels_of(&manifest.validation_ids))?;
        let test_y = codec.encode_all(&dataset.labels_of(&manifest.test_ids))?;
        let train_x = dataset.features(&manifest.train_ids);
        let validation_x = dataset.features(&manifest.validation_ids);
        let test_x = dataset.features(&manifest.test_ids);

        let n_classes = codec.len();
        let train = LabeledMatrix::new(train_x.view(), &train_y, n_classes);
        let validation = LabeledMatrix::new(validation_x.view(), &validation_y, n_classes);

        log(
            telemetry,
            LogLevel::Info,
            "training_start",
            json!({
                "algorithm": self.algorithm.name(),
                "params": self.algorithm.params_json(),
                "classes": n_classes,
                "features": dataset.feature_dim(),
                "train": train_y.len(),
                "validation": validation_y.len(),
                "test": test_y.len(),
            }),
        );
        let started = Instant::now();
        let model = match self.algorithm.fit(&train, Some(&validation)) {
            Ok(model) => model,
            Err(err) => {
                log(
                    telemetry,
                    LogLevel::Error,
                    "training_failed",
                    json!({ "algorithm": self.algorithm.name(), "error": err.to_string() }),
                );
                return Err(err.into());
            }
        };
        let fit_millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let train_accuracy = accuracy(&train_y, &model.predict(train_x.view()));
        let validation_accuracy = accuracy(&validation_y, &model.predict(validation_x.view()));
        let test_proba = model.predict_proba(test_x.view());
        let test_predicted = crate::classifiers::func::argmax_rows(test_proba.view());
        let test_report = ClassificationReport::new(&test_y, &test_predicted, codec.classes());
        let report = TrainingReport {
            algorithm: self.algorithm.name().to_string(),
            params: self.algorithm.params_json(),
            partitions: PartitionSizes {
                train: train_y.len(),
                validation: validation_y.len(),
                test: test_y.len(),
            },
            train_accuracy,
            validation_accuracy,
            test_accuracy: test_report.accuracy,
            train_test_gap: train_accuracy - test_report.accuracy,
            test_log_loss: log_loss(test_proba.view(), &test_y),
            test_report,
            trace: model.trace(),
            fit_millis,
        };
        log(
            telemetry,
            LogLevel::Info,
            "training_complete",
            json!({
                "algorithm": report.algorithm,
                "train_accuracy": report.train_accuracy,
                "validation_accuracy": report.validation_accuracy,
                "test_accuracy": report.test_accuracy,
                "train_test_gap": report.train_test_gap,
                "macro_f1": report.test_report.macro_f1,
                "trace": report.trace,
                "fit_millis": report.fit_millis,
            }),
        );
        Ok(TrainingOutcome {
            model,
            codec,
            report,
        })
    }
}

fn log(
    telemetry: Option<&LearningTelemetry>,
    level: LogLevel,
    message: &str,
    metadata: serde_json::Value,
) {
    if let Some(tel) = telemetry {
        let _ = tel.log(level, message, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifiers::{BoostingParams, LogisticParams},
        splitter::{SplitConfig, StratifiedSplitter},
    };
    use tempfile::tempdir;

    fn split(dataset: &Dataset) -> SplitManifest {
        StratifiedSplitter::new(SplitConfig::default())
            .split(&dataset.labels())
            .unwrap()
    }

    #[test]
    fn trains_and_reports_on_every_partition() {
        let dataset = Dataset::synthetic(&["ENFP", "INTJ", "ISTP"], 40, 12, 5);
        let manifest = split(&dataset);
        let dir = tempdir().unwrap();
        let telemetry = LearningTelemetry::to_file("learning", dir.path().join("job.jsonl")).unwrap();
        let trainer = Trainer::new(AlgorithmConfig::GradientBoosting(BoostingParams {
            n_estimators: 40,
            ..BoostingParams::default()
        }));
        let outcome = trainer
            .train_with_telemetry(&dataset, &manifest, Some(&telemetry))
            .unwrap();
        assert_eq!(outcome.codec.classes(), ["ENFP", "INTJ", "ISTP"]);
        let report = &outcome.report;
        assert_eq!(report.partitions.train, manifest.train_ids.len());
        assert!(report.test_accuracy > 0.9, "{}", report.summary());
        assert!((report.train_test_gap - (report.train_accuracy - report.test_accuracy)).abs() < 1e-12);
        assert_eq!(report.test_report.classes.len(), 3);
        assert!(report.trace.is_some());

        let messages: Vec<String> = shared_logging::read_records(telemetry.path())
            .unwrap()
            .into_iter()
            .map(|record| record.message)
            .collect();
        assert_eq!(messages, ["training_start", "training_complete"]);
    }

    #[test]
    fn label_missing_from_training_is_a_codec_error() {
        let mut dataset = Dataset::synthetic(&["A", "B"], 10, 4, 1);
        let manifest = split(&dataset);
        let test_id = manifest.test_ids[0];
        dataset.records[test_id].label = "Z".into();
        let err = Trainer::new(AlgorithmConfig::LogisticRegression(LogisticParams::default()))
            .train(&dataset, &manifest)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Codec(CodecError::UnknownLabel(label)) if label == "Z"));
    }

    #[test]
    fn evaluate_rejects_wrong_width() {
        let dataset = Dataset::synthetic(&["A", "B"], 10, 4, 1);
        let manifest = split(&dataset);
        let outcome = Trainer::new(AlgorithmConfig::LogisticRegression(LogisticParams::default()))
            .train(&dataset, &manifest)
            .unwrap();
        let narrow = Dataset::synthetic(&["A", "B"], 10, 3, 1);
        assert!(matches!(
            evaluate(&outcome.model, &outcome.codec, &narrow, &[0]),
            Err(TrainingError::FeatureMismatch {
                expected: 4,
                found: 3
            })
        ));
        let evaluation =
            evaluate(&outcome.model, &outcome.codec, &dataset, &manifest.test_ids).unwrap();
        assert_eq!(evaluation.rows, manifest.test_ids.len());
    }
}

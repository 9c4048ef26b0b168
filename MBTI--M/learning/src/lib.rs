#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! MBTI learning stack: survey datasets, reproducible stratified splits, label codec,
//! classical classifiers, training reports, and model artifacts.

/// Survey dataset loading and export.
#[path = "../dataset.rs"]
pub mod dataset;

/// Deterministic two-stage stratified splitter and split manifests.
#[path = "../splitter.rs"]
pub mod splitter;

/// Label codec between class names and indices.
#[path = "../codec.rs"]
pub mod codec;

/// Pluggable classifiers.
#[path = "../ML/main.rs"]
pub mod classifiers;

/// Classification metrics.
#[path = "../metrics.rs"]
pub mod metrics;

/// Training and evaluation.
#[path = "../trainer.rs"]
pub mod trainer;

/// Model artifact store.
#[path = "../artifact.rs"]
pub mod artifact;

/// Pipeline configuration.
#[path = "../config.rs"]
pub mod config;

/// Offline split-train-save pipeline.
#[path = "../pipeline.rs"]
pub mod pipeline;

/// Telemetry helpers for structured logging.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use artifact::{ArtifactError, ModelArtifact, FORMAT_VERSION};
pub use classifiers::{
    reporter::TrainingReport, AlgorithmConfig, Classifier, FittedModel, LabeledMatrix, Learner,
    ModelError,
};
pub use codec::{CodecError, LabelCodec, MBTI_TYPES};
pub use config::PipelineConfig;
pub use dataset::{Dataset, DatasetError, DatasetSchema, Record, FEATURE_COUNT};
pub use metrics::{ClassMetrics, ClassificationReport, ConfusionMatrix};
pub use pipeline::{PipelineRun, TrainingPipeline};
pub use splitter::{SplitConfig, SplitError, SplitManifest, StratifiedSplitter};
pub use telemetry::LearningTelemetry;
pub use trainer::{evaluate, Evaluation, Trainer, TrainingError, TrainingOutcome};

//! Offline pipeline: load survey, reuse or draw the split, train, persist the artifact.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifact::{write_json_atomic, ModelArtifact},
    classifiers::reporter::TrainingReport,
    config::PipelineConfig,
    dataset::Dataset,
    splitter::{SplitManifest, StratifiedSplitter},
    telemetry::LearningTelemetry,
    trainer::Trainer,
};

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Manifest used for the run.
    pub manifest: SplitManifest,
    /// Whether the manifest came from disk rather than a fresh draw.
    pub manifest_reused: bool,
    /// Artifact written to `artifact_path`.
    pub artifact: ModelArtifact,
    /// Where the artifact was written.
    pub artifact_path: PathBuf,
}

impl PipelineRun {
    /// Report of the training step.
    #[must_use]
    pub fn report(&self) -> Option<&TrainingReport> {
        self.artifact.metrics.as_ref()
    }
}

/// Drives split → train → save for one [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct TrainingPipeline {
    config: PipelineConfig,
    telemetry: Option<LearningTelemetry>,
}

impl TrainingPipeline {
    /// Creates a pipeline without telemetry.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            telemetry: None,
        }
    }

    /// Attaches telemetry sinks for structured logging.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LearningTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads the dataset named by the config and runs every stage.
    pub fn run(&self) -> Result<PipelineRun> {
        let dataset = Dataset::from_csv(&self.config.dataset, &self.config.schema)
            .with_context(|| format!("loading dataset {}", self.config.dataset.display()))?;
        self.log(
            LogLevel::Info,
            "dataset_loaded",
            json!({
                "path": self.config.dataset,
                "records": dataset.len(),
                "features": dataset.feature_dim(),
                "class_counts": dataset.class_counts(),
            }),
        );
        self.run_on(&dataset)
    }

    /// Runs every stage on an in-memory dataset.
    pub fn run_on(&self, dataset: &Dataset) -> Result<PipelineRun> {
        let telemetry = self.telemetry.as_ref();
        let (manifest, manifest_reused) = StratifiedSplitter::new(self.config.split)
            .split_or_load(dataset, &self.config.manifest_path, telemetry)
            .context("splitting dataset")?;

        if let Some(dir) = &self.config.export_dir {
            for (name, ids) in [
                ("train", &manifest.train_ids),
                ("validation", &manifest.validation_ids),
                ("test", &manifest.test_ids),
            ] {
                let path = dir.join(format!("{name}.csv"));
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating export dir {}", dir.display()))?;
                dataset
                    .write_csv(&path, ids, &self.config.schema.label_column)
                    .with_context(|| format!("exporting {}", path.display()))?;
            }
            self.log(LogLevel::Info, "split_exported", json!({ "dir": dir }));
        }

        let outcome = Trainer::new(self.config.model.clone())
            .train_with_telemetry(dataset, &manifest, telemetry)
            .context("training model")?;
        let artifact = outcome.into_artifact().context("packaging model artifact")?;
        artifact
            .save(&self.config.artifact_path)
            .context("saving model artifact")?;
        self.log(
            LogLevel::Info,
            "artifact_saved",
            json!({
                "path": self.config.artifact_path,
                "id": artifact.id,
                "algorithm": artifact.algorithm,
                "classes": artifact.codec.len(),
            }),
        );

        if let (Some(path), Some(report)) = (&self.config.report_path, &artifact.metrics) {
            write_json_atomic(path, report)
                .with_context(|| format!("writing report {}", path.display()))?;
        }

        Ok(PipelineRun {
            manifest,
            manifest_reused,
            artifact,
            artifact_path: self.config.artifact_path.clone(),
        })
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact,
        classifiers::{AlgorithmConfig, BoostingParams},
        splitter::SplitConfig,
    };
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            manifest_path: dir.join("split.json"),
            artifact_path: dir.join("model.json"),
            report_path: Some(dir.join("report.json")),
            export_dir: Some(dir.join("parts")),
            split: SplitConfig::default(),
            model: AlgorithmConfig::GradientBoosting(BoostingParams {
                n_estimators: 30,
                ..BoostingParams::default()
            }),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn second_run_reuses_manifest() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::synthetic(&["ESTJ", "INFP", "INTJ"], 100, 60, 42);
        let telemetry = LearningTelemetry::to_file("learning", dir.path().join("job.jsonl")).unwrap();
        let pipeline = TrainingPipeline::new(config(dir.path())).with_telemetry(telemetry.clone());

        let first = pipeline.run_on(&dataset).unwrap();
        assert!(!first.manifest_reused);
        assert_eq!(first.manifest.sizes(), (210, 45, 45));
        let second = pipeline.run_on(&dataset).unwrap();
        assert!(second.manifest_reused);
        assert_eq!(second.manifest, first.manifest);

        let loaded = artifact::load(dir.path().join("model.json")).unwrap();
        assert_eq!(loaded.id, second.artifact.id);
        assert!(dir.path().join("report.json").exists());
        assert!(dir.path().join("parts/test.csv").exists());

        let messages: Vec<String> = shared_logging::read_records(telemetry.path())
            .unwrap()
            .into_iter()
            .map(|record| record.message)
            .collect();
        assert!(messages.contains(&"split_created".to_string()));
        assert!(messages.contains(&"split_reused".to_string()));
        assert!(messages.contains(&"artifact_saved".to_string()));
    }

    #[test]
    fn missing_dataset_is_reported_with_path() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.dataset = dir.path().join("absent.csv");
        let err = TrainingPipeline::new(config).run().unwrap_err();
        assert!(format!("{err:#}").contains("absent.csv"));
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{classifiers::AlgorithmConfig, dataset::DatasetSchema, splitter::SplitConfig};

/// Everything an offline split-and-train run needs. Every field has a default, so an empty
/// document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Survey CSV.
    pub dataset: PathBuf,
    /// Column layout of the survey CSV.
    pub schema: DatasetSchema,
    /// Split seed and fractions.
    pub split: SplitConfig,
    /// Algorithm and hyperparameters.
    pub model: AlgorithmConfig,
    /// Where the split manifest is read from or written to.
    pub manifest_path: PathBuf,
    /// Where the model artifact is written.
    pub artifact_path: PathBuf,
    /// Optional JSON copy of the training report.
    pub report_path: Option<PathBuf>,
    /// Optional directory receiving `train.csv`, `validation.csv`, and `test.csv`.
    pub export_dir: Option<PathBuf>,
    /// Root of the dated job logs.
    pub log_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: PathBuf::from("16P_eda_cleaned.csv"),
            schema: DatasetSchema::default(),
            split: SplitConfig::default(),
            model: AlgorithmConfig::default(),
            manifest_path: PathBuf::from("data_split_indices.json"),
            artifact_path: PathBuf::from("model.json"),
            report_path: None,
            export_dir: None,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON or TOML (by extension) config; relative paths resolve against the
    /// config file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let mut config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            _ => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
        };
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_relative_to(&base);
        config.validate()?;
        Ok(config)
    }

    /// Rebases every relative path onto `base`.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        let rebase = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        rebase(&mut self.dataset);
        rebase(&mut self.manifest_path);
        rebase(&mut self.artifact_path);
        rebase(&mut self.log_dir);
        if let Some(report) = self.report_path.as_mut() {
            rebase(report);
        }
        if let Some(export) = self.export_dir.as_mut() {
            rebase(export);
        }
    }

    /// Rejects values no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.schema.feature_count == 0 {
            bail!("schema.feature_count must be positive");
        }
        if self.schema.label_column.trim().is_empty() {
            bail!("schema.label_column must not be empty");
        }
        for (name, value) in [
            ("split.test_fraction", self.split.test_fraction),
            ("split.validation_fraction", self.split.validation_fraction),
        ] {
            if !(value > 0.0 && value < 1.0) {
                bail!("{name} must lie in (0, 1), got {value}");
            }
        }
        if self.manifest_path == self.artifact_path {
            bail!("manifest_path and artifact_path must differ");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifiers::ForestParams;
    use tempfile::tempdir;

    #[test]
    fn empty_json_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, "{}").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.split, SplitConfig::default());
        assert_eq!(config.model, AlgorithmConfig::default());
        assert_eq!(config.dataset, dir.path().join("16P_eda_cleaned.csv"));
    }

    #[test]
    fn toml_selects_algorithm_and_keeps_absolute_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            r#"
dataset = "/data/survey.csv"
artifact_path = "out/model.json"

[split]
seed = 7

[model]
algorithm = "random_forest"
n_trees = 25
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.dataset, PathBuf::from("/data/survey.csv"));
        assert_eq!(config.artifact_path, dir.path().join("out/model.json"));
        assert_eq!(config.split.seed, 7);
        assert!((config.split.test_fraction - 0.15).abs() < f64::EPSILON);
        assert_eq!(
            config.model,
            AlgorithmConfig::RandomForest(ForestParams {
                n_trees: 25,
                ..ForestParams::default()
            })
        );
    }

    #[test]
    fn rejects_out_of_range_fraction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"split": {"test_fraction": 1.5}}"#).unwrap();
        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("split.test_fraction"));
    }
}

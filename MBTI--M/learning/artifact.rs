//! Durable model artifacts: one JSON document holding the fitted model, its label codec,
//! and the report of the run that produced it.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    classifiers::{reporter::TrainingReport, Classifier, FittedModel},
    codec::LabelCodec,
};

/// Artifact layout version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Failures while saving or loading an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Nothing at the path.
    #[error("model artifact not found at {0}")]
    Missing(PathBuf),
    /// The file exists but does not decode.
    #[error("model artifact at {path} is corrupt: {reason}")]
    Corrupt {
        /// Artifact path.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },
    /// Written by an incompatible build.
    #[error("model artifact at {path} has format version {found}, expected {expected}")]
    IncompatibleVersion {
        /// Artifact path.
        path: PathBuf,
        /// Version in the file.
        found: u32,
        /// Version this build reads.
        expected: u32,
    },
    /// Model and codec disagree.
    #[error("model artifact is inconsistent: {0}")]
    Inconsistent(String),
    /// Filesystem failure.
    #[error("artifact i/o at {path}: {source}")]
    Io {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// A trained model together with everything needed to interpret its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Layout version.
    pub format_version: u32,
    /// Unique artifact id.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Algorithm identifier.
    pub algorithm: String,
    /// Expected feature count per request.
    pub n_features: usize,
    /// Codec the model's class indices refer to.
    pub codec: LabelCodec,
    /// Fitted model state.
    pub model: FittedModel,
    /// Report of the training run, when available.
    pub metrics: Option<TrainingReport>,
}

#[derive(Deserialize)]
struct Header {
    format_version: u32,
}

impl ModelArtifact {
    /// Bundles a model with its codec after checking they agree.
    pub fn new(
        model: FittedModel,
        codec: LabelCodec,
        metrics: Option<TrainingReport>,
    ) -> Result<Self, ArtifactError> {
        let artifact = Self {
            format_version: FORMAT_VERSION,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            algorithm: model.name().to_string(),
            n_features: model.n_features(),
            codec,
            model,
            metrics,
        };
        artifact.check_consistency()?;
        Ok(artifact)
    }

    /// Verifies codec validity and that codec, model, and header sizes agree.
    pub fn check_consistency(&self) -> Result<(), ArtifactError> {
        self.codec
            .validate()
            .map_err(|err| ArtifactError::Inconsistent(format!("codec: {err}")))?;
        if self.codec.len() != self.model.n_classes() {
            return Err(ArtifactError::Inconsistent(format!(
                "codec has {} classes but the model predicts {}",
                self.codec.len(),
                self.model.n_classes()
            )));
        }
        if self.n_features != self.model.n_features() {
            return Err(ArtifactError::Inconsistent(format!(
                "header declares {} features but the model expects {}",
                self.n_features,
                self.model.n_features()
            )));
        }
        if self.algorithm != self.model.name() {
            return Err(ArtifactError::Inconsistent(format!(
                "header names {} but the model is {}",
                self.algorithm,
                self.model.name()
            )));
        }
        Ok(())
    }

    /// Writes the artifact atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ArtifactError> {
        let path = path.as_ref();
        write_json_atomic(path, self).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and validates an artifact.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ArtifactError::Missing(path.to_path_buf())
            } else {
                ArtifactError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let corrupt = |err: serde_json::Error| ArtifactError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        };
        let header: Header = serde_json::from_str(&contents).map_err(corrupt)?;
        if header.format_version != FORMAT_VERSION {
            return Err(ArtifactError::IncompatibleVersion {
                path: path.to_path_buf(),
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }
        let artifact: Self = serde_json::from_str(&contents).map_err(corrupt)?;
        artifact.check_consistency()?;
        Ok(artifact)
    }
}

/// Saves `model` and `codec` as one artifact at `path`.
pub fn save(
    path: impl AsRef<Path>,
    model: FittedModel,
    codec: LabelCodec,
    metrics: Option<TrainingReport>,
) -> Result<ModelArtifact, ArtifactError> {
    let artifact = ModelArtifact::new(model, codec, metrics)?;
    artifact.save(path)?;
    Ok(artifact)
}

/// Loads the artifact at `path`.
pub fn load(path: impl AsRef<Path>) -> Result<ModelArtifact, ArtifactError> {
    ModelArtifact::load(path)
}

/// Serializes `value` as pretty JSON into a temp file beside `path`, syncs it, and renames
/// it over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{artifact::write_json_atomic, dataset::Dataset, telemetry::LearningTelemetry};

/// Seed used by every split of the survey study.
pub const DEFAULT_SEED: u64 = 42;

/// Split parameters. `validation_fraction` is taken from what remains after the test cut.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplitConfig {
    /// RNG seed shared by both stages.
    pub seed: u64,
    /// Share of all records held out for testing.
    pub test_fraction: f64,
    /// Share of the non-test records held out for validation.
    pub validation_fraction: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        // 0.176 of the remaining 85% is ~15% of the total, giving 70/15/15.
        Self {
            seed: DEFAULT_SEED,
            test_fraction: 0.15,
            validation_fraction: 0.176,
        }
    }
}

/// Persisted partition of record ids. Every id list is sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitManifest {
    /// Seed the partition was drawn with.
    pub seed: u64,
    /// Test fraction as configured.
    pub test_fraction: FractionRepr,
    /// Validation fraction of the remainder.
    pub validation_fraction: FractionRepr,
    /// Number of records in the dataset the split was drawn from.
    pub record_count: usize,
    /// Training ids.
    pub train_ids: Vec<usize>,
    /// Validation ids.
    pub validation_ids: Vec<usize>,
    /// Test ids.
    pub test_ids: Vec<usize>,
}

/// Fraction kept as a string so manifests compare byte-for-byte and `Eq` holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FractionRepr(String);

impl FractionRepr {
    fn new(value: f64) -> Self {
        Self(value.to_string())
    }

    /// Parsed value.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.0.parse().unwrap_or(f64::NAN)
    }
}

impl SplitManifest {
    /// Partition sizes as `(train, validation, test)`.
    #[must_use]
    pub fn sizes(&self) -> (usize, usize, usize) {
        (
            self.train_ids.len(),
            self.validation_ids.len(),
            self.test_ids.len(),
        )
    }

    /// True when the manifest was drawn with exactly these parameters.
    #[must_use]
    pub fn matches(&self, config: &SplitConfig) -> bool {
        self.seed == config.seed
            && self.test_fraction == FractionRepr::new(config.test_fraction)
            && self.validation_fraction == FractionRepr::new(config.validation_fraction)
    }

    /// Checks the manifest covers `record_count` ids exactly once.
    pub fn verify(&self, record_count: usize) -> Result<(), SplitError> {
        if self.record_count != record_count {
            return Err(SplitError::ManifestMismatch(format!(
                "manifest covers {} records but the dataset has {record_count}",
                self.record_count
            )));
        }
        let mut seen = vec![false; record_count];
        for &id in self
            .train_ids
            .iter()
            .chain(&self.validation_ids)
            .chain(&self.test_ids)
        {
            match seen.get_mut(id) {
                None => {
                    return Err(SplitError::ManifestMismatch(format!(
                        "id {id} is outside the dataset"
                    )))
                }
                Some(true) => {
                    return Err(SplitError::ManifestMismatch(format!(
                        "id {id} appears in more than one partition"
                    )))
                }
                Some(flag) => *flag = true,
            }
        }
        if let Some(missing) = seen.iter().position(|flag| !flag) {
            return Err(SplitError::ManifestMismatch(format!(
                "id {missing} is not assigned to any partition"
            )));
        }
        Ok(())
    }

    /// Persists the manifest as pretty JSON; readers never see a half-written file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SplitError> {
        let path = path.as_ref();
        write_json_atomic(path, self).map_err(|source| SplitError::Persist {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads a previously saved manifest.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SplitError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SplitError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|err| SplitError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }
}

/// Two-stage stratified shuffle splitter.
#[derive(Debug, Clone, Default)]
pub struct StratifiedSplitter {
    config: SplitConfig,
}

impl StratifiedSplitter {
    /// Creates a splitter with the provided configuration.
    #[must_use]
    pub const fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Partitions record ids `0..labels.len()` into train/validation/test.
    ///
    /// The result depends only on the labels, the seed, and the fractions.
    pub fn split<S: AsRef<str>>(&self, labels: &[S]) -> Result<SplitManifest, SplitError> {
        let SplitConfig {
            seed,
            test_fraction,
            validation_fraction,
        } = self.config;
        for (name, value) in [
            ("test_fraction", test_fraction),
            ("validation_fraction", validation_fraction),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(SplitError::InvalidFraction { name, value });
            }
        }
        if labels.is_empty() {
            return Err(SplitError::EmptyDataset);
        }

        let mut class_of = Vec::with_capacity(labels.len());
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for label in labels {
            *counts.entry(label.as_ref()).or_insert(0) += 1;
        }
        if let Some((label, &count)) = counts.iter().find(|(_, count)| **count < 2) {
            return Err(SplitError::ClassTooSmall {
                label: (*label).to_string(),
                count,
            });
        }
        let index: BTreeMap<&str, usize> = counts
            .keys()
            .enumerate()
            .map(|(idx, label)| (*label, idx))
            .collect();
        for label in labels {
            class_of.push(index[label.as_ref()]);
        }

        let all_ids: Vec<usize> = (0..labels.len()).collect();
        let (remainder, test_ids) = stratified_holdout(&all_ids, &class_of, test_fraction, seed)?;
        let (train_ids, validation_ids) =
            stratified_holdout(&remainder, &class_of, validation_fraction, seed)?;

        Ok(SplitManifest {
            seed,
            test_fraction: FractionRepr::new(test_fraction),
            validation_fraction: FractionRepr::new(validation_fraction),
            record_count: labels.len(),
            train_ids,
            validation_ids,
            test_ids,
        })
    }

    /// Reuses the manifest at `path` when present, otherwise draws and persists a new one.
    ///
    /// Returns the manifest and whether it was loaded from disk.
    pub fn split_or_load(
        &self,
        dataset: &Dataset,
        path: &Path,
        telemetry: Option<&LearningTelemetry>,
    ) -> Result<(SplitManifest, bool), SplitError> {
        if path.exists() {
            let manifest = SplitManifest::load(path)?;
            manifest.verify(dataset.len())?;
            if !manifest.matches(&self.config) {
                return Err(SplitError::ManifestMismatch(format!(
                    "{} was drawn with seed {} and fractions {}/{}; refusing to mix split parameters",
                    path.display(),
                    manifest.seed,
                    manifest.test_fraction.value(),
                    manifest.validation_fraction.value()
                )));
            }
            log(
                telemetry,
                LogLevel::Info,
                "split_reused",
                &manifest,
                path,
            );
            return Ok((manifest, true));
        }
        let manifest = self.split(&dataset.labels())?;
        manifest.save(path)?;
        log(
            telemetry,
            LogLevel::Info,
            "split_created",
            &manifest,
            path,
        );
        Ok((manifest, false))
    }
}

fn log(
    telemetry: Option<&LearningTelemetry>,
    level: LogLevel,
    message: &str,
    manifest: &SplitManifest,
    path: &Path,
) {
    if let Some(tel) = telemetry {
        let (train, validation, test) = manifest.sizes();
        let _ = tel.log(
            level,
            message,
            json!({
                "path": path,
                "seed": manifest.seed,
                "train": train,
                "validation": validation,
                "test": test,
            }),
        );
    }
}

/// Splits `ids` into `(kept, held_out)` with per-class proportional allocation.
///
/// The hold-out size is `ceil(fraction * n)`. Each class receives `floor(share)` slots and
/// the leftovers go to the largest fractional remainders, ties broken by class order.
fn stratified_holdout(
    ids: &[usize],
    class_of: &[usize],
    fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), SplitError> {
    let n = ids.len();
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &id in ids {
        by_class.entry(class_of[id]).or_default().push(id);
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let n_holdout = (fraction * n as f64 - 1e-9).ceil().max(0.0) as usize;
    let n_classes = by_class.len();
    if n_holdout < n_classes || n - n_holdout < n_classes {
        return Err(SplitError::TooFewSamples {
            samples: n,
            holdout: n_holdout,
            classes: n_classes,
        });
    }

    let mut quota: Vec<(usize, usize, usize)> = by_class
        .iter()
        .map(|(&class, members)| {
            let share = members.len() * n_holdout;
            (class, share / n, share % n)
        })
        .collect();
    let assigned: usize = quota.iter().map(|(_, base, _)| base).sum();
    let mut order: Vec<usize> = (0..quota.len()).collect();
    order.sort_by(|&a, &b| quota[b].2.cmp(&quota[a].2).then(quota[a].0.cmp(&quota[b].0)));
    for &slot in order.iter().take(n_holdout - assigned) {
        quota[slot].1 += 1;
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut kept = Vec::with_capacity(n - n_holdout);
    let mut held_out = Vec::with_capacity(n_holdout);
    for (class, take, _) in quota {
        let mut members = by_class.remove(&class).unwrap_or_default();
        members.shuffle(&mut rng);
        held_out.extend_from_slice(&members[..take]);
        kept.extend_from_slice(&members[take..]);
    }
    kept.sort_unstable();
    held_out.sort_unstable();
    Ok((kept, held_out))
}

/// Errors raised while drawing or reusing a split. All of them are configuration errors
/// for the offline pipeline and abort the run.
#[derive(Debug, Error)]
pub enum SplitError {
    /// Stratification impossible for a class.
    #[error("class `{label}` has {count} record(s); stratified splitting needs at least 2")]
    ClassTooSmall {
        /// Class label.
        label: String,
        /// Records with that label.
        count: usize,
    },
    /// Fraction outside (0, 1).
    #[error("{name} must be strictly between 0 and 1, got {value}")]
    InvalidFraction {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },
    /// A stage cannot place every class on both sides.
    #[error("cannot hold out {holdout} of {samples} records while keeping all {classes} classes on both sides")]
    TooFewSamples {
        /// Records entering the stage.
        samples: usize,
        /// Requested hold-out size.
        holdout: usize,
        /// Distinct classes in the stage.
        classes: usize,
    },
    /// Nothing to split.
    #[error("cannot split an empty dataset")]
    EmptyDataset,
    /// Manifest does not describe this dataset or configuration.
    #[error("split manifest mismatch: {0}")]
    ManifestMismatch(String),
    /// Manifest unreadable.
    #[error("reading split manifest {path}: {source}")]
    Read {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Manifest not valid JSON for this schema.
    #[error("split manifest {path} is corrupt: {reason}")]
    Corrupt {
        /// Manifest path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
    /// Manifest could not be written.
    #[error("writing split manifest {path}: {source}")]
    Persist {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

use std::{collections::BTreeMap, path::Path};

use ndarray::Array2;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MBTI_TYPES;

/// Number of survey answers per respondent.
pub const FEATURE_COUNT: usize = 60;

/// Column holding the personality label in the survey export.
pub const DEFAULT_LABEL_COLUMN: &str = "Personality";

/// Describes how a tabular dataset file is laid out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatasetSchema {
    /// Name of the categorical label column; every other column is a feature.
    pub label_column: String,
    /// Expected number of feature columns.
    pub feature_count: usize,
    /// Reject labels outside the 16 MBTI codes.
    pub strict_labels: bool,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            label_column: DEFAULT_LABEL_COLUMN.into(),
            feature_count: FEATURE_COUNT,
            strict_labels: true,
        }
    }
}

/// One respondent: survey answers plus the personality label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Feature vector.
    pub features: Vec<f32>,
    /// Class label.
    pub label: String,
}

/// Ordered collection of labeled records. A record's id is its position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    /// Feature column names in file order.
    pub feature_names: Vec<String>,
    /// Records in file order.
    pub records: Vec<Record>,
}

impl Dataset {
    /// Builds a dataset from in-memory records, checking the feature count.
    pub fn from_records(
        feature_names: Vec<String>,
        records: Vec<Record>,
    ) -> Result<Self, DatasetError> {
        let expected = feature_names.len();
        if let Some((row, record)) = records
            .iter()
            .enumerate()
            .find(|(_, record)| record.features.len() != expected)
        {
            return Err(DatasetError::FeatureCount {
                row,
                expected,
                found: record.features.len(),
            });
        }
        Ok(Self {
            feature_names,
            records,
        })
    }

    /// Loads a CSV file with a header row.
    pub fn from_csv(path: impl AsRef<Path>, schema: &DatasetSchema) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DatasetError::Missing(path.display().to_string()));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let label_idx = headers
            .iter()
            .position(|name| name == schema.label_column)
            .ok_or_else(|| DatasetError::MissingLabelColumn(schema.label_column.clone()))?;
        let feature_names: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != label_idx)
            .map(|(_, name)| name.to_string())
            .collect();
        if feature_names.len() != schema.feature_count {
            return Err(DatasetError::FeatureCount {
                row: 0,
                expected: schema.feature_count,
                found: feature_names.len(),
            });
        }

        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let raw = result?;
            let mut features = Vec::with_capacity(schema.feature_count);
            let mut label = None;
            for (col, cell) in raw.iter().enumerate() {
                if col == label_idx {
                    label = Some(cell.trim().to_string());
                    continue;
                }
                let value = cell
                    .trim()
                    .parse::<f32>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| DatasetError::NonNumeric {
                        row,
                        column: headers.get(col).unwrap_or_default().to_string(),
                        value: cell.to_string(),
                    })?;
                features.push(value);
            }
            if features.len() != schema.feature_count {
                return Err(DatasetError::FeatureCount {
                    row,
                    expected: schema.feature_count,
                    found: features.len(),
                });
            }
            let label = label.unwrap_or_default();
            if schema.strict_labels && !MBTI_TYPES.contains(&label.as_str()) {
                return Err(DatasetError::UnknownLabel { row, label });
            }
            records.push(Record { features, label });
        }
        if records.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self {
            feature_names,
            records,
        })
    }

    /// Generates well-separated class clusters for tests and demos.
    ///
    /// Class `c` sits at [`synthetic_center`] with uniform noise in `[-1, 1)` per answer.
    #[must_use]
    pub fn synthetic(labels: &[&str], per_class: usize, n_features: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut records = Vec::with_capacity(labels.len() * per_class);
        for _ in 0..per_class {
            for (class, label) in labels.iter().enumerate() {
                let features = synthetic_center(labels.len(), class, n_features)
                    .into_iter()
                    .map(|center| center + rng.gen_range(-1.0..1.0))
                    .collect();
                records.push(Record {
                    features,
                    label: (*label).to_string(),
                });
            }
        }
        Self {
            feature_names: (0..n_features).map(|idx| format!("q{idx}")).collect(),
            records,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the feature dimensionality.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.feature_names.len()
    }

    /// Labels in record order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.records.iter().map(|record| record.label.as_str()).collect()
    }

    /// Record count per label, sorted by label.
    #[must_use]
    pub fn class_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.label.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Feature matrix for the given record ids, in id order.
    ///
    /// # Panics
    /// Panics if an id is out of range; callers validate ids against the dataset first.
    #[must_use]
    pub fn features(&self, ids: &[usize]) -> Array2<f32> {
        Array2::from_shape_fn((ids.len(), self.feature_dim()), |(row, col)| {
            self.records[ids[row]].features[col]
        })
    }

    /// Labels for the given record ids.
    #[must_use]
    pub fn labels_of(&self, ids: &[usize]) -> Vec<&str> {
        ids.iter()
            .map(|&id| self.records[id].label.as_str())
            .collect()
    }

    /// Writes the selected records as CSV with the label column last.
    pub fn write_csv(
        &self,
        path: impl AsRef<Path>,
        ids: &[usize],
        label_column: &str,
    ) -> Result<(), DatasetError> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        let mut header = self.feature_names.clone();
        header.push(label_column.to_string());
        writer.write_record(&header)?;
        for &id in ids {
            let record = &self.records[id];
            let mut row: Vec<String> = record.features.iter().map(ToString::to_string).collect();
            row.push(record.label.clone());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Cluster center used by [`Dataset::synthetic`]: answers `j` with `j % k == class` lean
/// strongly positive, the rest mildly negative.
#[must_use]
pub fn synthetic_center(n_classes: usize, class: usize, n_features: usize) -> Vec<f32> {
    (0..n_features)
        .map(|j| if j % n_classes.max(1) == class { 2.0 } else { -1.0 })
        .collect()
}

/// Errors raised while loading or exporting datasets.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Dataset file does not exist.
    #[error("dataset file {0} not found")]
    Missing(String),
    /// Label column absent from the header.
    #[error("label column `{0}` not found in header")]
    MissingLabelColumn(String),
    /// Row with the wrong number of features.
    #[error("row {row}: expected {expected} features, found {found}")]
    FeatureCount {
        /// Zero-based data row.
        row: usize,
        /// Configured feature count.
        expected: usize,
        /// Observed feature count.
        found: usize,
    },
    /// Feature cell that is not a finite number.
    #[error("row {row}, column `{column}`: `{value}` is not a finite number")]
    NonNumeric {
        /// Zero-based data row.
        row: usize,
        /// Column name.
        column: String,
        /// Raw cell text.
        value: String,
    },
    /// Label outside the MBTI code set.
    #[error("row {row}: unknown personality type `{label}`")]
    UnknownLabel {
        /// Zero-based data row.
        row: usize,
        /// Offending label.
        label: String,
    },
    /// File contained a header but no records.
    #[error("dataset contains no records")]
    Empty,
    /// CSV parsing or writing failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_survey(dir: &Path, rows: &[&str]) -> std::path::PathBuf {
        let path = dir.join("survey.csv");
        let mut header: Vec<String> = (0..3).map(|idx| format!("q{idx}")).collect();
        header.push("Personality".into());
        let mut body = header.join(",");
        for row in rows {
            body.push('\n');
            body.push_str(row);
        }
        fs::write(&path, body).unwrap();
        path
    }

    fn small_schema() -> DatasetSchema {
        DatasetSchema {
            feature_count: 3,
            ..DatasetSchema::default()
        }
    }

    #[test]
    fn loads_csv_with_label_column() {
        let dir = tempdir().unwrap();
        let path = write_survey(dir.path(), &["1,-2,3,INTJ", "0,0,0,ENFP"]);
        let dataset = Dataset::from_csv(&path, &small_schema()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.feature_dim(), 3);
        assert_eq!(dataset.records[0].features, vec![1.0, -2.0, 3.0]);
        assert_eq!(dataset.labels(), vec!["INTJ", "ENFP"]);
    }

    #[test]
    fn rejects_non_numeric_cells() {
        let dir = tempdir().unwrap();
        let path = write_survey(dir.path(), &["1,yes,3,INTJ"]);
        let err = Dataset::from_csv(&path, &small_schema()).unwrap_err();
        assert!(matches!(err, DatasetError::NonNumeric { row: 0, .. }));
    }

    #[test]
    fn rejects_unknown_labels_in_strict_mode() {
        let dir = tempdir().unwrap();
        let path = write_survey(dir.path(), &["1,2,3,XXXX"]);
        let err = Dataset::from_csv(&path, &small_schema()).unwrap_err();
        assert!(matches!(err, DatasetError::UnknownLabel { .. }));

        let relaxed = DatasetSchema {
            strict_labels: false,
            ..small_schema()
        };
        assert!(Dataset::from_csv(&path, &relaxed).is_ok());
    }

    #[test]
    fn rejects_wrong_feature_count_and_missing_files() {
        let dir = tempdir().unwrap();
        let path = write_survey(dir.path(), &["1,2,3,INTJ"]);
        let err = Dataset::from_csv(&path, &DatasetSchema::default()).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::FeatureCount {
                expected: 60,
                found: 3,
                ..
            }
        ));
        let err = Dataset::from_csv(dir.path().join("nope.csv"), &small_schema()).unwrap_err();
        assert!(matches!(err, DatasetError::Missing(_)));
    }

    #[test]
    fn synthetic_is_deterministic_and_balanced() {
        let a = Dataset::synthetic(&["INTJ", "ENFP", "ISTP"], 10, 60, 7);
        let b = Dataset::synthetic(&["INTJ", "ENFP", "ISTP"], 10, 60, 7);
        assert_eq!(a.records, b.records);
        assert_eq!(a.len(), 30);
        assert!(a.class_counts().values().all(|&count| count == 10));
    }

    #[test]
    fn export_round_trips_selected_rows() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::synthetic(&["INTJ", "ENFP"], 3, 3, 1);
        let out = dir.path().join("subset.csv");
        dataset.write_csv(&out, &[1, 4], "Personality").unwrap();
        let reloaded = Dataset::from_csv(&out, &small_schema()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.records[0], dataset.records[1]);
        assert_eq!(reloaded.records[1].label, dataset.records[4].label);
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The 16 canonical MBTI codes.
///
/// Only consulted when no trained codec is available; [`LabelCodec::mbti`] turns it into
/// the same sorted ordering a trained codec would use.
pub const MBTI_TYPES: [&str; 16] = [
    "INTJ", "INTP", "ENTJ", "ENTP", "INFJ", "INFP", "ENFJ", "ENFP", "ISTJ", "ISFJ", "ESTJ", "ESFJ",
    "ISTP", "ISFP", "ESTP", "ESFP",
];

/// Bidirectional mapping between class names and dense indices.
///
/// Classes are kept in lexicographic order, so fitting twice on the same label set always
/// yields the same indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCodec {
    classes: Vec<String>,
}

impl LabelCodec {
    /// Builds a codec from the distinct labels observed in `labels`.
    pub fn fit<I, S>(labels: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let classes: BTreeSet<String> = labels
            .into_iter()
            .map(|label| label.as_ref().to_string())
            .collect();
        if classes.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(Self {
            classes: classes.into_iter().collect(),
        })
    }

    /// Restores a codec from a persisted class list, which must be sorted and distinct.
    pub fn from_classes(classes: Vec<String>) -> Result<Self, CodecError> {
        let codec = Self { classes };
        codec.validate()?;
        Ok(codec)
    }

    /// Checks the invariants a deserialized codec must hold.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.classes.is_empty() {
            return Err(CodecError::Empty);
        }
        if self.classes.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(CodecError::Unordered);
        }
        Ok(())
    }

    /// Fallback codec over the 16 canonical MBTI codes.
    #[must_use]
    pub fn mbti() -> Self {
        let mut classes: Vec<String> = MBTI_TYPES.iter().map(ToString::to_string).collect();
        classes.sort();
        Self { classes }
    }

    /// Maps a label to its index.
    pub fn encode(&self, label: &str) -> Result<usize, CodecError> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(label))
            .map_err(|_| CodecError::UnknownLabel(label.to_string()))
    }

    /// Encodes a batch of labels.
    pub fn encode_all<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>, CodecError> {
        labels.iter().map(|label| self.encode(label.as_ref())).collect()
    }

    /// Maps an index back to its label.
    pub fn decode(&self, index: usize) -> Result<&str, CodecError> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(CodecError::UnknownIndex {
                index,
                classes: self.classes.len(),
            })
    }

    /// Classes in index order.
    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Always false for a constructed codec; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Errors raised by the label codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// No labels to build from.
    #[error("label codec needs at least one class")]
    Empty,
    /// Persisted class list not strictly sorted.
    #[error("persisted class list must be sorted and distinct")]
    Unordered,
    /// Label not known to this codec.
    #[error("unknown label `{0}`")]
    UnknownLabel(String),
    /// Index outside `0..classes`.
    #[error("index {index} out of range for {classes} classes")]
    UnknownIndex {
        /// Requested index.
        index: usize,
        /// Number of classes in the codec.
        classes: usize,
    },
}

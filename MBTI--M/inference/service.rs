//! Model context and the prediction contract shared by the HTTP and serverless surfaces.

use std::{path::Path, sync::Arc};

use indexmap::IndexMap;
use mbti_learning::{
    artifact::{self, ModelArtifact},
    classifiers::func::argmax,
    Classifier, LabelCodec,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Per-request failures, each mapped to one HTTP status class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    /// Malformed or wrongly shaped input.
    #[error("{0}")]
    Validation(String),
    /// No usable model.
    #[error("{0}")]
    Unavailable(String),
    /// Anything else; the message is safe to show to clients.
    #[error("{0}")]
    Internal(String),
}

impl InferenceError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// `{"error": message}` body.
    #[must_use]
    pub fn body(&self) -> Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

/// Read-only model and codec shared by every request.
#[derive(Debug, Clone)]
pub struct ModelContext {
    classifier: Arc<dyn Classifier>,
    codec: LabelCodec,
    artifact_id: Option<Uuid>,
}

impl ModelContext {
    /// Pairs a classifier with the codec its indices refer to.
    pub fn new(classifier: Arc<dyn Classifier>, codec: LabelCodec) -> Result<Self, InferenceError> {
        codec
            .validate()
            .map_err(|err| InferenceError::Internal(format!("invalid codec: {err}")))?;
        if codec.len() != classifier.n_classes() {
            return Err(InferenceError::Internal(format!(
                "codec has {} classes but the model predicts {}",
                codec.len(),
                classifier.n_classes()
            )));
        }
        Ok(Self {
            classifier,
            codec,
            artifact_id: None,
        })
    }

    /// Builds the context from a loaded artifact.
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, InferenceError> {
        let id = artifact.id;
        let mut context = Self::new(Arc::new(artifact.model), artifact.codec)?;
        context.artifact_id = Some(id);
        Ok(context)
    }

    /// Label codec.
    #[must_use]
    pub const fn codec(&self) -> &LabelCodec {
        &self.codec
    }

    /// Expected answer count.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.classifier.n_features()
    }

    /// Algorithm name.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.classifier.name()
    }

    /// Id of the artifact this context came from, if any.
    #[must_use]
    pub const fn artifact_id(&self) -> Option<Uuid> {
        self.artifact_id
    }
}

/// Lifecycle of the service's model.
#[derive(Debug, Clone)]
pub enum ModelState {
    /// No load attempted.
    Unloaded,
    /// Model ready to serve.
    Loaded(Arc<ModelContext>),
    /// Load was attempted and failed.
    LoadFailed {
        /// Why loading failed.
        reason: String,
    },
}

/// `GET /health` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Always `"healthy"` while the process answers.
    pub status: String,
    /// Whether predictions can be served.
    pub model_loaded: bool,
}

/// `GET /types` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypesResponse {
    /// Every label a prediction can return.
    pub types: Vec<String>,
}

/// `POST /predict` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Survey answers in question order.
    pub answers: Vec<f64>,
}

/// `POST /predict` success payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Most probable type.
    pub predicted_type: String,
    /// Probability of `predicted_type`.
    pub confidence: f64,
    /// Probability of every type, in codec order.
    pub probabilities: IndexMap<String, f64>,
}

/// Inference entry point. Cloning is cheap and every clone observes the same model state,
/// which never changes after construction.
#[derive(Debug, Clone)]
pub struct InferenceService {
    state: Arc<ModelState>,
}

impl Default for InferenceService {
    fn default() -> Self {
        Self::unloaded()
    }
}

impl InferenceService {
    /// Service with no model.
    #[must_use]
    pub fn unloaded() -> Self {
        Self {
            state: Arc::new(ModelState::Unloaded),
        }
    }

    /// Service serving `context`.
    #[must_use]
    pub fn loaded(context: ModelContext) -> Self {
        Self {
            state: Arc::new(ModelState::Loaded(Arc::new(context))),
        }
    }

    /// Service that failed to load; every prediction reports `reason`.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ModelState::LoadFailed {
                reason: reason.into(),
            }),
        }
    }

    /// Loads the artifact at `path`. Failure is logged and yields a degraded service rather
    /// than an error.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let context = artifact::load(path)
            .map_err(|err| err.to_string())
            .and_then(|artifact| ModelContext::from_artifact(artifact).map_err(|err| err.to_string()));
        match context {
            Ok(context) => {
                tracing::info!(
                    path = %path.display(),
                    algorithm = context.algorithm(),
                    classes = ?context.codec().classes(),
                    "model loaded"
                );
                Self::loaded(context)
            }
            Err(reason) => {
                tracing::error!(path = %path.display(), %reason, "model failed to load; serving degraded");
                Self::failed(reason)
            }
        }
    }

    /// Current model state.
    #[must_use]
    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// Whether predictions can be served.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state, ModelState::Loaded(_))
    }

    fn context(&self) -> Result<&ModelContext, InferenceError> {
        match &*self.state {
            ModelState::Loaded(context) => Ok(context.as_ref()),
            ModelState::Unloaded => Err(InferenceError::Unavailable(
                "Model not loaded: no artifact has been loaded".into(),
            )),
            ModelState::LoadFailed { reason } => Err(InferenceError::Unavailable(format!(
                "Model not loaded: {reason}"
            ))),
        }
    }

    /// Health check payload.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".into(),
            model_loaded: self.is_loaded(),
        }
    }

    /// Labels predictions can take: the model's codec, or the canonical MBTI codes.
    #[must_use]
    pub fn types(&self) -> TypesResponse {
        let types = match &*self.state {
            ModelState::Loaded(context) => context.codec().classes().to_vec(),
            ModelState::Unloaded | ModelState::LoadFailed { .. } => {
                LabelCodec::mbti().classes().to_vec()
            }
        };
        TypesResponse { types }
    }

    /// Predicts from a raw JSON request body of the form `{"answers": [...]}`.
    pub fn predict_json(&self, body: &Value) -> Result<Prediction, InferenceError> {
        let answers = body
            .get("answers")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                InferenceError::Validation(
                    "Request body must be a JSON object with an 'answers' array".into(),
                )
            })?;
        let answers = answers
            .iter()
            .enumerate()
            .map(|(idx, answer)| {
                answer.as_f64().ok_or_else(|| {
                    InferenceError::Validation(format!("answers[{idx}] is not a number: {answer}"))
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        self.predict(&answers)
    }

    /// Predicts the type for one respondent.
    #[allow(clippy::cast_possible_truncation)]
    pub fn predict(&self, answers: &[f64]) -> Result<Prediction, InferenceError> {
        let context = self.context()?;
        let expected = context.n_features();
        if answers.len() != expected {
            return Err(InferenceError::Validation(format!(
                "Expected {expected} answers, got {}",
                answers.len()
            )));
        }
        let row: Vec<f32> = answers.iter().map(|&answer| answer as f32).collect();
        if let Some(idx) = row.iter().position(|value| !value.is_finite()) {
            return Err(InferenceError::Validation(format!(
                "answers[{idx}] is not a finite number"
            )));
        }
        let row = Array2::from_shape_vec((1, expected), row)
            .map_err(|err| InferenceError::Internal(format!("shaping input: {err}")))?;

        let proba = context.classifier.predict_proba(row.view());
        let n_classes = context.codec.len();
        if proba.shape() != [1, n_classes] {
            return Err(InferenceError::Internal(format!(
                "model returned shape {:?}, expected [1, {n_classes}]",
                proba.shape()
            )));
        }
        let row = proba.row(0);
        if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(InferenceError::Internal(
                "model produced an invalid probability distribution".into(),
            ));
        }
        let total: f64 = row.iter().map(|&p| f64::from(p)).sum();
        if total <= 0.0 {
            return Err(InferenceError::Internal(
                "model produced an all-zero probability distribution".into(),
            ));
        }

        let best = argmax(row);
        let predicted_type = context
            .codec
            .decode(best)
            .map_err(|err| InferenceError::Internal(err.to_string()))?
            .to_string();
        let probabilities: IndexMap<String, f64> = context
            .codec
            .classes()
            .iter()
            .zip(row.iter())
            .map(|(label, &p)| (label.clone(), f64::from(p) / total))
            .collect();
        let confidence = probabilities[best];
        Ok(Prediction {
            predicted_type,
            confidence,
            probabilities,
        })
    }
}

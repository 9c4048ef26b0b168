#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! MBTI inference: a read-only model context, an axum HTTP API with CORS, and a one-shot
//! serverless handler over the same prediction contract.

/// Model context, service state machine, and prediction.
#[path = "../service.rs"]
pub mod service;

/// HTTP router and server.
#[path = "../http.rs"]
pub mod http;

/// Serverless handler.
#[path = "../serverless.rs"]
pub mod serverless;

/// Service configuration.
#[path = "../config.rs"]
pub mod config;

pub use config::ServeConfig;
pub use http::{router, serve};
pub use serverless::{ServerlessHandler, ServerlessResponse};
pub use service::{
    HealthReport, InferenceError, InferenceService, ModelContext, ModelState, Prediction,
    PredictionRequest, TypesResponse,
};

#[cfg(test)]
mod tests {
    use super::*;
    use mbti_learning::{
        classifiers::{AlgorithmConfig, BoostingParams},
        dataset::synthetic_center,
        Dataset, PipelineConfig, TrainingPipeline,
    };
    use tempfile::tempdir;

    #[test]
    fn trained_artifact_serves_predictions() {
        let dir = tempdir().unwrap();
        let labels = ["ENFP", "ISTJ", "INTP"];
        let dataset = Dataset::synthetic(&labels, 100, 60, 42);
        let config = PipelineConfig {
            manifest_path: dir.path().join("data_split_indices.json"),
            artifact_path: dir.path().join("model.json"),
            model: AlgorithmConfig::GradientBoosting(BoostingParams {
                n_estimators: 40,
                ..BoostingParams::default()
            }),
            ..PipelineConfig::default()
        };
        let pipeline = TrainingPipeline::new(config);
        let first = pipeline.run_on(&dataset).unwrap();
        assert_eq!(first.manifest.sizes(), (210, 45, 45));
        let second = pipeline.run_on(&dataset).unwrap();
        assert!(second.manifest_reused);
        assert_eq!(second.manifest, first.manifest);

        let service = InferenceService::load(dir.path().join("model.json"));
        assert!(service.is_loaded());
        assert_eq!(service.types().types, ["ENFP", "INTP", "ISTJ"]);

        let handler = ServerlessHandler::new(service.clone());
        for (class, label) in labels.iter().enumerate() {
            let answers: Vec<f64> = synthetic_center(labels.len(), class, 60)
                .into_iter()
                .map(f64::from)
                .collect();
            let prediction = service.predict(&answers).unwrap();
            assert_eq!(prediction.predicted_type, *label);
            assert_eq!(prediction.probabilities.len(), 3);

            let body = serde_json::json!({ "answers": answers }).to_string();
            let response = handler.handle("POST", body.as_bytes());
            assert_eq!(response.status, 200);
            assert_eq!(response.body_json().unwrap()["predicted_type"], *label);
        }
    }
}

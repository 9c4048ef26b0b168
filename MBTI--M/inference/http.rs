//! axum surface of the inference service.

use std::any::Any;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::ServeConfig,
    service::{HealthReport, InferenceError, InferenceService, Prediction, TypesResponse},
};

/// Routes and the methods they accept, as printed at startup.
pub const ENDPOINTS: [(&str, &str, &str); 3] = [
    ("GET", "/health", "Health check"),
    ("POST", "/predict", "Predict personality type"),
    ("GET", "/types", "List all personality types"),
];

impl IntoResponse for InferenceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body())).into_response()
    }
}

async fn health(State(service): State<InferenceService>) -> Json<HealthReport> {
    Json(service.health())
}

async fn types(State(service): State<InferenceService>) -> Json<TypesResponse> {
    Json(service.types())
}

async fn predict(
    State(service): State<InferenceService>,
    body: Bytes,
) -> Result<Json<Prediction>, InferenceError> {
    let result = serde_json::from_slice::<Value>(&body)
        .map_err(|err| InferenceError::Validation(format!("Invalid JSON body: {err}")))
        .and_then(|value| service.predict_json(&value));
    match result {
        Ok(prediction) => Ok(Json(prediction)),
        Err(err) => {
            match &err {
                InferenceError::Validation(_) => tracing::debug!(error = %err, "rejected request"),
                InferenceError::Unavailable(_) | InferenceError::Internal(_) => {
                    tracing::warn!(error = %err, "prediction failed");
                }
            }
            Err(err)
        }
    }
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
        .into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "request handler panicked");
    InferenceError::Internal("Internal server error".into()).into_response()
}

/// Builds the router: every route under both `/` and `/api`, permissive CORS, panic
/// isolation, and request tracing.
pub fn router(service: InferenceService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/predict", post(predict))
        .route("/api/predict", post(predict))
        .route("/types", get(types))
        .route("/api/types", get(types))
        .fallback(not_found)
        .with_state(service)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Binds `config.bind_addr()` and serves until Ctrl+C.
pub async fn serve(config: &ServeConfig, service: InferenceService) -> Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        %addr,
        model_loaded = service.is_loaded(),
        artifact = %config.artifact_path.display(),
        "MBTI prediction API listening"
    );
    for (method, path, description) in ENDPOINTS {
        tracing::info!("  {method:<4} {path:<9} - {description} (also /api{path})");
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for Ctrl+C; serve until killed");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{tests::fixed_service, tests::PanickingClassifier, ModelContext};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use mbti_learning::LabelCodec;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn zeros(len: usize) -> Value {
        serde_json::json!({ "answers": vec![0; len] })
    }

    #[tokio::test]
    async fn health_and_types_on_both_prefixes() {
        let app = router(fixed_service(vec![0.2, 0.8]));
        for uri in ["/health", "/api/health"] {
            let (status, body) = call(app.clone(), Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, serde_json::json!({ "status": "healthy", "model_loaded": true }));
        }
        let (_, body) = call(app, Request::get("/api/types").body(Body::empty()).unwrap()).await;
        assert_eq!(body, serde_json::json!({ "types": ["T00", "T01"] }));
    }

    #[tokio::test]
    async fn predict_returns_distribution() {
        let app = router(fixed_service(vec![0.25, 0.75]));
        let (status, body) = call(app, post_json("/predict", &zeros(60))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predicted_type"], "T01");
        assert!((body["confidence"].as_f64().unwrap() - 0.75).abs() < 1e-6);
        assert_eq!(body["probabilities"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bad_requests_get_400_with_error_body() {
        let app = router(fixed_service(vec![0.5, 0.5]));
        for body in [zeros(59), zeros(61)] {
            let (status, body) = call(app.clone(), post_json("/api/predict", &body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].as_str().unwrap().starts_with("Expected 60 answers"));
        }
        let request = Request::post("/predict")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON body"));
    }

    #[tokio::test]
    async fn degraded_mode_answers_health_and_refuses_predict() {
        let app = router(InferenceService::failed("model artifact not found at model.json"));
        let (status, body) = call(app.clone(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_loaded"], false);
        let (status, body) = call(app.clone(), post_json("/predict", &zeros(60))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body["error"],
            "Model not loaded: model artifact not found at model.json"
        );
        let (_, body) = call(app, Request::get("/types").body(Body::empty()).unwrap()).await;
        assert_eq!(body["types"].as_array().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn panic_becomes_500_and_service_survives() {
        let codec = LabelCodec::fit(["A", "B"]).unwrap();
        let service = InferenceService::loaded(
            ModelContext::new(Arc::new(PanickingClassifier), codec).unwrap(),
        );
        let app = router(service);
        let (status, body) = call(app.clone(), post_json("/predict", &zeros(60))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
        let (status, _) = call(app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_preflight_and_headers() {
        let app = router(fixed_service(vec![0.5, 0.5]));
        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/predict")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(preflight).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key("access-control-allow-methods"));

        let request = Request::get("/health")
            .header("origin", "http://localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404_json() {
        let app = router(fixed_service(vec![0.5, 0.5]));
        let (status, body) = call(app, Request::get("/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
    }
}

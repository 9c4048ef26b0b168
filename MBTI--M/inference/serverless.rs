//! One-shot function form of the prediction API, for platforms that hand over a method and
//! a body and expect a status, headers, and a body back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::{InferenceError, InferenceService};

/// Response of a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerlessResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body; empty for preflight.
    pub body: String,
}

impl ServerlessResponse {
    fn new(status: u16, body: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Access-Control-Allow-Origin".into(), "*".into());
        if !body.is_empty() {
            headers.insert("Content-Type".into(), "application/json".into());
        }
        Self {
            status,
            headers,
            body,
        }
    }

    fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    fn error(err: &InferenceError) -> Self {
        Self::json(err.status_code(), &err.body())
    }

    /// Parses the body as JSON.
    pub fn body_json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

/// Answers `OPTIONS` preflight and `POST` predictions against one [`InferenceService`].
#[derive(Debug, Clone)]
pub struct ServerlessHandler {
    service: InferenceService,
}

impl ServerlessHandler {
    /// Wraps a service.
    #[must_use]
    pub const fn new(service: InferenceService) -> Self {
        Self { service }
    }

    /// Underlying service.
    #[must_use]
    pub const fn service(&self) -> &InferenceService {
        &self.service
    }

    /// Handles one request.
    #[must_use]
    pub fn handle(&self, method: &str, body: &[u8]) -> ServerlessResponse {
        match method.to_ascii_uppercase().as_str() {
            "OPTIONS" => {
                let mut response = ServerlessResponse::new(200, String::new());
                response
                    .headers
                    .insert("Access-Control-Allow-Methods".into(), "POST, OPTIONS".into());
                response
                    .headers
                    .insert("Access-Control-Allow-Headers".into(), "Content-Type".into());
                response
            }
            "POST" => {
                let result = serde_json::from_slice::<Value>(body)
                    .map_err(|err| InferenceError::Validation(format!("Invalid JSON body: {err}")))
                    .and_then(|value| self.service.predict_json(&value));
                match result {
                    Ok(prediction) => match serde_json::to_value(&prediction) {
                        Ok(value) => ServerlessResponse::json(200, &value),
                        Err(err) => ServerlessResponse::error(&InferenceError::Internal(format!(
                            "encoding prediction: {err}"
                        ))),
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "serverless prediction failed");
                        ServerlessResponse::error(&err)
                    }
                }
            }
            other => {
                let mut response = ServerlessResponse::json(
                    405,
                    &serde_json::json!({ "error": format!("Method {other} not allowed") }),
                );
                response
                    .headers
                    .insert("Allow".into(), "POST, OPTIONS".into());
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::fixed_service;

    fn answers(len: usize) -> Vec<u8> {
        serde_json::json!({ "answers": vec![1.5; len] })
            .to_string()
            .into_bytes()
    }

    #[test]
    fn preflight_advertises_cors() {
        let handler = ServerlessHandler::new(InferenceService::unloaded());
        let response = handler.handle("options", b"");
        assert_eq!(response.status, 200);
        assert_eq!(response.headers["Access-Control-Allow-Origin"], "*");
        assert_eq!(response.headers["Access-Control-Allow-Methods"], "POST, OPTIONS");
        assert_eq!(response.headers["Access-Control-Allow-Headers"], "Content-Type");
        assert!(response.body.is_empty());
    }

    #[test]
    fn post_predicts_with_cors_header() {
        let handler = ServerlessHandler::new(fixed_service(vec![0.9, 0.1]));
        let response = handler.handle("POST", &answers(60));
        assert_eq!(response.status, 200);
        assert_eq!(response.headers["Access-Control-Allow-Origin"], "*");
        let body = response.body_json().unwrap();
        assert_eq!(body["predicted_type"], "T00");
    }

    #[test]
    fn failures_use_real_status_codes() {
        let handler = ServerlessHandler::new(fixed_service(vec![0.9, 0.1]));
        let response = handler.handle("POST", &answers(59));
        assert_eq!(response.status, 400);
        assert_eq!(
            response.body_json().unwrap()["error"],
            "Expected 60 answers, got 59"
        );

        let degraded = ServerlessHandler::new(InferenceService::failed("missing artifact"));
        let response = degraded.handle("POST", &answers(60));
        assert_eq!(response.status, 503);
        assert_eq!(response.headers["Access-Control-Allow-Origin"], "*");

        let response = handler.handle("GET", b"");
        assert_eq!(response.status, 405);
        assert_eq!(response.headers["Allow"], "POST, OPTIONS");
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming the model artifact.
pub const MODEL_PATH_ENV: &str = "MBTI_MODEL_PATH";
/// Environment variable naming the listen port.
pub const PORT_ENV: &str = "PORT";

/// Where the HTTP service listens and which artifact it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Model artifact loaded at startup.
    pub artifact_path: PathBuf,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            artifact_path: PathBuf::from("model.json"),
        }
    }
}

impl ServeConfig {
    /// Defaults overridden by `MBTI_MODEL_PATH` and `PORT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = lookup(MODEL_PATH_ENV) {
            config.artifact_path = PathBuf::from(path);
        }
        if let Some(port) = lookup(PORT_ENV) {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("{PORT_ENV}={port} is not a valid port"))?;
        }
        Ok(config)
    }

    /// `host:port`.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

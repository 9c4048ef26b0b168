use std::{path::Path, sync::Arc};

use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel};

/// Structured logging sink shared by the split, training, and artifact stages.
#[derive(Debug, Clone)]
pub struct LearningTelemetry {
    module: String,
    logger: Arc<JsonLogger>,
}

impl LearningTelemetry {
    /// Wraps an existing logger; records are tagged with `module`.
    #[must_use]
    pub fn new(module: impl Into<String>, logger: Arc<JsonLogger>) -> Self {
        Self {
            module: module.into(),
            logger,
        }
    }

    /// Opens (or creates) a JSONL log at `path`.
    pub fn to_file(module: impl Into<String>, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(module, Arc::new(JsonLogger::new(path)?)))
    }

    /// Writes a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> anyhow::Result<()> {
        self.logger.record(&self.module, level, message, metadata)
    }

    /// Path of the underlying log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.logger.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn tags_records_with_module() {
        let dir = tempdir().unwrap();
        let telemetry = LearningTelemetry::to_file("learning", dir.path().join("job.jsonl")).unwrap();
        telemetry
            .log(LogLevel::Info, "training_start", json!({ "rows": 3 }))
            .unwrap();
        let records = shared_logging::read_records(telemetry.path()).unwrap();
        assert_eq!(records[0].module, "learning");
        assert_eq!(records[0].message, "training_start");
    }
}

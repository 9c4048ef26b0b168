#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured logging shared by the MBTI training pipeline, CLI, and inference service.
//!
//! Offline jobs append JSON lines through [`JsonLogger`]; long-running processes install a
//! `tracing` subscriber through [`init_tracing`]. Records written to a [`JsonLogger`] are
//! mirrored to `tracing` so both sinks see the same stream.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Severity of a job or service event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress, such as `split_created` or `artifact_saved`.
    Info,
    /// Recoverable trouble.
    Warn,
    /// Failed job or request.
    Error,
}

/// One line of a JSONL job log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// UTC time the record was built.
    pub timestamp: DateTime<Utc>,
    /// Emitting component (`learning`, `trn`, ...).
    pub module: String,
    /// Record severity.
    pub level: LogLevel,
    /// Event name.
    pub message: String,
    /// Event fields; omitted from the line when empty.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl LogRecord {
    /// Record stamped with the current time and no metadata.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    /// Attaches metadata; non-object values are stored under a `data` key.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        match metadata {
            Value::Object(map) => self.metadata = map,
            Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }

    fn mirror_to_tracing(&self) {
        let metadata = Value::Object(self.metadata.clone());
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(module = %self.module, %metadata, "{}", self.message);
            }
            LogLevel::Info => tracing::info!(module = %self.module, %metadata, "{}", self.message),
            LogLevel::Warn => tracing::warn!(module = %self.module, %metadata, "{}", self.message),
            LogLevel::Error => {
                tracing::error!(module = %self.module, %metadata, "{}", self.message);
            }
        }
    }
}

/// Append-only JSONL sink; safe to share between threads.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as JSON line and mirrors it to `tracing`.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        record.mirror_to_tracing();
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Builds and writes a record in one call.
    pub fn record(
        &self,
        module: &str,
        level: LogLevel,
        message: &str,
        metadata: Value,
    ) -> Result<()> {
        self.log(&LogRecord::new(module, level, message).with_metadata(metadata))
    }

    /// File the records go to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every record from a JSONL log file, skipping blank lines.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening log file {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).context("parsing log record")?);
    }
    Ok(records)
}

/// Returns `<base>/YYYY/MM/DD/<prefix>-<timestamp>.log.jsonl`, creating the dated directory.
pub fn dated_log_path(base: &Path, prefix: &str) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir).with_context(|| format!("creating log dir {}", dir.display()))?;
    Ok(dir.join(format!(
        "{prefix}-{}.log.jsonl",
        Utc::now().format("%Y%m%d-%H%M%S")
    )))
}

/// Installs a global `tracing` fmt subscriber.
///
/// `RUST_LOG` wins over `default_directive` when set. Calling this twice is harmless; the
/// second install is ignored.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("test.log")).unwrap();
        logger
            .log(&LogRecord::new("module", LogLevel::Info, "hello"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"hello\""));
        assert!(!content.contains("metadata"));
    }

    #[test]
    fn records_round_trip_with_metadata() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("nested/job.log.jsonl")).unwrap();
        logger
            .record("trn", LogLevel::Warn, "split_reused", json!({ "seed": 42 }))
            .unwrap();
        logger
            .record("trn", LogLevel::Info, "scalar", json!(7))
            .unwrap();
        let records = read_records(logger.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].metadata["seed"], json!(42));
        assert_eq!(records[1].metadata["data"], json!(7));
    }

    #[test]
    fn dated_path_lives_under_base() {
        let dir = tempdir().unwrap();
        let path = dated_log_path(dir.path(), "job").unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.parent().unwrap().is_dir());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("job-") && name.ends_with(".log.jsonl"));
    }
}

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mbti_inference::{serve, InferenceService, ServeConfig, ServerlessHandler};
use mbti_learning::{
    artifact, evaluate, AlgorithmConfig, Dataset, LearningTelemetry, PipelineConfig,
    SplitManifest, StratifiedSplitter, TrainingPipeline,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::{dated_log_path, init_tracing, LogLevel};
use tokio::runtime::Runtime;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "trn", version, about = "MBTI classifier training and serving")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Draws the train/validation/test split, or reuses the saved one.
    Split(PipelineArgs),
    /// Splits, trains, and writes the model artifact.
    Train(TrainArgs),
    /// Scores a saved artifact on a partition of the saved split.
    Evaluate(EvaluateArgs),
    /// Predicts one respondent's type from the command line.
    Predict(PredictArgs),
    /// Runs the HTTP prediction API.
    Serve(ServeArgs),
    /// Runs one serverless invocation with the request body read from stdin.
    Invoke(InvokeArgs),
    /// Lists the types a model can predict.
    Types {
        /// Artifact to read labels from; canonical MBTI codes when omitted.
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Lists most recent jobs.
    Jobs {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "logs/jobs/index.jsonl")]
        index: PathBuf,
    },
    /// Shows status for a given job id.
    Status {
        job_id: String,
        #[arg(long, default_value = "logs/jobs/index.jsonl")]
        index: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct PipelineArgs {
    /// Pipeline config (JSON, or TOML by extension).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Survey CSV.
    #[arg(long)]
    dataset: Option<PathBuf>,
    /// Split manifest path.
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Split seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Directory receiving train/validation/test CSVs.
    #[arg(long)]
    export_dir: Option<PathBuf>,
    /// Root of the dated job logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl PipelineArgs {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(dataset) = &self.dataset {
            config.dataset.clone_from(dataset);
        }
        if let Some(manifest) = &self.manifest {
            config.manifest_path.clone_from(manifest);
        }
        if let Some(seed) = self.seed {
            config.split.seed = seed;
        }
        if let Some(dir) = &self.export_dir {
            config.export_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir.clone_from(dir);
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Algorithm with default hyperparameters; overrides the config's model section.
    #[arg(long)]
    algorithm: Option<String>,
    /// Artifact output path.
    #[arg(long)]
    artifact: Option<PathBuf>,
    /// JSON report output path.
    #[arg(long)]
    report: Option<PathBuf>,
}

impl TrainArgs {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = self.pipeline.resolve()?;
        if let Some(name) = &self.algorithm {
            config.model = AlgorithmConfig::from_name(name).with_context(|| {
                format!(
                    "unknown algorithm {name}; expected one of {}",
                    AlgorithmConfig::NAMES.join(", ")
                )
            })?;
        }
        if let Some(path) = &self.artifact {
            config.artifact_path.clone_from(path);
        }
        if let Some(path) = &self.report {
            config.report_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Partition {
    Train,
    Validation,
    Test,
}

impl Partition {
    fn ids(self, manifest: &SplitManifest) -> &[usize] {
        match self {
            Self::Train => &manifest.train_ids,
            Self::Validation => &manifest.validation_ids,
            Self::Test => &manifest.test_ids,
        }
    }
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Artifact to score; defaults to the config's artifact path.
    #[arg(long)]
    artifact: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Partition::Test)]
    partition: Partition,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[arg(long, default_value = "model.json")]
    artifact: PathBuf,
    /// Comma-separated answers in question order.
    #[arg(long, conflicts_with = "input")]
    answers: Option<String>,
    /// JSON file holding `{"answers": [...]}`; `-` reads stdin.
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address; defaults to 0.0.0.0.
    #[arg(long)]
    host: Option<String>,
    /// Listen port; defaults to $PORT or 5000.
    #[arg(long)]
    port: Option<u16>,
    /// Model artifact; defaults to $MBTI_MODEL_PATH or model.json.
    #[arg(long)]
    artifact: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InvokeArgs {
    #[arg(long, default_value = "POST")]
    method: String,
    /// Model artifact; defaults to $MBTI_MODEL_PATH or model.json.
    #[arg(long)]
    artifact: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct JobIndexEntry {
    job_id: String,
    kind: String,
    submitted_at: DateTime<Utc>,
    log_path: PathBuf,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<Value>,
}

impl JobIndexEntry {
    fn new(kind: &str, log_path: PathBuf) -> Self {
        Self {
            job_id: format!("job-{}", Uuid::new_v4()),
            kind: kind.into(),
            submitted_at: Utc::now(),
            log_path,
            status: "running".into(),
            summary: None,
        }
    }
}

fn main() -> Result<()> {
    init_tracing("info");
    let cli = Cli::parse();
    match cli.command {
        Commands::Split(args) => {
            let config = args.resolve()?;
            run_job(&config, "split", |telemetry| handle_split(&config, telemetry))
        }
        Commands::Train(args) => {
            let config = args.resolve()?;
            run_job(&config, "train", |telemetry| handle_train(&config, telemetry))
        }
        Commands::Evaluate(args) => handle_evaluate(&args),
        Commands::Predict(args) => handle_predict(&args),
        Commands::Serve(args) => handle_serve(args),
        Commands::Invoke(args) => handle_invoke(&args),
        Commands::Types { artifact } => {
            let service = artifact.map_or_else(InferenceService::unloaded, InferenceService::load);
            println!("{}", serde_json::to_string_pretty(&service.types())?);
            Ok(())
        }
        Commands::Jobs { limit, index } => {
            let entries = read_index(&index)?;
            for entry in entries.into_iter().rev().take(limit) {
                println!(
                    "{} | {} | {} | {}",
                    entry.job_id, entry.kind, entry.status, entry.submitted_at
                );
            }
            Ok(())
        }
        Commands::Status { job_id, index } => {
            let entries = read_index(&index)?;
            if let Some(entry) = entries.into_iter().find(|e| e.job_id == job_id) {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("job {job_id} not found");
            }
            Ok(())
        }
    }
}

/// Runs `job` with a dated JSONL log and tracks it in `<log_dir>/jobs/index.jsonl`.
fn run_job<F>(config: &PipelineConfig, kind: &str, job: F) -> Result<()>
where
    F: FnOnce(&LearningTelemetry) -> Result<Value>,
{
    let log_path = dated_log_path(&config.log_dir, "job")?;
    let telemetry = LearningTelemetry::to_file("trn", &log_path)?;
    let index = config.log_dir.join("jobs").join("index.jsonl");
    let mut entry = JobIndexEntry::new(kind, log_path);
    append_index(&index, &entry)?;
    let _ = telemetry.log(
        LogLevel::Info,
        "job_started",
        json!({ "job_id": entry.job_id, "kind": kind }),
    );

    match job(&telemetry) {
        Ok(summary) => {
            let _ = telemetry.log(
                LogLevel::Info,
                "job_completed",
                json!({ "job_id": entry.job_id, "summary": summary }),
            );
            entry.status = "completed".into();
            entry.summary = Some(summary);
            update_entry(&index, &entry)?;
            tracing::info!(job_id = %entry.job_id, log = %entry.log_path.display(), "job completed");
            Ok(())
        }
        Err(err) => {
            let _ = telemetry.log(
                LogLevel::Error,
                "job_failed",
                json!({ "job_id": entry.job_id, "error": format!("{err:#}") }),
            );
            entry.status = "failed".into();
            update_entry(&index, &entry)?;
            Err(err)
        }
    }
}

fn handle_split(config: &PipelineConfig, telemetry: &LearningTelemetry) -> Result<Value> {
    let dataset = Dataset::from_csv(&config.dataset, &config.schema)
        .with_context(|| format!("loading dataset {}", config.dataset.display()))?;
    let (manifest, reused) = StratifiedSplitter::new(config.split)
        .split_or_load(&dataset, &config.manifest_path, Some(telemetry))
        .context("splitting dataset")?;
    if let Some(dir) = &config.export_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating export dir {}", dir.display()))?;
        for (name, partition) in [
            ("train", Partition::Train),
            ("validation", Partition::Validation),
            ("test", Partition::Test),
        ] {
            let path = dir.join(format!("{name}.csv"));
            dataset
                .write_csv(&path, partition.ids(&manifest), &config.schema.label_column)
                .with_context(|| format!("exporting {}", path.display()))?;
        }
    }
    let (train, validation, test) = manifest.sizes();
    println!(
        "{} split (seed {}): train={train} validation={validation} test={test} -> {}",
        if reused { "reused" } else { "created" },
        manifest.seed,
        config.manifest_path.display()
    );
    Ok(json!({
        "manifest": config.manifest_path,
        "reused": reused,
        "train": train,
        "validation": validation,
        "test": test,
    }))
}

fn handle_train(config: &PipelineConfig, telemetry: &LearningTelemetry) -> Result<Value> {
    let run = TrainingPipeline::new(config.clone())
        .with_telemetry(telemetry.clone())
        .run()?;
    if let Some(report) = run.report() {
        println!("{}", report.summary());
        println!("{}", report.test_report.render());
    }
    println!(
        "artifact {} ({}) -> {}",
        run.artifact.id,
        run.artifact.algorithm,
        run.artifact_path.display()
    );
    Ok(json!({
        "artifact": run.artifact_path,
        "artifact_id": run.artifact.id,
        "algorithm": run.artifact.algorithm,
        "manifest_reused": run.manifest_reused,
        "test_accuracy": run.report().map(|report| report.test_accuracy),
    }))
}

fn handle_evaluate(args: &EvaluateArgs) -> Result<()> {
    let config = args.pipeline.resolve()?;
    let artifact_path = args.artifact.as_ref().unwrap_or(&config.artifact_path);
    let artifact = artifact::load(artifact_path)?;
    let dataset = Dataset::from_csv(&config.dataset, &config.schema)
        .with_context(|| format!("loading dataset {}", config.dataset.display()))?;
    anyhow::ensure!(
        config.manifest_path.exists(),
        "split manifest {} not found; run `trn split` first",
        config.manifest_path.display()
    );
    let manifest = SplitManifest::load(&config.manifest_path)?;
    manifest.verify(dataset.len())?;
    let evaluation = evaluate(
        &artifact.model,
        &artifact.codec,
        &dataset,
        args.partition.ids(&manifest),
    )?;
    println!(
        "{:?}: rows={} accuracy={:.4} log_loss={:.4}",
        args.partition, evaluation.rows, evaluation.accuracy, evaluation.log_loss
    );
    println!("{}", evaluation.report.render());
    Ok(())
}

fn handle_predict(args: &PredictArgs) -> Result<()> {
    let body = match (&args.answers, &args.input) {
        (Some(answers), _) => json!({ "answers": parse_answers(answers)? }),
        (None, Some(path)) if path == Path::new("-") => {
            serde_json::from_str(&read_stdin()?).context("parsing request from stdin")?
        }
        (None, Some(path)) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        (None, None) => bail!("pass --answers or --input"),
    };
    let service = InferenceService::load(&args.artifact);
    let prediction = service.predict_json(&body)?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

fn handle_serve(args: ServeArgs) -> Result<()> {
    let mut config = ServeConfig::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(artifact) = args.artifact {
        config.artifact_path = artifact;
    }
    let service = InferenceService::load(&config.artifact_path);
    let runtime = Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(serve(&config, service))
}

fn handle_invoke(args: &InvokeArgs) -> Result<()> {
    let mut config = ServeConfig::from_env()?;
    if let Some(artifact) = &args.artifact {
        config.artifact_path.clone_from(artifact);
    }
    let handler = ServerlessHandler::new(InferenceService::load(&config.artifact_path));
    let body = read_stdin()?;
    let response = handler.handle(&args.method, body.as_bytes());
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn parse_answers(raw: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(idx, part)| {
            part.parse::<f64>()
                .with_context(|| format!("answer {idx} ({part}) is not a number"))
        })
        .collect()
}

fn read_stdin() -> Result<String> {
    let mut body = String::new();
    io::stdin()
        .read_to_string(&mut body)
        .context("reading stdin")?;
    Ok(body)
}

fn append_index(path: &Path, entry: &JobIndexEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening job index {}", path.display()))?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_index(path: &Path) -> Result<Vec<JobIndexEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JobIndexEntry = serde_json::from_str(&line)?;
        entries.push(entry);
    }
    Ok(entries)
}

fn update_entry(path: &Path, updated: &JobIndexEntry) -> Result<()> {
    let mut entries = read_index(path)?;
    let mut changed = false;
    for entry in &mut entries {
        if entry.job_id == updated.job_id {
            *entry = updated.clone();
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }
    let mut file = File::create(path)?;
    for entry in entries {
        serde_json::to_writer(&mut file, &entry)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn answers_parse_with_whitespace() {
        assert_eq!(parse_answers("1, -2.5,0 ,3").unwrap(), vec![1.0, -2.5, 0.0, 3.0]);
        assert!(parse_answers("1,x").is_err());
    }

    #[test]
    fn failed_job_is_recorded_in_index() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            log_dir: dir.path().join("logs"),
            ..PipelineConfig::default()
        };
        let err = run_job(&config, "train", |_| bail!("boom")).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        run_job(&config, "split", |_| Ok(json!({ "train": 7 }))).unwrap();

        let entries = read_index(&dir.path().join("logs/jobs/index.jsonl")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "failed");
        assert_eq!(entries[1].status, "completed");
        assert_eq!(entries[1].summary.as_ref().unwrap()["train"], 7);
        let records = shared_logging::read_records(&entries[0].log_path).unwrap();
        assert!(records.iter().any(|record| record.message == "job_failed"));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"dataset": "survey.csv", "split": {"seed": 1}}"#).unwrap();
        let args = TrainArgs {
            pipeline: PipelineArgs {
                config: Some(path),
                seed: Some(9),
                ..PipelineArgs::default()
            },
            algorithm: Some("random_forest".into()),
            artifact: Some(dir.path().join("rf.json")),
            report: None,
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.dataset, dir.path().join("survey.csv"));
        assert_eq!(config.split.seed, 9);
        assert_eq!(config.model.name(), "random_forest");
        assert_eq!(config.artifact_path, dir.path().join("rf.json"));

        let bad = TrainArgs {
            pipeline: PipelineArgs::default(),
            algorithm: Some("svm".into()),
            artifact: None,
            report: None,
        };
        assert!(bad.resolve().unwrap_err().to_string().contains("unknown algorithm svm"));
    }
}

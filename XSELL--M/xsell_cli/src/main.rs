use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Local, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;
use uuid::Uuid;
use xsell_pipeline::{
    progress, FsObjectStore, JsonlDocumentStore, PipelineConfig, PipelineError, PipelineRun,
    PipelineTelemetry, PredictionPipeline, PredictionResponse, TrainingPipeline, VehicleData,
};

const DEFAULT_CONFIG: &str = "XSELL--M/pipeline/config/pipeline.toml";

#[derive(Parser, Debug)]
#[command(name = "xsell", version, about = "Vehicle insurance cross-sell pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the training pipeline once.
    Train(TrainArgs),
    /// Predicts the response of one customer record.
    Predict(PredictArgs),
    /// Inspects past training runs.
    Runs {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RunsCommand {
    /// Lists most recent runs.
    List {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Shows the manifest entry of one run.
    Status { run_id: Uuid },
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Prints progress lines while the pipeline runs.
    #[arg(long)]
    stream: bool,
    #[arg(long)]
    event_log: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PredictArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Record field as NAME=VALUE; repeat for every field.
    #[arg(long = "field", value_name = "NAME=VALUE", required = true)]
    fields: Vec<String>,
    #[arg(long)]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct RunManifestEntry {
    run_id: Uuid,
    submitted_at: DateTime<Utc>,
    config: PathBuf,
    log_path: PathBuf,
    status: String,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    artifact_dir: Option<PathBuf>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

impl RunManifestEntry {
    fn new(run_id: Uuid, config: PathBuf, log_path: PathBuf) -> Self {
        Self {
            run_id,
            submitted_at: Utc::now(),
            config,
            log_path,
            status: "pending".into(),
            outcome: None,
            artifact_dir: None,
            error: None,
            finished_at: None,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => handle_train(&args),
        Commands::Predict(args) => handle_predict(&args),
        Commands::Runs { config, command } => {
            let config = PipelineConfig::load(&config)?;
            let manifest = manifest_path(&config);
            match command {
                RunsCommand::List { limit } => {
                    let entries = read_manifest(&manifest)?;
                    for entry in entries.into_iter().rev().take(limit) {
                        println!(
                            "{} | {} | {} | {}",
                            entry.run_id,
                            entry.status,
                            entry.outcome.as_deref().unwrap_or("-"),
                            entry.submitted_at
                        );
                    }
                    Ok(())
                }
                RunsCommand::Status { run_id } => {
                    let entries = read_manifest(&manifest)?;
                    if let Some(entry) = entries.into_iter().find(|e| e.run_id == run_id) {
                        println!("{}", serde_json::to_string_pretty(&entry)?);
                    } else {
                        println!("run {run_id} not found");
                    }
                    Ok(())
                }
            }
        }
    }
}

fn handle_train(args: &TrainArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let manifest = manifest_path(&config);
    let run_id = Uuid::new_v4();
    let log_path = compute_log_path(&config.log_dir)?;

    let mut builder = PipelineTelemetry::builder("xsell")
        .run_id(run_id)
        .log_path(&log_path);
    if let Some(path) = &args.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    let telemetry = builder.build()?;

    let mut entry = RunManifestEntry::new(run_id, args.config.clone(), log_path);
    entry.status = "running".into();
    append_manifest(&manifest, &entry)?;
    telemetry.log(
        LogLevel::Info,
        "training run submitted",
        json!({ "run_id": run_id, "log_path": entry.log_path }),
    )?;

    let documents = Arc::new(JsonlDocumentStore::new(&config.storage.document_root));
    let objects = Arc::new(FsObjectStore::new(&config.storage.object_root));
    let join_timeout = config.progress.join_timeout();
    let pipeline = TrainingPipeline::new(config, documents, objects, telemetry.clone());

    let result = if args.stream {
        stream_training(pipeline, join_timeout)
    } else {
        pipeline.run().map_err(anyhow::Error::from)
    };

    match result {
        Ok(run) => {
            update_entry(&manifest, run_id, |entry| {
                entry.status = "completed".into();
                entry.outcome = Some(run.outcome.label().into());
                entry.artifact_dir = Some(run.artifact_dir.clone());
                entry.finished_at = Some(run.finished_at);
            })?;
            if !args.stream {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "status": "success",
                        "run_id": run.run_id,
                        "outcome": run.outcome,
                        "artifact_dir": run.artifact_dir,
                    }))?
                );
            }
            Ok(())
        }
        Err(err) => {
            update_entry(&manifest, run_id, |entry| {
                entry.status = "failed".into();
                entry.error = Some(format!("{err:#}"));
                entry.finished_at = Some(Utc::now());
            })?;
            telemetry.log(
                LogLevel::Error,
                "training run failed",
                json!({ "run_id": run_id, "error": format!("{err:#}") }),
            )?;
            Err(err)
        }
    }
}

fn stream_training(pipeline: TrainingPipeline, join_timeout: Duration) -> Result<PipelineRun> {
    let runtime = Runtime::new()?;
    let joined = runtime.block_on(async {
        let mut stream = progress::spawn_training(pipeline, join_timeout);
        while let Some(message) = stream.next().await {
            println!("{}", message.render());
        }
        stream.finish().await
    })?;
    match joined {
        Some(result) => result.map_err(anyhow::Error::from),
        None => Err(PipelineError::Worker(format!(
            "training worker still running after {join_timeout:?}"
        ))
        .into()),
    }
}

fn handle_predict(args: &PredictArgs) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let fields = args
        .fields
        .iter()
        .map(|raw| parse_field(raw))
        .collect::<Result<Vec<_>>>()?;
    let data = VehicleData::from_fields(fields)?;
    let telemetry = PipelineTelemetry::builder("xsell")
        .log_path(compute_log_path(&config.log_dir)?)
        .build()?;
    let objects = Arc::new(FsObjectStore::new(&config.storage.object_root));
    let pipeline = Arc::new(PredictionPipeline::from_config(&config, objects, telemetry));

    let response = if args.stream {
        let runtime = Runtime::new()?;
        let joined = runtime.block_on(async {
            let mut stream =
                progress::spawn_prediction(pipeline, data, config.progress.join_timeout());
            while let Some(message) = stream.next().await {
                println!("{}", message.render());
            }
            stream.finish().await
        })?;
        joined.context("prediction worker did not finish in time")?
    } else {
        let response = match pipeline.predict(&data) {
            Ok(prediction) => PredictionResponse::success(prediction),
            Err(err) => PredictionResponse::failure(format!("{err:#}")),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": response.status,
                "prediction": response.prediction,
                "label": response.label(),
                "error": response.error,
            }))?
        );
        response
    };
    if let Some(error) = response.error {
        bail!(error);
    }
    Ok(())
}

fn parse_field(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("field name missing in {raw:?}");
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

fn manifest_path(config: &PipelineConfig) -> PathBuf {
    config.log_dir.join("runs").join("index.jsonl")
}

fn append_manifest(path: &Path, entry: &RunManifestEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening manifest {}", path.display()))?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Vec<RunManifestEntry>> {
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
        let entry: RunManifestEntry = serde_json::from_str(&line)
            .with_context(|| format!("corrupt manifest line in {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn update_entry(
    path: &Path,
    run_id: Uuid,
    update: impl FnOnce(&mut RunManifestEntry),
) -> Result<()> {
    let mut entries = read_manifest(path)?;
    let Some(entry) = entries.iter_mut().find(|entry| entry.run_id == run_id) else {
        return Ok(());
    };
    update(entry);
    let mut file = File::create(path)?;
    for entry in entries {
        serde_json::to_writer(&mut file, &entry)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn compute_log_path(base: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!(
        "run-{}.log.jsonl",
        Utc::now().format("%Y%m%d-%H%M%S")
    )))
}

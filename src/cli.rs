use crate::{
    config::Config,
    engine::{docker::DockerEngine, Engine},
    pipeline::BatchOrchestrator,
    progress::{FileProgressStore, ProgressStore},
    report::{index_path, TaskReport},
    task::{InputDoc, TaskId, TaskState},
    util::ensure_dir,
    weigh::{weigh_file, PdfPageCounter},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "ocr-batch")]
#[command(about = "Batch OCR orchestrator (external engine per document + weighted progress)")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./ocr-batch.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the engine program and image are usable.
    Doctor {},
    /// Print the page weight of each input.
    Weigh {
        #[arg(long, required = true)]
        input: Vec<PathBuf>,
    },
    /// Convert a batch of documents and wait for the result.
    Run {
        #[arg(long, required = true)]
        input: Vec<PathBuf>,
        /// Engine language code; repeat for several (first 3 are used).
        #[arg(long = "lang")]
        languages: Vec<String>,
    },
    /// Show progress and result of a task, possibly from another process.
    Status {
        #[arg(long)]
        task_id: String,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Weigh { input } => weigh(input),
        Command::Run { input, languages } => run(&cfg, input, languages),
        Command::Status { task_id } => status(&cfg, task_id),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["ocr-batch.toml", "ocr-batch.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn doctor(cfg: &Config) -> Result<()> {
    let engine = DockerEngine::new(cfg)?;
    let diag = engine.doctor()?;
    println!("{}", serde_json::to_string_pretty(&diag)?);
    Ok(())
}

fn weigh(inputs: &[PathBuf]) -> Result<()> {
    let weights: Vec<_> = inputs
        .iter()
        .map(|p| {
            serde_json::json!({
                "input": p,
                "weight": weigh_file(&PdfPageCounter, p),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&weights)?);
    Ok(())
}

fn run(cfg: &Config, inputs: &[PathBuf], languages: &[String]) -> Result<()> {
    let mut docs = Vec::with_capacity(inputs.len());
    for input in inputs {
        validate_input(cfg, input)?;
        let bytes =
            std::fs::read(input).with_context(|| format!("reading input: {}", input.display()))?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        docs.push(InputDoc::new(name, bytes));
    }

    if cfg.debug.dump_effective_config {
        let dir = PathBuf::from(&cfg.paths.log_dir);
        ensure_dir(&dir)?;
        let raw = toml::to_string(cfg).unwrap_or_default();
        std::fs::write(dir.join("effective-config.toml"), raw)?;
    }

    let engine = DockerEngine::new(cfg)?;
    let store = FileProgressStore::new(&cfg.paths.progress_dir)?;
    let orchestrator =
        BatchOrchestrator::new(cfg, Arc::new(engine), Arc::new(PdfPageCounter), Arc::new(store));

    let handle = orchestrator.submit(docs, languages)?;
    let task_id = handle.id();
    info!("task_id={task_id} submitted");

    let poll = Duration::from_millis(cfg.global.poll_interval_ms.max(10));
    let mut last = None;
    while !handle.is_finished() {
        let pct = orchestrator.progress(&task_id);
        if last != Some(pct) {
            info!("task_id={task_id} progress={pct}%");
            last = Some(pct);
        }
        std::thread::sleep(poll);
    }

    match handle.wait() {
        Ok(report) => {
            if report.is_partial_failure() {
                warn!(
                    "task_id={task_id} finished with failed inputs: {}",
                    report.failed_inputs().join(", ")
                );
            }
            if cfg.global.print_summary {
                let result_path = report
                    .result_file
                    .as_deref()
                    .and_then(|name| orchestrator.resolve_artifact(name));
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "task_id": task_id,
                        "state": report.state.label(),
                        "progress": orchestrator.progress(&task_id),
                        "result_file": report.result_file,
                        "result_path": result_path,
                        "failed": report.failed_inputs(),
                    }))?
                );
            }
            Ok(())
        }
        Err(err) => {
            if cfg.global.print_summary {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "task_id": task_id,
                        "state": "failed",
                        "progress": orchestrator.progress(&task_id),
                        "error": &err,
                    }))?
                );
            }
            Err(anyhow::Error::new(err).context(format!("task {task_id} failed")))
        }
    }
}

fn status(cfg: &Config, task_id: &str) -> Result<()> {
    let id: TaskId = task_id
        .parse()
        .with_context(|| format!("invalid task id: {task_id}"))?;
    let store = FileProgressStore::new(&cfg.paths.progress_dir)?;
    let progress = store.get(&id);

    let index = index_path(cfg, &id);
    let report = if index.exists() {
        Some(TaskReport::load(&index)?)
    } else {
        None
    };

    let state = report.as_ref().map(|r| r.state.label());
    let result_file = report
        .as_ref()
        .filter(|r| r.state == TaskState::Done)
        .and_then(|r| r.result_file.clone());

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "task_id": id,
            "progress": progress,
            "state": state,
            "result_file": result_file,
        }))?
    );
    Ok(())
}

fn validate_input(cfg: &Config, input: &Path) -> Result<()> {
    let input_str = input.display().to_string();

    if cfg.security.reject_url_inputs && looks_like_url(&input_str) {
        return Err(anyhow!("URL inputs are disabled: {input_str}"));
    }

    if !input.is_file() {
        return Err(anyhow!("input does not exist: {}", input.display()));
    }

    Ok(())
}

fn looks_like_url(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    Some(PathBuf::from(&cfg.paths.log_dir).join("ocr-batch.log"))
}

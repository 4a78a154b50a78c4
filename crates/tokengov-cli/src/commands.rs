//! Subcommand handlers.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokengov_core::{
    concatenate_sections, ChunkOptions, ChunkResult, Chunker, ContextCompressor, GovernorConfig,
    Priority,
};
use tokengov_runtime::{
    cancellation, CheckpointStore, Job, JobRunner, JsonlCheckpointStore, ProgressEvent, RunStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands, ConfigCommands};
use crate::mapper::ExtractiveMapper;

pub async fn dispatch(cli: Cli) -> Result<()> {
    if let Commands::Config {
        command: ConfigCommands::Validate { file },
    } = &cli.command
    {
        return validate_config(file);
    }

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Split {
            file,
            target_tokens,
            overlap_tokens,
            json,
        } => {
            let options = ChunkOptions::new(
                target_tokens.unwrap_or(config.chunking.target_tokens),
                overlap_tokens.unwrap_or(config.chunking.overlap_tokens),
            );
            split(&file, options, json)
        }
        Commands::Compress {
            file,
            query,
            max_tokens,
            metrics_only,
        } => compress(&config, &file, &query, max_tokens, metrics_only),
        Commands::Run {
            file,
            job_id,
            workers,
            priority,
            sentences,
            focus,
            checkpoint_dir,
            timeout,
            output,
        } => {
            let mut config = config;
            if let Some(dir) = checkpoint_dir {
                config.checkpoint.storage_path = dir;
            }
            let options = RunOptions {
                job_id,
                workers,
                priority,
                sentences,
                focus,
                timeout,
                output,
            };
            run(config, &file, options).await
        }
        Commands::Status {
            job_id,
            resumable,
            checkpoint_dir,
        } => {
            let dir = checkpoint_dir.unwrap_or_else(|| config.checkpoint.storage_path.clone());
            let interval = config.checkpoint.interval_chunks;
            match job_id {
                Some(job_id) => status(&dir, interval, &job_id).await,
                None => list_jobs(&dir, interval, resumable).await,
            }
        }
        Commands::Clean {
            job_id,
            checkpoint_dir,
        } => {
            let dir = checkpoint_dir.unwrap_or_else(|| config.checkpoint.storage_path.clone());
            clean(&dir, config.checkpoint.interval_chunks, &job_id).await
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Commands::Config {
            command: ConfigCommands::Validate { file },
        } => validate_config(&file),
    }
}

fn load_config(path: Option<&Path>) -> Result<GovernorConfig> {
    match path {
        Some(path) => GovernorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(GovernorConfig::default()),
    }
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn validate_config(file: &Path) -> Result<()> {
    let config = GovernorConfig::from_file(file)
        .with_context(|| format!("{} is not a valid configuration", file.display()))?;
    println!(
        "{} is valid ({} models: {})",
        file.display(),
        config.models.len(),
        config.model_names().join(", ")
    );
    Ok(())
}

fn split(file: &Path, options: ChunkOptions, json: bool) -> Result<()> {
    if options.target_tokens == 0 || options.overlap_tokens >= options.target_tokens {
        bail!(
            "overlap ({}) must be smaller than a non-zero target ({})",
            options.overlap_tokens,
            options.target_tokens
        );
    }

    let document = read_document(file)?;
    let chunks = Chunker::new(options).split(&document);
    info!(file = %file.display(), chunks = chunks.len(), "Document split");

    if json {
        for chunk in &chunks {
            println!("{}", serde_json::to_string(chunk)?);
        }
        return Ok(());
    }

    println!("{:>5} {:>7} {:>10} {:>10}  preview", "id", "tokens", "start", "end");
    for chunk in &chunks {
        let preview: String = chunk.text.chars().take(48).collect();
        println!(
            "{:>5} {:>7} {:>10} {:>10}  {}",
            chunk.id,
            chunk.token_count,
            chunk.start,
            chunk.end,
            preview.replace('\n', " ")
        );
    }
    Ok(())
}

fn compress(
    config: &GovernorConfig,
    file: &Path,
    query: &str,
    max_tokens: u32,
    metrics_only: bool,
) -> Result<()> {
    let document = read_document(file)?;
    let chunks = Chunker::new(config.chunking).split(&document);
    let compression = ContextCompressor::new(config.compressor.clone()).compress(query, &chunks, max_tokens);

    let metrics = &compression.metrics;
    info!(
        candidates = metrics.candidates,
        selected = metrics.selected,
        selected_tokens = metrics.selected_tokens,
        ratio = metrics.compression_ratio,
        "Context compressed"
    );

    if metrics_only {
        println!("{}", serde_json::to_string_pretty(metrics)?);
    } else {
        println!("{}", compression.render("\n\n"));
    }
    Ok(())
}

struct RunOptions {
    job_id: String,
    workers: Option<usize>,
    priority: Option<Priority>,
    sentences: usize,
    focus: Option<String>,
    timeout: Option<Duration>,
    output: Option<PathBuf>,
}

async fn run(config: GovernorConfig, file: &Path, options: RunOptions) -> Result<()> {
    let document = read_document(file)?;
    let store = JsonlCheckpointStore::from_config(&config.checkpoint)
        .await
        .context("Failed to open checkpoint directory")?;

    let mut job = Job::from_config(options.job_id, &config);
    if let Some(workers) = options.workers {
        job = job.with_worker_count(workers);
    }
    if let Some(priority) = options.priority {
        job = job.with_priority(priority);
    }

    let (handle, cancellation) = cancellation();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = JobRunner::builder()
        .config(config)
        .store(Arc::new(store))
        .progress(tx)
        .cancellation(cancellation)
        .build();

    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            report(&event);
        }
    });

    let interrupt = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling job");
                handle.cancel();
            }
        })
    };
    let deadline = options.timeout.map(|timeout| {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(timeout = ?timeout, "Job timed out, cancelling");
            handle.cancel();
        })
    });

    let mapper = ExtractiveMapper::new(options.sentences).with_focus(options.focus);
    let result = runner
        .run(job, &document, mapper, |results: Vec<ChunkResult<String>>| {
            concatenate_sections(&results, "\n\n")
        })
        .await;

    interrupt.abort();
    if let Some(deadline) = deadline {
        deadline.abort();
    }
    drop(runner);
    let _ = reporter.await;

    let outcome = result?;
    match &options.output {
        Some(path) => std::fs::write(path, &outcome.output)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", outcome.output),
    }
    eprintln!("{}", serde_json::to_string_pretty(&outcome.summary)?);

    match outcome.summary.status {
        RunStatus::Completed => Ok(()),
        RunStatus::CompletedWithErrors => {
            warn!(failed = outcome.summary.totals.failed, "Job completed with errors");
            Ok(())
        }
        RunStatus::Cancelled => bail!(
            "job {} was cancelled; rerun with the same --job-id to resume",
            outcome.summary.job_id
        ),
    }
}

fn report(event: &ProgressEvent) {
    match event {
        ProgressEvent::JobStarted {
            total_chunks,
            pending_chunks,
            resumed_chunks,
            ..
        } => info!(total_chunks, pending_chunks, resumed_chunks, "Processing"),
        ProgressEvent::ChunkProcessed {
            chunk_id, worker_id, ..
        } => debug!(chunk_id, worker_id, "Chunk done"),
        ProgressEvent::ChunkFailed {
            chunk_id,
            kind,
            message,
            ..
        } => warn!(chunk_id, kind = %kind, message = %message, "Chunk failed"),
        ProgressEvent::JobFinished { .. } => {}
    }
}

async fn status(dir: &Path, interval_chunks: u32, job_id: &str) -> Result<()> {
    let store = open_store(dir, interval_chunks).await?;
    let Some(progress) = store.status(job_id).await? else {
        bail!("no checkpoint for job {} in {}", job_id, dir.display());
    };
    println!("{}", serde_json::to_string_pretty(&progress)?);
    println!("{:.1}% done", progress.percent_done());
    Ok(())
}

async fn list_jobs(dir: &Path, interval_chunks: u32, resumable: bool) -> Result<()> {
    let store = open_store(dir, interval_chunks).await?;
    let jobs = if resumable {
        store.resumable_jobs().await?
    } else {
        store.list_jobs().await?
    };

    if jobs.is_empty() {
        println!("no jobs in {}", dir.display());
        return Ok(());
    }
    println!("{:<24} {:<22} {:>7} {:>7} {:>7}", "job", "status", "done", "failed", "total");
    for job in &jobs {
        println!(
            "{:<24} {:<22} {:>7} {:>7} {:>7}",
            job.job_id,
            format!("{:?}", job.status),
            job.done,
            job.failed,
            job.total
        );
    }
    Ok(())
}

async fn clean(dir: &Path, interval_chunks: u32, job_id: &str) -> Result<()> {
    let store = open_store(dir, interval_chunks).await?;
    if !store.cleanup(job_id).await? {
        bail!("no checkpoint for job {} in {}", job_id, dir.display());
    }
    println!("removed checkpoints of {}", job_id);
    Ok(())
}

async fn open_store(dir: &Path, interval_chunks: u32) -> Result<JsonlCheckpointStore> {
    JsonlCheckpointStore::open(dir, interval_chunks)
        .await
        .with_context(|| format!("Failed to open checkpoint directory {}", dir.display()))
}

//! Command-line arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokengov_core::Priority;

/// Rate-limited, resumable map/reduce over large documents
#[derive(Parser, Debug)]
#[command(name = "tokengov")]
#[command(about = "tokengov - Govern LLM token spend over large documents", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Governor configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Split a document into token-bounded chunks
    Split {
        /// Document to split
        file: PathBuf,

        /// Target chunk size in tokens (overrides config)
        #[arg(long)]
        target_tokens: Option<u32>,

        /// Overlap between chunks in tokens (overrides config)
        #[arg(long)]
        overlap_tokens: Option<u32>,

        /// Print chunks as JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Select the chunks most relevant to a query under a token budget
    Compress {
        /// Document to compress
        file: PathBuf,

        /// Query to score chunks against
        #[arg(short, long)]
        query: String,

        /// Token budget for the selected context
        #[arg(long, default_value = "4000")]
        max_tokens: u32,

        /// Print metrics only
        #[arg(long)]
        metrics_only: bool,
    },

    /// Run an extractive summarization job over a document
    Run {
        /// Document to process
        file: PathBuf,

        /// Job id; rerunning with the same id resumes the job
        #[arg(long)]
        job_id: String,

        /// Number of workers (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Priority class for token admission
        #[arg(long)]
        priority: Option<Priority>,

        /// Sentences kept per chunk
        #[arg(long, default_value = "2")]
        sentences: usize,

        /// Prefer sentences similar to this text
        #[arg(long)]
        focus: Option<String>,

        /// Checkpoint directory (overrides config)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Cancel the job after this long (e.g. "30s", "10m")
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Write the reduced output here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show checkpoint progress of a job, or list jobs when no id is given
    Status {
        job_id: Option<String>,

        /// Only list jobs that did not complete cleanly
        #[arg(long, conflicts_with = "job_id")]
        resumable: bool,

        /// Checkpoint directory (overrides config)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Delete the checkpoint files of a job
    Clean {
        job_id: String,

        /// Checkpoint directory (overrides config)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate a configuration file against the schema and constraints
    Validate { file: PathBuf },

    /// Print the effective configuration as YAML
    Show,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

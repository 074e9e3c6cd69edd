//! CLI argument parsing definitions

use cadre_config::CrashPolicy;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Maximum number of worker processes
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<i64>,

    /// Output format
    #[arg(long, value_enum, default_value_t = ReporterKind::Summary)]
    pub reporter: ReporterKind,

    /// Keep each worker's output contiguous
    #[arg(long)]
    pub strict_ordering: bool,

    /// What to do with a file whose worker crashed: drop, requeue
    #[arg(long, value_name = "POLICY")]
    pub crash_policy: Option<CrashPolicy>,

    /// Milliseconds a retiring worker gets before it is killed
    #[arg(long, value_name = "MS")]
    pub grace_period_ms: Option<u64>,

    /// Program run once per file
    #[arg(long, value_name = "PROGRAM")]
    pub engine: Option<String>,

    /// Argument passed to the engine before the file path (repeatable)
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    pub print_config: bool,

    /// Run as worker process (internal use)
    #[arg(long, hide = true)]
    pub is_worker: bool,

    /// Worker ID (used with --is-worker)
    #[arg(long, value_name = "ID", hide = true)]
    pub worker_id: Option<u32>,

    /// Test files to run
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReporterKind {
    /// Failures and totals once the run ends
    Summary,
    /// One JSON object per event
    Json,
    /// Forward events to the controller (worker processes only)
    #[value(hide = true)]
    Cluster,
}

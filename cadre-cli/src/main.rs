use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use cadre_cluster::{
    run_worker, worker_args, ClusterEvent, CommandEngine, Orchestrator, OrchestratorConfig,
    ProcessSpawner, RunSummary, WorkItem,
};
use cadre_config::{CadreConfig, ConfigLoader};
use cadre_logging::{init_logging_from_config, init_worker_tracing};

mod cli;
mod reporter;

use cli::{Cli, ReporterKind};
use reporter::{JsonReporter, Reporter, SummaryReporter};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&std::path::PathBuf>) -> Result<CadreConfig> {
    let loader = ConfigLoader::new();
    match config_path {
        Some(path) => loader
            .from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// Apply command line flags on top of the loaded configuration
fn apply_cli_overrides(cli: &Cli, config: &mut CadreConfig) -> Result<()> {
    if let Some(jobs) = cli.jobs {
        config.cluster.core_count = jobs;
    }
    if cli.strict_ordering {
        config.cluster.strict_ordering = true;
    }
    if let Some(policy) = cli.crash_policy {
        config.cluster.crash_policy = policy;
    }
    if let Some(ms) = cli.grace_period_ms {
        config.cluster.shutdown_grace_period = Duration::from_millis(ms);
    }
    if let Some(program) = &cli.engine {
        config.engine.program = program.clone();
    }
    if !cli.engine_args.is_empty() {
        config.engine.args = cli.engine_args.clone();
    }
    if !cli.files.is_empty() {
        config.cluster.files = cli.files.clone();
    }

    config.validate_all().context("Invalid configuration")
}

/// Run as worker process
async fn run_worker_process(cli: &Cli, config: &CadreConfig) -> Result<()> {
    let worker_id = cli.worker_id.unwrap_or_default();
    let engine = CommandEngine::from_config(&config.engine);

    async {
        info!(program = engine.program(), "Worker starting");
        run_worker(engine).await.context("Worker channel failed")?;
        info!("Worker shutting down");
        Ok(())
    }
    .instrument(info_span!("worker", worker_id))
    .await
}

/// Drain the event stream into the reporter on its own task
fn spawn_reporter(
    mut reporter: Box<dyn Reporter>,
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
) -> tokio::task::JoinHandle<Result<Box<dyn Reporter>>> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            reporter.on_event(&event)?;
        }
        Ok(reporter)
    })
}

/// Run the batch and report; returns whether everything passed
async fn run_controller(cli: &Cli, config: &CadreConfig) -> Result<bool> {
    let reporter: Box<dyn Reporter> = match cli.reporter {
        ReporterKind::Summary => Box::new(SummaryReporter::new(std::io::stdout())),
        ReporterKind::Json => Box::new(JsonReporter::new(std::io::stdout())),
        ReporterKind::Cluster => {
            return Err(anyhow!("The cluster reporter is only used by worker processes"))
        }
    };

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let spawner = ProcessSpawner::current_exe(worker_args(&argv))?;

    let files: Vec<WorkItem> = config.cluster.files.iter().cloned().map(WorkItem::from).collect();
    info!(
        files = files.len(),
        cores = config.cluster.worker_limit(),
        engine = %config.engine.program,
        "cadre starting"
    );

    let mut orchestrator = Orchestrator::new(OrchestratorConfig::from(&config.cluster), spawner);
    let printer = spawn_reporter(reporter, orchestrator.subscribe());

    let result: Result<RunSummary> = tokio::select! {
        result = orchestrator.run(files) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping workers");
            Err(anyhow!("Interrupted"))
        }
    };

    // Closes the event stream and kills any remaining workers
    drop(orchestrator);
    let mut reporter = printer.await.context("Reporter task failed")??;

    match result {
        Ok(summary) => {
            reporter.finish(Some(&summary))?;
            Ok(reporter.tally().failed == 0)
        }
        Err(e) => {
            reporter.finish(None)?;
            Err(e)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", CadreConfig::generate_sample());
        return Ok(());
    }

    // Handle worker mode first, logging to stderr only since stdout carries IPC
    if cli.is_worker {
        init_worker_tracing(cli.log_level.as_deref())?;
        let mut config = load_config(cli.config.as_ref())?;
        apply_cli_overrides(&cli, &mut config)?;
        return run_worker_process(&cli, &config).await;
    }

    let mut config = load_config(cli.config.as_ref())?;
    apply_cli_overrides(&cli, &mut config)?;
    init_logging_from_config(&config.logging, cli.log_level.as_deref())?;

    match run_controller(&cli, &config).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Run failed: {:#}", e);
            std::process::exit(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_config::CrashPolicy;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "cadre",
            "-j",
            "0",
            "--crash-policy",
            "requeue",
            "--grace-period-ms",
            "250",
            "--engine",
            "sh",
            "x.test",
        ])
        .unwrap();

        let mut config = CadreConfig::default();
        config.cluster.files = vec!["from-config.test".to_string()];
        apply_cli_overrides(&cli, &mut config).unwrap();

        assert_eq!(config.cluster.worker_limit(), 1);
        assert_eq!(config.cluster.crash_policy, CrashPolicy::Requeue);
        assert_eq!(config.cluster.shutdown_grace_period, Duration::from_millis(250));
        assert_eq!(config.engine.program, "sh");
        assert_eq!(config.cluster.files, vec!["x.test"]);
    }

    #[test]
    fn test_config_files_used_without_positional_files() {
        let cli = Cli::try_parse_from(["cadre"]).unwrap();
        let mut config = CadreConfig::default();
        config.cluster.files = vec!["from-config.test".to_string()];
        apply_cli_overrides(&cli, &mut config).unwrap();
        assert_eq!(config.cluster.files, vec!["from-config.test"]);
    }

    #[test]
    fn test_empty_engine_is_rejected() {
        let cli = Cli::try_parse_from(["cadre", "--engine", " "]).unwrap();
        let mut config = CadreConfig::default();
        assert!(apply_cli_overrides(&cli, &mut config).is_err());
    }
}

//! Cluster Backup - Main entry point
//!
//! Exit codes: 0 when every target succeeded, 1 when at least one target
//! did not, 2 on fatal errors (configuration, local I/O).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cluster_backup::archive::summary::load_run;
use cluster_backup::daemon::shutdown::ShutdownCoordinator;
use cluster_backup::gateway::kubectl::KubectlGateway;
use cluster_backup::gateway::ClusterGateway;
use cluster_backup::restore::{RestoreOrchestrator, RestorePlan};
use cluster_backup::{run, utils, verify, Config, TargetRegistry};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture targets into a new run directory
    Backup {
        /// Only back up these targets (repeatable)
        #[arg(short, long = "target", value_name = "NAME")]
        targets: Vec<String>,
    },
    /// Restore targets from a sealed run directory
    Restore {
        run_dir: PathBuf,

        /// Only restore these targets (repeatable)
        #[arg(short, long = "target", value_name = "NAME")]
        targets: Vec<String>,

        /// Print the plan without touching the cluster
        #[arg(long)]
        dry_run: bool,
    },
    /// Check archive checksums of a sealed run offline
    Verify { run_dir: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cluster-backup: {}", e);
            return ExitCode::from(2);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("cluster-backup: failed to initialize logging: {}", e);
        return ExitCode::from(2);
    }

    match execute(args.command, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether every target ended in `Success`/`Done`.
async fn execute(command: Command, config: Config) -> Result<bool> {
    match command {
        Command::Backup { targets } => {
            tracing::info!("Starting cluster-backup v{}", env!("CARGO_PKG_VERSION"));
            let registry = TargetRegistry::new(config.targets.clone())?;
            let gateway: Arc<dyn ClusterGateway> = Arc::new(KubectlGateway::new(&config.cluster));

            let shutdown = ShutdownCoordinator::new();
            let cancel = shutdown.token();
            let listener = shutdown.spawn();

            let result = run::run_backup(&config, &registry, gateway, &targets, cancel).await;
            listener.abort();
            let run = result.context("backup run failed")?;

            print!("{}", run.summary);
            Ok(run.summary.all_succeeded())
        }
        Command::Restore {
            run_dir,
            targets,
            dry_run,
        } => {
            let sealed = load_run(&run_dir)?;
            let plan = RestorePlan::from_run(&sealed, &targets)?;
            if dry_run {
                print!("{}", plan);
                return Ok(plan.rejected.is_empty());
            }

            let gateway: Arc<dyn ClusterGateway> = Arc::new(KubectlGateway::new(&config.cluster));
            let shutdown = ShutdownCoordinator::new();
            let orchestrator =
                RestoreOrchestrator::new(gateway, config.restore.clone(), shutdown.token());
            let listener = shutdown.spawn();

            let report = orchestrator.execute(&plan).await;
            listener.abort();

            print!("{}", report);
            Ok(report.all_done())
        }
        Command::Verify { run_dir } => {
            let report = verify::verify_run(&run_dir).await?;
            print!("{}", report);
            Ok(report.all_intact())
        }
    }
}

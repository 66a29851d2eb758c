//! Backup run driver: captures the selected targets into one sealed run.

use crate::archive::retention::prune_runs;
use crate::archive::{ArchiveWriter, BackupRun};
use crate::config::Config;
use crate::gateway::{ClusterGateway, GatewayError};
use crate::registry::TargetRegistry;
use crate::snapshot::SnapshotCollector;
use crate::utils::{BackupError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run a backup of `filter` (all registered targets when empty).
///
/// Per-target failures end up in the returned run's summary. An error is
/// returned only for configuration problems and local I/O failures, in
/// which case the run directory is left unsealed.
pub async fn run_backup(
    config: &Config,
    registry: &TargetRegistry,
    gateway: Arc<dyn ClusterGateway>,
    filter: &[String],
    cancel: CancellationToken,
) -> Result<BackupRun> {
    let targets = registry.select(filter)?;
    let writer = ArchiveWriter::open_run(&config.backup.root).await?;
    info!(
        run_id = %writer.run_id(),
        targets = targets.len(),
        concurrency = config.backup.concurrency,
        "Starting backup run"
    );

    for artifact in &config.backup.cluster_artifacts {
        let document = if cancel.is_cancelled() {
            Err(GatewayError::cancelled())
        } else {
            gateway.get_resource(&artifact.kind, None, None).await
        };
        writer.write_cluster_artifact(&artifact.name, document).await?;
    }

    // A fatal write error stops the remaining targets without marking the
    // run as interrupted by a signal.
    let run_cancel = cancel.child_token();
    let collector = Arc::new(SnapshotCollector::new(
        gateway,
        writer.clone(),
        run_cancel.clone(),
    ));
    let semaphore = Arc::new(Semaphore::new(config.backup.concurrency.max(1)));

    let mut handles = Vec::with_capacity(targets.len());
    for target in targets.iter().cloned() {
        let collector = collector.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
            collector.capture_target(&target).await
        }));
    }

    let mut fatal: Option<BackupError> = None;
    for (target, handle) in targets.iter().zip(handles) {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(BackupError::Io(std::io::Error::other(e))),
        };
        let written = match outcome {
            Ok(manifest) if fatal.is_none() => writer.write_manifest(&manifest).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!(app = %target.name, error = %e, "Backup run aborted");
            run_cancel.cancel();
            fatal.get_or_insert(e);
        }
    }
    if let Some(e) = fatal {
        return Err(e);
    }

    let order: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
    let run = writer.finalize(&order, cancel.is_cancelled()).await?;

    for t in run.summary.unsuccessful() {
        warn!(app = %t.name, status = %t.status, "Target not backed up successfully");
    }
    if run.summary.cancelled {
        warn!(run_id = %run.run_id, "Backup run was cancelled");
    }

    if let Some(keep) = config.backup.keep_runs {
        let root = config.backup.root.clone();
        match tokio::task::spawn_blocking(move || prune_runs(&root, keep)).await {
            Ok(Ok(removed)) if !removed.is_empty() => {
                info!(removed = removed.len(), keep, "Pruned old backup runs")
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to prune old backup runs"),
            Err(e) => warn!(error = %e, "Retention task failed"),
        }
    }

    Ok(run)
}

//! Restore plan: which targets of a sealed run get restored, and from what.
//!
//! Built from the run directory alone; never persisted.

use crate::archive::summary::SealedRun;
use crate::snapshot::manifest::{DataArchive, SnapshotManifest};
use crate::utils::{BackupError, Result};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreStep {
    pub target: String,
    pub namespace: String,
    pub deployment: String,
    pub claim: String,
    pub mount_path: String,
    pub archive_path: PathBuf,
    pub data: DataArchive,
    /// Replica count recorded at backup time
    pub captured_replicas: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub steps: Vec<RestoreStep>,
    /// Explicitly requested targets that cannot be restored, with the reason.
    /// Reported as failures.
    pub rejected: Vec<(String, String)>,
    /// Targets without restorable data when no filter was given.
    pub skipped: Vec<(String, String)>,
}

impl RestorePlan {
    /// Plan a restore of `run`. An empty filter selects every target that
    /// has a data archive; naming a target that is not in the run is a
    /// configuration error.
    pub fn from_run(run: &SealedRun, filter: &[String]) -> Result<Self> {
        if let Some(unknown) = filter.iter().find(|n| run.manifest(n).is_none()) {
            return Err(BackupError::config(format!(
                "target '{}' is not part of run {}",
                unknown, run.summary.run_id
            )));
        }

        let mut plan = RestorePlan {
            run_id: run.summary.run_id.clone(),
            run_dir: run.directory.clone(),
            steps: Vec::new(),
            rejected: Vec::new(),
            skipped: Vec::new(),
        };

        for manifest in &run.manifests {
            let requested = filter.iter().any(|n| n == manifest.target_name());
            if !filter.is_empty() && !requested {
                continue;
            }
            match step_for(run, manifest) {
                Ok(step) => plan.steps.push(step),
                Err(reason) if requested => {
                    plan.rejected.push((manifest.target_name().to_string(), reason))
                }
                Err(reason) => plan.skipped.push((manifest.target_name().to_string(), reason)),
            }
        }
        Ok(plan)
    }
}

fn step_for(
    run: &SealedRun,
    manifest: &SnapshotManifest,
) -> std::result::Result<RestoreStep, String> {
    let data = manifest
        .data
        .clone()
        .ok_or_else(|| format!("no data archive in run ({})", manifest.status))?;
    let claim = manifest
        .target
        .volume_claim
        .clone()
        .ok_or_else(|| "no volume claim configured".to_string())?;

    Ok(RestoreStep {
        target: manifest.target_name().to_string(),
        namespace: manifest.target.namespace.clone(),
        deployment: manifest.target.deployment_name().to_string(),
        claim,
        mount_path: manifest.target.mount_path.clone(),
        archive_path: run.directory.join(&data.file),
        data,
        captured_replicas: manifest.replicas,
    })
}

impl fmt::Display for RestorePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Restore plan for run {} ({})", self.run_id, self.run_dir.display())?;
        for step in &self.steps {
            writeln!(
                f,
                "  {}: scale {}/{} to 0, mount {} at {}, stream {} ({} bytes), verify, scale back",
                step.target,
                step.namespace,
                step.deployment,
                step.claim,
                step.mount_path,
                step.data.file,
                step.data.stream_bytes
            )?;
        }
        for (target, reason) in &self.rejected {
            writeln!(f, "  {}: cannot restore: {}", target, reason)?;
        }
        for (target, reason) in &self.skipped {
            writeln!(f, "  {}: skipped: {}", target, reason)?;
        }
        Ok(())
    }
}

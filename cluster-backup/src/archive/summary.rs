//! Run summary (`summary.json`) and reading sealed runs back from disk.

use super::{MANIFEST_SUFFIX, SUMMARY_FILE};
use crate::snapshot::manifest::{SnapshotManifest, SnapshotStatus};
use crate::utils::{format_bytes, BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Captured { file: String, bytes: u64 },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub name: String,
    pub status: SnapshotStatus,
    pub captured_at: DateTime<Utc>,
    pub manifest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
    pub resources_skipped: usize,
}

impl TargetSummary {
    pub fn from_manifest(manifest: &SnapshotManifest) -> Self {
        Self {
            name: manifest.target_name().to_string(),
            status: manifest.status.clone(),
            captured_at: manifest.captured_at,
            manifest: format!("{}{}", manifest.target_name(), MANIFEST_SUFFIX),
            archive: manifest.data.as_ref().map(|d| d.file.clone()),
            archive_bytes: manifest.data.as_ref().map(|d| d.archive_bytes),
            archive_sha256: manifest.data.as_ref().map(|d| d.archive_sha256.clone()),
            resources_skipped: manifest.skipped_resources(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub host: String,
    pub cancelled: bool,
    pub targets: Vec<TargetSummary>,
    pub cluster_artifacts: BTreeMap<String, ArtifactStatus>,
}

impl RunSummary {
    /// Targets whose status is anything but `Success`.
    pub fn unsuccessful(&self) -> Vec<&TargetSummary> {
        self.targets.iter().filter(|t| !t.status.is_success()).collect()
    }

    /// Whether every target reached `Success`. `cancelled` is informational:
    /// a target interrupted by cancellation is already non-success.
    pub fn all_succeeded(&self) -> bool {
        self.unsuccessful().is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backup run {} on {}", self.run_id, self.host)?;
        for t in &self.targets {
            write!(f, "  {}: {}", t.name, t.status)?;
            if let Some(bytes) = t.archive_bytes {
                write!(f, " ({} archived)", format_bytes(bytes))?;
            }
            if t.resources_skipped > 0 {
                write!(f, " [{} resource kinds skipped]", t.resources_skipped)?;
            }
            writeln!(f)?;
        }
        for (name, status) in &self.cluster_artifacts {
            match status {
                ArtifactStatus::Captured { .. } => writeln!(f, "  cluster/{}: captured", name)?,
                ArtifactStatus::Skipped { reason } => {
                    writeln!(f, "  cluster/{}: skipped ({})", name, reason)?
                }
            }
        }
        if self.cancelled {
            writeln!(f, "  run was cancelled")?;
        }
        Ok(())
    }
}

/// A sealed run read back from disk.
#[derive(Debug, Clone)]
pub struct SealedRun {
    pub directory: PathBuf,
    pub summary: RunSummary,
    pub manifests: Vec<SnapshotManifest>,
}

impl SealedRun {
    pub fn manifest(&self, target: &str) -> Option<&SnapshotManifest> {
        self.manifests.iter().find(|m| m.target_name() == target)
    }
}

pub fn is_sealed(dir: &Path) -> bool {
    dir.join(SUMMARY_FILE).is_file()
}

/// Load `summary.json` and every manifest it lists. A directory without a
/// summary was never finalized and is refused.
pub fn load_run(dir: &Path) -> Result<SealedRun> {
    if !is_sealed(dir) {
        return Err(BackupError::config(format!(
            "{} is not a sealed backup run (no {})",
            dir.display(),
            SUMMARY_FILE
        )));
    }
    let summary: RunSummary = serde_json::from_slice(&std::fs::read(dir.join(SUMMARY_FILE))?)?;

    let mut manifests = Vec::with_capacity(summary.targets.len());
    for target in &summary.targets {
        let path = dir.join(&target.manifest);
        let manifest: SnapshotManifest = serde_json::from_slice(&std::fs::read(&path)?)?;
        if manifest.target_name() != target.name {
            return Err(BackupError::Integrity(format!(
                "{} describes target '{}', summary expects '{}'",
                path.display(),
                manifest.target_name(),
                target.name
            )));
        }
        manifests.push(manifest);
    }

    Ok(SealedRun {
        directory: dir.to_path_buf(),
        summary,
        manifests,
    })
}

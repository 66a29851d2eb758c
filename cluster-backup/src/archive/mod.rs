//! Archive writer: owns everything written under a run directory.
//!
//! Layout of `<backup_root>/<run_id>/`:
//! - `<target>.manifest.json` per target
//! - `<target>.tar.zst` and `<target>.sha256` per target with data
//! - `cluster/<artifact>.yaml` for cluster-wide listings
//! - `summary.json`, written last; its presence marks the run as sealed

pub mod retention;
pub mod summary;

use crate::gateway::GatewayError;
use crate::snapshot::manifest::SnapshotManifest;
use crate::utils::fsutil::{is_temp_file, sha256_file_async, temp_path_for, write_atomic};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use summary::{ArtifactStatus, RunSummary, TargetSummary};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const SUMMARY_FILE: &str = "summary.json";
pub const MANIFEST_SUFFIX: &str = ".manifest.json";
pub const ARCHIVE_SUFFIX: &str = ".tar.zst";
pub const CHECKSUM_SUFFIX: &str = ".sha256";
pub const CLUSTER_DIR: &str = "cluster";

const RUN_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const COPY_BUFFER: usize = 64 * 1024;

/// A data archive committed under its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Result of streaming data into the run. A failure on the source side
/// (pod, exec channel, cancellation) is not an archive error: the target is
/// recorded as a partial failure and the run continues.
#[derive(Debug)]
pub enum StreamOutcome {
    Written(ArchiveArtifact),
    SourceFailed(std::io::Error),
}

/// A sealed run.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub run_id: String,
    pub directory: PathBuf,
    pub snapshots: Vec<SnapshotManifest>,
    pub summary: RunSummary,
}

struct RunState {
    snapshots: Vec<SnapshotManifest>,
    cluster_artifacts: BTreeMap<String, ArtifactStatus>,
}

/// Handle to an open run. Cloning shares the same run; concurrent collectors
/// append through the inner mutex.
#[derive(Clone)]
pub struct ArchiveWriter {
    run_id: String,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    state: Arc<Mutex<RunState>>,
}

impl ArchiveWriter {
    /// Create a fresh timestamped run directory under `root`.
    pub async fn open_run(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root).await?;

        let started_at = Utc::now();
        let base = started_at.format(RUN_ID_FORMAT).to_string();
        let mut attempt = 0;
        let (run_id, dir) = loop {
            let run_id = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            let dir = root.join(&run_id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => break (run_id, dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(run_id = %run_id, dir = %dir.display(), "Opened backup run");

        Ok(Self {
            run_id,
            dir,
            started_at,
            state: Arc::new(Mutex::new(RunState {
                snapshots: Vec::new(),
                cluster_artifacts: BTreeMap::new(),
            })),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Persist a target's manifest. Writing the same target again replaces
    /// its earlier entry.
    pub async fn write_manifest(&self, manifest: &SnapshotManifest) -> Result<()> {
        let path = self
            .dir
            .join(format!("{}{}", manifest.target_name(), MANIFEST_SUFFIX));
        let body = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&path, &body).await?;

        let mut state = self.state.lock().await;
        state
            .snapshots
            .retain(|m| m.target_name() != manifest.target_name());
        state.snapshots.push(manifest.clone());
        Ok(())
    }

    /// Copy `reader` into `<target>.tar.zst`, then write its checksum file.
    /// Only a local write failure is an error.
    pub async fn write_data_stream<R>(
        &self,
        target: &str,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let file_name = format!("{}{}", target, ARCHIVE_SUFFIX);
        let final_path = self.dir.join(&file_name);
        let tmp = temp_path_for(&final_path);

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let read = tokio::select! {
                r = reader.read(&mut buf) => r,
                _ = cancel.cancelled() => Err(GatewayError::cancelled().into()),
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    discard(&tmp).await;
                    return Ok(StreamOutcome::SourceFailed(e));
                }
            };
            if let Err(e) = file.write_all(&buf[..n]).await {
                drop(file);
                discard(&tmp).await;
                return Err(e.into());
            }
        }

        if let Err(e) = file.sync_all().await {
            drop(file);
            discard(&tmp).await;
            return Err(e.into());
        }
        drop(file);

        let sha256 = sha256_file_async(&tmp).await?;
        let bytes = tokio::fs::metadata(&tmp).await?.len();
        tokio::fs::rename(&tmp, &final_path).await?;

        let checksum_path = self.dir.join(format!("{}{}", target, CHECKSUM_SUFFIX));
        write_atomic(&checksum_path, format!("{}  {}\n", sha256, file_name).as_bytes()).await?;

        Ok(StreamOutcome::Written(ArchiveArtifact {
            file: file_name,
            bytes,
            sha256,
        }))
    }

    /// Record a cluster-wide listing, or the reason it could not be fetched.
    pub async fn write_cluster_artifact(
        &self,
        name: &str,
        document: std::result::Result<String, GatewayError>,
    ) -> Result<()> {
        let status = match document {
            Ok(doc) => {
                let cluster_dir = self.dir.join(CLUSTER_DIR);
                tokio::fs::create_dir_all(&cluster_dir).await?;
                let file = format!("{}/{}.yaml", CLUSTER_DIR, name);
                write_atomic(&self.dir.join(&file), doc.as_bytes()).await?;
                ArtifactStatus::Captured {
                    file,
                    bytes: doc.len() as u64,
                }
            }
            Err(e) => {
                warn!(artifact = name, error = %e, "Cluster artifact not captured");
                ArtifactStatus::Skipped { reason: e.reason() }
            }
        };
        self.state
            .lock()
            .await
            .cluster_artifacts
            .insert(name.to_string(), status);
        Ok(())
    }

    /// Seal the run: sweep leftover temp files and write `summary.json`.
    /// `order` fixes the target order of the summary.
    pub async fn finalize(self, order: &[String], cancelled: bool) -> Result<BackupRun> {
        sweep_temp_files(&self.dir).await?;

        let state = self.state.lock().await;
        let mut snapshots = state.snapshots.clone();
        snapshots.sort_by_key(|m| {
            order
                .iter()
                .position(|n| n == m.target_name())
                .unwrap_or(usize::MAX)
        });

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            cancelled,
            targets: snapshots.iter().map(TargetSummary::from_manifest).collect(),
            cluster_artifacts: state.cluster_artifacts.clone(),
        };
        drop(state);

        let body = serde_json::to_vec_pretty(&summary)?;
        write_atomic(&self.dir.join(SUMMARY_FILE), &body).await?;

        info!(
            run_id = %self.run_id,
            targets = summary.targets.len(),
            failed = summary.unsuccessful().len(),
            "Sealed backup run"
        );

        Ok(BackupRun {
            run_id: self.run_id,
            directory: self.dir,
            snapshots,
            summary,
        })
    }
}

async fn discard(tmp: &Path) {
    if let Err(e) = tokio::fs::remove_file(tmp).await {
        warn!(file = %tmp.display(), error = %e, "Failed to remove temp file");
    }
}

/// Remove temp files left behind by an interrupted writer.
async fn sweep_temp_files(dir: &Path) -> Result<()> {
    let dir = dir.to_path_buf();
    let stale: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_temp_file(e.path()))
            .map(|e| e.into_path())
            .collect()
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;

    for path in stale {
        warn!(file = %path.display(), "Removing interrupted write");
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

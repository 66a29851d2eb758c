//! Offline integrity check of a sealed run. Needs no cluster access.

use crate::archive::summary::load_run;
use crate::archive::CHECKSUM_SUFFIX;
use crate::snapshot::manifest::{DataArchive, SnapshotManifest};
use crate::utils::fsutil::sha256_file_async;
use crate::utils::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Intact,
    /// The target has no data archive in this run; nothing to check.
    NoData(String),
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct TargetVerification {
    pub target: String,
    pub outcome: VerifyOutcome,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub run_id: String,
    pub targets: Vec<TargetVerification>,
}

impl VerifyReport {
    /// True when no archive is corrupt.
    pub fn all_intact(&self) -> bool {
        self.targets
            .iter()
            .all(|t| !matches!(t.outcome, VerifyOutcome::Corrupt(_)))
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Verification of run {}", self.run_id)?;
        for t in &self.targets {
            match &t.outcome {
                VerifyOutcome::Intact => writeln!(f, "  {}: ok", t.target)?,
                VerifyOutcome::NoData(why) => writeln!(f, "  {}: no data ({})", t.target, why)?,
                VerifyOutcome::Corrupt(why) => writeln!(f, "  {}: CORRUPT: {}", t.target, why)?,
            }
        }
        Ok(())
    }
}

/// Check every data archive of the sealed run at `dir` against its
/// checksum file and manifest.
pub async fn verify_run(dir: &Path) -> Result<VerifyReport> {
    let run = load_run(dir)?;
    let mut targets = Vec::with_capacity(run.manifests.len());

    for manifest in &run.manifests {
        let outcome = match &manifest.data {
            None => VerifyOutcome::NoData(manifest.status.to_string()),
            Some(data) => match verify_archive(&run.directory, manifest, data).await? {
                None => VerifyOutcome::Intact,
                Some(problem) => VerifyOutcome::Corrupt(problem),
            },
        };
        match &outcome {
            VerifyOutcome::Corrupt(problem) => {
                warn!(app = %manifest.target_name(), problem = %problem, "Archive corrupt")
            }
            _ => info!(app = %manifest.target_name(), "Archive checked"),
        }
        targets.push(TargetVerification {
            target: manifest.target_name().to_string(),
            outcome,
        });
    }

    Ok(VerifyReport {
        run_id: run.summary.run_id,
        targets,
    })
}

/// `Ok(None)` when intact, `Ok(Some(problem))` when not. Errors only for
/// failures unrelated to the archive contents.
async fn verify_archive(
    dir: &Path,
    manifest: &SnapshotManifest,
    data: &DataArchive,
) -> Result<Option<String>> {
    let archive = dir.join(&data.file);
    if !archive.is_file() {
        return Ok(Some(format!("{} missing", data.file)));
    }

    let actual = sha256_file_async(&archive).await?;
    if actual != data.archive_sha256 {
        return Ok(Some("archive checksum does not match manifest".to_string()));
    }

    let checksum_path = dir.join(format!("{}{}", manifest.target_name(), CHECKSUM_SUFFIX));
    match tokio::fs::read_to_string(&checksum_path).await {
        Ok(line) => {
            if line.split_whitespace().next() != Some(actual.as_str()) {
                return Ok(Some("archive checksum does not match checksum file".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Some(format!("{} missing", checksum_path.display())));
        }
        Err(e) => return Err(e.into()),
    }

    let (bytes, sha256) = match decode_and_hash(archive).await? {
        Ok(tally) => tally,
        Err(e) => return Ok(Some(format!("zstd stream unreadable: {}", e))),
    };
    if bytes != data.stream_bytes || sha256 != data.stream_sha256 {
        return Ok(Some(format!(
            "decoded stream differs from backup ({} bytes, expected {})",
            bytes, data.stream_bytes
        )));
    }
    Ok(None)
}

/// Decompress the archive and hash the tar stream. The outer result carries
/// task failures, the inner one decode errors.
async fn decode_and_hash(path: PathBuf) -> Result<std::io::Result<(u64, String)>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut decoder = zstd::stream::read::Decoder::new(file)?;
        let mut hasher = Sha256::new();
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok::<_, std::io::Error>((total, hex::encode(hasher.finalize())))
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e)))
}

//! Manifest types for a single target's snapshot.
//!
//! A manifest is serialized as `<target>.manifest.json` in the run
//! directory. It embeds the target definition so a restore plan can be built
//! from the run directory alone.

use crate::registry::BackupTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of one target in a backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum SnapshotStatus {
    Success,
    PartialFailure(String),
    Skipped(String),
}

impl SnapshotStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SnapshotStatus::Success)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotStatus::Success => write!(f, "Success"),
            SnapshotStatus::PartialFailure(reason) => write!(f, "PartialFailure({:?})", reason),
            SnapshotStatus::Skipped(reason) => write!(f, "Skipped({:?})", reason),
        }
    }
}

/// One declarative resource kind fetched from the target's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCapture {
    pub kind: String,
    #[serde(flatten)]
    pub outcome: ResourceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceOutcome {
    /// Raw document as returned by the control plane. Encrypted secrets stay
    /// encrypted; the document is opaque.
    Captured { document: String },
    Skipped { reason: String },
}

/// The data half of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataArchive {
    /// Archive file name inside the run directory
    pub file: String,
    /// Pod the data was streamed from
    pub pod: String,
    /// Size of the compressed archive on disk
    pub archive_bytes: u64,
    pub archive_sha256: String,
    /// Size of the uncompressed tar stream
    pub stream_bytes: u64,
    pub stream_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub target: BackupTarget,
    pub resources: Vec<ResourceCapture>,
    pub data: Option<DataArchive>,
    /// Deployment replica count observed at capture time
    pub replicas: Option<i32>,
    pub captured_at: DateTime<Utc>,
    pub status: SnapshotStatus,
}

impl SnapshotManifest {
    pub fn target_name(&self) -> &str {
        &self.target.name
    }

    pub fn data_archive_present(&self) -> bool {
        self.data.is_some()
    }

    pub fn skipped_resources(&self) -> usize {
        self.resources
            .iter()
            .filter(|r| matches!(r.outcome, ResourceOutcome::Skipped { .. }))
            .count()
    }
}

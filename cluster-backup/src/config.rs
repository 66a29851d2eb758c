//! Configuration management for the backup orchestrator.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::registry::BackupTarget;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cluster-backup/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub targets: Vec<BackupTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// kubectl binary to invoke
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// kubeconfig context (None = current context)
    #[serde(default)]
    pub context: Option<String>,

    /// Explicit kubeconfig path (None = kubectl's own lookup)
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Timeout for a single non-streaming control-plane call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum silence on an exec stream before it is considered wedged
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding one sub-directory per run
    #[serde(default = "default_backup_root")]
    pub root: PathBuf,

    /// Targets captured concurrently (1 = sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sealed runs to keep after a successful run (None = keep everything)
    #[serde(default)]
    pub keep_runs: Option<usize>,

    /// Cluster-wide informational artifacts
    #[serde(default = "default_cluster_artifacts")]
    pub cluster_artifacts: Vec<ClusterArtifact>,
}

/// A cluster-scoped resource listing archived verbatim with each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterArtifact {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Bound on waiting for a deployment to reach zero ready replicas
    #[serde(default = "default_scale_timeout_secs")]
    pub scale_timeout_secs: u64,

    /// Bound on waiting for the transfer pod to become Ready
    #[serde(default = "default_pod_ready_timeout_secs")]
    pub pod_ready_timeout_secs: u64,

    /// Image used for the transfer pod (needs `tar` and `sleep`)
    #[serde(default = "default_transfer_image")]
    pub transfer_image: String,

    /// Compare the streamed data against the manifest checksum
    #[serde(default = "default_true")]
    pub verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_stream_idle_timeout_secs() -> u64 {
    120
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/cluster")
}

fn default_concurrency() -> usize {
    1
}

fn default_cluster_artifacts() -> Vec<ClusterArtifact> {
    [
        ("nodes", "nodes"),
        ("gitrepositories", "gitrepositories.source.toolkit.fluxcd.io"),
        ("kustomizations", "kustomizations.kustomize.toolkit.fluxcd.io"),
        ("helmreleases", "helmreleases.helm.toolkit.fluxcd.io"),
    ]
    .into_iter()
    .map(|(name, kind)| ClusterArtifact {
        name: name.to_string(),
        kind: kind.to_string(),
    })
    .collect()
}

fn default_scale_timeout_secs() -> u64 {
    120
}

fn default_pod_ready_timeout_secs() -> u64 {
    180
}

fn default_transfer_image() -> String {
    "busybox:1.36".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: None,
            kubeconfig: None,
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_backup_root(),
            concurrency: default_concurrency(),
            keep_runs: None,
            cluster_artifacts: default_cluster_artifacts(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            scale_timeout_secs: default_scale_timeout_secs(),
            pod_ready_timeout_secs: default_pod_ready_timeout_secs(),
            transfer_image: default_transfer_image(),
            verify: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClusterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl RestoreConfig {
    pub fn scale_timeout(&self) -> Duration {
        Duration::from_secs(self.scale_timeout_secs)
    }

    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ready_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration the CLI runs with: explicit file, else the
    /// default location if present, else built-in defaults. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Config::default(),
        };
        let _ = dotenvy::dotenv();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `BACKUP_ROOT`, `KUBE_CONTEXT` and `LOG_LEVEL`. `KUBECONFIG` is
    /// left to kubectl, which understands colon-separated lists.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("BACKUP_ROOT") {
            self.backup.root = PathBuf::from(root);
        }
        if let Some(context) = lookup("KUBE_CONTEXT") {
            self.cluster.context = Some(context);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.backup.concurrency) {
            return Err(BackupError::config(format!(
                "backup.concurrency must be between 1 and 8, got {}",
                self.backup.concurrency
            )));
        }
        if self.backup.keep_runs == Some(0) {
            return Err(BackupError::config("backup.keep_runs must be at least 1"));
        }
        if self.restore.transfer_image.trim().is_empty() {
            return Err(BackupError::config("restore.transfer_image must not be empty"));
        }
        if let Some(kubeconfig) = &self.cluster.kubeconfig {
            if kubeconfig.to_string_lossy().contains(':') {
                return Err(BackupError::config(format!(
                    "cluster.kubeconfig must be a single file, got '{}' (use KUBECONFIG for lists)",
                    kubeconfig.display()
                )));
            }
        }
        Ok(())
    }
}

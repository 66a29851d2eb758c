//! Target registry: the declarative list of applications to back up.
//!
//! Per-application differences (selector, mount path, claim) live here as
//! data; the collector and restore orchestrator are generic over them.

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What the data half of a target's snapshot consists of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveKind {
    /// tar of `mount_path` inside the running pod
    #[default]
    Directory,
    /// declarative resources only, no data stream
    ManifestsOnly,
}

/// One application's backup unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub name: String,
    pub namespace: String,

    /// Label selector resolving the pod that mounts the data
    #[serde(default)]
    pub selector: String,

    /// Directory inside the pod that holds the application data
    #[serde(default)]
    pub mount_path: String,

    #[serde(default)]
    pub kind: ArchiveKind,

    /// Deployment scaled during restore (defaults to `name`)
    #[serde(default)]
    pub deployment: Option<String>,

    /// Claim mounted by the transfer pod during restore
    #[serde(default)]
    pub volume_claim: Option<String>,

    /// Container to exec into when the pod has several
    #[serde(default)]
    pub container: Option<String>,

    /// Declarative kinds captured from the namespace
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,
}

fn default_resources() -> Vec<String> {
    vec!["deployment".to_string(), "persistentvolumeclaim".to_string()]
}

/// Target names become file names inside a run directory. A leading dot
/// would also be swept as a temp file.
fn is_safe_name(name: &str) -> bool {
    !name.starts_with('.') && !name.contains(['/', '\\'])
}

impl BackupTarget {
    pub fn deployment_name(&self) -> &str {
        self.deployment.as_deref().unwrap_or(&self.name)
    }

    pub fn captures_data(&self) -> bool {
        self.kind == ArchiveKind::Directory
    }
}

/// Validated, ordered set of targets.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Vec<BackupTarget>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<BackupTarget>) -> Result<Self> {
        let mut seen = HashSet::new();
        for target in &targets {
            if target.name.trim().is_empty() {
                return Err(BackupError::config("target with empty name"));
            }
            if !is_safe_name(&target.name) {
                return Err(BackupError::config(format!(
                    "target name '{}' must be a single path component not starting with '.'",
                    target.name
                )));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(BackupError::config(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if target.namespace.trim().is_empty() {
                return Err(BackupError::config(format!(
                    "target '{}' has an empty namespace",
                    target.name
                )));
            }
            if target.mount_path.trim().is_empty() && target.captures_data() {
                return Err(BackupError::config(format!(
                    "target '{}' has an empty mount_path",
                    target.name
                )));
            }
            if target.selector.trim().is_empty() && target.captures_data() {
                return Err(BackupError::config(format!(
                    "target '{}' has an empty selector",
                    target.name
                )));
            }
        }
        Ok(Self { targets })
    }

    pub fn list_targets(&self) -> &[BackupTarget] {
        &self.targets
    }

    pub fn get(&self, name: &str) -> Option<&BackupTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Narrow to the named targets, keeping registry order. An empty filter
    /// keeps everything.
    pub fn select(&self, names: &[String]) -> Result<Vec<BackupTarget>> {
        if names.is_empty() {
            return Ok(self.targets.clone());
        }
        if let Some(unknown) = names.iter().find(|n| self.get(n).is_none()) {
            return Err(BackupError::config(format!("unknown target '{}'", unknown)));
        }
        Ok(self
            .targets
            .iter()
            .filter(|t| names.contains(&t.name))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) fn target(name: &str) -> BackupTarget {
    BackupTarget {
        name: name.to_string(),
        namespace: name.to_string(),
        selector: format!("app={}", name),
        mount_path: "/data".to_string(),
        kind: ArchiveKind::Directory,
        deployment: None,
        volume_claim: Some(format!("{}-data", name)),
        container: None,
        resources: default_resources(),
    }
}

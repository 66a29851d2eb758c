//! Pruning of old sealed runs.

use super::summary::is_sealed;
use crate::utils::Result;
use std::path::{Path, PathBuf};

/// Keep the newest `keep` sealed runs under `root`, remove the rest.
/// Unsealed directories (in progress or interrupted) are never touched.
pub fn prune_runs(root: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut runs: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && is_sealed(p))
        .collect();

    runs.sort_by_cached_key(|p| {
        std::cmp::Reverse(age_key(&p.file_name().unwrap_or_default().to_string_lossy()))
    });

    let mut removed = Vec::new();
    for old in runs.into_iter().skip(keep) {
        std::fs::remove_dir_all(&old)?;
        tracing::info!(run = %old.display(), "Removed old backup run");
        removed.push(old);
    }
    Ok(removed)
}

/// Run ids are `<timestamp>` or `<timestamp>-<n>` on collision. The
/// timestamp sorts lexically; the suffix has to be compared as a number.
fn age_key(run_id: &str) -> (String, u32) {
    let split = run_id
        .char_indices()
        .nth(TIMESTAMP_LEN)
        .map_or(run_id.len(), |(i, _)| i);
    let (stamp, rest) = run_id.split_at(split);
    let suffix = rest
        .strip_prefix('-')
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    (stamp.to_string(), suffix)
}

// Length of `YYYY-MM-DD_HH-MM-SS`
const TIMESTAMP_LEN: usize = 19;

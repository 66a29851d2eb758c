//! Atomic file writes and checksums.
//!
//! Every artifact in a run directory is written under a hidden temp name and
//! renamed into place, so a reader never observes a truncated file under its
//! final name.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const TEMP_SUFFIX: &str = ".tmp";

/// Hidden temp path next to `path`: `.<name>.<pid>.tmp`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}{}", file_name, std::process::id(), TEMP_SUFFIX))
}

/// True for files produced by [`temp_path_for`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with('.') && n.ends_with(TEMP_SUFFIX)
        })
        .unwrap_or(false)
}

/// Write `body` to `path` via temp file + fsync + rename.
pub async fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path_for(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp, path).await
}

/// SHA-256 of a file on disk, hex encoded.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Async wrapper around [`sha256_file`].
pub async fn sha256_file_async(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("summary.json");

        write_atomic(&target, b"{}").await?;

        assert_eq!(std::fs::read(&target)?, b"{}");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_temp_naming() {
        let tmp = temp_path_for(Path::new("/backups/run/alpha.tar.zst"));
        assert!(is_temp_file(&tmp));
        assert!(!is_temp_file(Path::new("/backups/run/alpha.tar.zst")));
        assert!(!is_temp_file(Path::new("/backups/run/.hidden")));
    }

    #[test]
    fn test_sha256_file() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("data");
        std::fs::write(&path, b"abc")?;
        assert_eq!(
            sha256_file(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}

//! On-disk, per-`(workspace, target)` build cache.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace, warn};

use crate::{
    error::CacheError,
    fs,
    fingerprint::Fingerprint,
    path::{AbsDirPath, JoinWith as _, mk_rel_dir, mk_rel_file},
};

/// The captured result of running one [`crate::manifest::Command`].
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub combined: String,
    pub duration_ms: u64,
}

/// A fingerprint paired with the results it produced.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub results: Vec<CommandResult>,
}

/// Reads, writes, and invalidates the on-disk cache for a `(workspace,
/// target)` pair, stored at `<workspace-root>/.caches/<target>/`.
pub struct CacheStore;

impl CacheStore {
    fn cache_dir(workspace_root: &AbsDirPath, target: &str) -> Result<AbsDirPath> {
        Ok(workspace_root
            .join(mk_rel_dir!(".caches"))
            .try_join_dir(target)?)
    }

    /// Read a cached result set, returning `None` (a cache miss) if no
    /// entry exists, the entry is unparseable, or its stored fingerprint
    /// does not exactly match `current`.
    #[instrument(skip(current))]
    pub async fn read(
        workspace_root: &AbsDirPath,
        target: &str,
        current: &Fingerprint,
    ) -> Option<Vec<CommandResult>> {
        let dir = Self::cache_dir(workspace_root, target).ok()?;
        let checksums_path = dir.join(mk_rel_file!("checksums.json"));
        let output_path = dir.join(mk_rel_file!("output.json"));

        let stored_raw = fs::read_buffered_utf8(&checksums_path).await.ok()??;
        let stored: Fingerprint = match serde_json::from_str(&stored_raw) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(?err, ?checksums_path, "unparseable cached fingerprint");
                return None;
            }
        };

        if &stored != current {
            trace!(?workspace_root, target, "fingerprint mismatch, cache miss");
            return None;
        }

        let output_raw = fs::read_buffered_utf8(&output_path).await.ok()??;
        match serde_json::from_str(&output_raw) {
            Ok(results) => Some(results),
            Err(err) => {
                warn!(?err, ?output_path, "unparseable cached output");
                None
            }
        }
    }

    /// Write a fingerprint and its results, overwriting any existing entry.
    #[instrument(skip(entry))]
    pub async fn write(
        workspace_root: &AbsDirPath,
        workspace_name: &str,
        target: &str,
        entry: &CacheEntry,
    ) -> Result<(), CacheError> {
        let map_err = |source: color_eyre::Report| CacheError::InvalidationFailed {
            workspace: workspace_name.to_string(),
            target: target.to_string(),
            dir: workspace_root.clone(),
            source,
        };

        let dir = Self::cache_dir(workspace_root, target).map_err(map_err)?;
        let checksums_path = dir.join(mk_rel_file!("checksums.json"));
        let output_path = dir.join(mk_rel_file!("output.json"));

        let checksums_json =
            serde_json::to_vec_pretty(&entry.fingerprint).expect("fingerprint always serializes");
        let output_json =
            serde_json::to_vec_pretty(&entry.results).expect("results always serialize");

        fs::write(&checksums_path, checksums_json)
            .await
            .map_err(map_err)?;
        fs::write(&output_path, output_json).await.map_err(map_err)?;
        trace!(?dir, "wrote cache entry");
        Ok(())
    }

    /// Best-effort remove the cache entry for `(workspace, target)`. Missing
    /// files are not an error; any other IO failure is
    /// [`CacheError::InvalidationFailed`], which is fatal to the run.
    #[instrument]
    pub async fn invalidate(
        workspace_root: &AbsDirPath,
        workspace_name: &str,
        target: &str,
    ) -> Result<(), CacheError> {
        let map_err = |source: color_eyre::Report| CacheError::InvalidationFailed {
            workspace: workspace_name.to_string(),
            target: target.to_string(),
            dir: workspace_root.clone(),
            source,
        };

        let dir = Self::cache_dir(workspace_root, target).map_err(map_err)?;
        let checksums_path = dir.join(mk_rel_file!("checksums.json"));
        let output_path = dir.join(mk_rel_file!("output.json"));

        for path in [&checksums_path, &output_path] {
            if path.exists().await {
                fs::remove_file(path).await.map_err(map_err)?;
            }
        }
        trace!(?dir, "invalidated cache entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn sample_entry() -> CacheEntry {
        let mut fingerprint = Fingerprint::new();
        fingerprint.insert("cmd".to_string(), "echo hi".to_string());
        CacheEntry {
            fingerprint,
            results: vec![CommandResult {
                command: "echo hi".to_string(),
                exit_code: 0,
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                combined: "hi\n".to_string(),
                duration_ms: 5,
            }],
        }
    }

    #[tokio::test]
    async fn round_trips_matching_fingerprint() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let entry = sample_entry();

        CacheStore::write(&root, "ws", "build", &entry).await.unwrap();
        let read = CacheStore::read(&root, "build", &entry.fingerprint).await;
        assert_eq!(read, Some(entry.results));
    }

    #[tokio::test]
    async fn mismatched_fingerprint_is_a_miss() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let entry = sample_entry();
        CacheStore::write(&root, "ws", "build", &entry).await.unwrap();

        let mut other: Fingerprint = BTreeMap::new();
        other.insert("cmd".to_string(), "echo bye".to_string());
        let read = CacheStore::read(&root, "build", &other).await;
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let entry = sample_entry();
        CacheStore::write(&root, "ws", "build", &entry).await.unwrap();

        CacheStore::invalidate(&root, "ws", "build").await.unwrap();
        CacheStore::invalidate(&root, "ws", "build").await.unwrap();
        assert_eq!(CacheStore::read(&root, "build", &entry.fingerprint).await, None);
    }
}

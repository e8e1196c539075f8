//! Computes the content fingerprint of a target invocation.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    error::CacheError,
    fs,
    manifest::Command,
    path::{AbsDirPath, AbsFilePath, RelativeTo as _},
};

/// A sorted `{ key: value }` map. Keys are sorted (via [`BTreeMap`]) so that
/// serialisation is deterministic and two fingerprints can be compared
/// byte-for-byte after JSON encoding, independent of any hasher's iteration
/// order.
pub type Fingerprint = BTreeMap<String, String>;

/// Computes the [`Fingerprint`] for running `cmds` (with `invocation_args`
/// appended on the command line) in `workspace_root`, whose inputs are the
/// files matched by `patterns`.
///
/// Returns [`CacheError::NoInputs`] if the glob patterns match zero files;
/// the caller treats that as a cache miss rather than a hard failure.
#[instrument(skip(cmds))]
pub async fn compute(
    workspace_root: &AbsDirPath,
    workspace_name: &str,
    target_name: &str,
    cmds: &[Command],
    patterns: &[String],
    invocation_args: &[String],
) -> Result<Fingerprint> {
    let matches = expand_patterns(workspace_root, patterns).await?;
    if matches.is_empty() {
        return Err(CacheError::NoInputs {
            workspace: workspace_name.to_string(),
            target: target_name.to_string(),
        }
        .into());
    }

    let mut fingerprint = Fingerprint::new();
    fingerprint.insert(
        "cmd".to_string(),
        cmds.iter().map(Command::run_str).collect::<Vec<_>>().join(" && "),
    );
    fingerprint.insert("globs".to_string(), patterns.join(","));
    if !invocation_args.is_empty() {
        fingerprint.insert("args".to_string(), invocation_args.join(" "));
    }

    for file in &matches {
        let hash = fs::hash_file(file).await.context("hash fingerprint input")?;
        let key = file
            .relative_to(workspace_root)
            .context("relativize fingerprint input")?
            .as_str_lossy()
            .into_owned();
        fingerprint.insert(key, hash);
    }

    debug!(
        workspace = workspace_name,
        target = target_name,
        files = matches.len(),
        "computed fingerprint"
    );
    Ok(fingerprint)
}

async fn expand_patterns(workspace_root: &AbsDirPath, patterns: &[String]) -> Result<Vec<AbsFilePath>> {
    let mut matches = Vec::new();
    for pattern in patterns {
        let full_pattern = workspace_root.as_std_path().join(pattern);
        let full_pattern = full_pattern.to_string_lossy().into_owned();
        for entry in glob::glob(&full_pattern).with_context(|| format!("glob pattern {pattern}"))? {
            let path = entry.context("read glob match")?;
            if fs::is_file(&path).await {
                matches.push(AbsFilePath::try_from(path)?);
            }
        }
    }
    matches.sort();
    matches.dedup();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Command;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fingerprint_includes_cmd_globs_and_file_hashes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();

        let cmds = vec![Command::Shell("echo hi".to_string())];
        let patterns = vec!["*.txt".to_string()];
        let fingerprint = compute(&root, "ws", "build", &cmds, &patterns, &[])
            .await
            .unwrap();

        assert_eq!(fingerprint.get("cmd").unwrap(), "echo hi");
        assert_eq!(fingerprint.get("globs").unwrap(), "*.txt");
        assert!(fingerprint.contains_key("a.txt"));
    }

    #[tokio::test]
    async fn no_matches_is_no_inputs_error() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let cmds = vec![Command::Shell("echo hi".to_string())];
        let patterns = vec!["*.missing".to_string()];
        let err = compute(&root, "ws", "build", &cmds, &patterns, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no files matching"));
    }

    #[tokio::test]
    async fn differing_invocation_args_change_the_fingerprint() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let cmds = vec![Command::Shell("echo hi".to_string())];
        let patterns = vec!["*.txt".to_string()];

        let plain = compute(&root, "ws", "build", &cmds, &patterns, &[]).await.unwrap();
        let with_args = compute(
            &root,
            "ws",
            "build",
            &cmds,
            &patterns,
            &["--release".to_string()],
        )
        .await
        .unwrap();

        assert_ne!(plain, with_args);
    }
}

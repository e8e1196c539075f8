//! Version-control adapter used by the affected-set resolver.
//!
//! [`VcsProbe`] is a small, stateless-per-call trait so that tests can
//! substitute a fake implementation instead of shelling out to a real `git`
//! checkout. The production implementation, [`GitProbe`], is the only
//! implementation shipped; it shells out to the `git` binary the same way
//! the rest of the crate shells out to user-defined commands, just without
//! going through the cache.

use futures::future::{BoxFuture, FutureExt};
use tokio::process::Command;
use tracing::{instrument, trace, warn};

use crate::{
    error::VcsError,
    path::{AbsDirPath, RelFilePath},
};

/// Adapter over a version-control tool's read/write operations.
pub trait VcsProbe: Send + Sync {
    /// Whether the given revision identifier exists in the repository.
    fn revision_exists<'a>(&'a self, rev: &'a str) -> BoxFuture<'a, bool>;

    /// File paths (relative to the repository root) changed between `rev1`
    /// and `rev2`, or between `rev1` and the working tree if `rev2` is
    /// `None`. If `path_prefix` is given, the diff is scoped to that subtree.
    fn diff_names<'a>(
        &'a self,
        rev1: &'a str,
        rev2: Option<&'a str>,
        path_prefix: Option<&'a AbsDirPath>,
    ) -> BoxFuture<'a, color_eyre::Result<Vec<RelFilePath>>>;

    /// All tags known to the repository, optionally fetching from the
    /// remote first.
    fn tag_list<'a>(&'a self, fetch: bool) -> BoxFuture<'a, color_eyre::Result<Vec<String>>>;

    /// Create an annotated tag at the current `HEAD`.
    fn create_tag<'a>(&'a self, name: &'a str) -> BoxFuture<'a, color_eyre::Result<()>>;

    /// Stage and commit the given paths.
    fn commit<'a>(
        &'a self,
        paths: &'a [RelFilePath],
        message: &'a str,
    ) -> BoxFuture<'a, color_eyre::Result<()>>;

    /// Push the current branch along with any tags.
    fn push_including_tags<'a>(&'a self) -> BoxFuture<'a, color_eyre::Result<()>>;
}

/// A [`VcsProbe`] backed by shelling out to the `git` binary.
#[derive(Clone, Debug)]
pub struct GitProbe {
    root: AbsDirPath,
}

impl GitProbe {
    pub fn new(root: AbsDirPath) -> Self {
        Self { root }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(self.root.as_std_path());
        cmd
    }
}

impl VcsProbe for GitProbe {
    #[instrument(skip(self))]
    fn revision_exists<'a>(&'a self, rev: &'a str) -> BoxFuture<'a, bool> {
        async move {
            let status = self
                .command()
                .args(["cat-file", "-e", rev])
                .status()
                .await;
            matches!(status, Ok(status) if status.success())
        }
        .boxed()
    }

    #[instrument(skip(self, path_prefix))]
    fn diff_names<'a>(
        &'a self,
        rev1: &'a str,
        rev2: Option<&'a str>,
        path_prefix: Option<&'a AbsDirPath>,
    ) -> BoxFuture<'a, color_eyre::Result<Vec<RelFilePath>>> {
        async move {
            let mut cmd = self.command();
            cmd.args(["diff", "--name-only", rev1]);
            if let Some(rev2) = rev2 {
                cmd.arg(rev2);
            }
            if let Some(prefix) = path_prefix {
                cmd.arg("--").arg(prefix.as_std_path());
            }

            let output = cmd
                .output()
                .await
                .map_err(|err| VcsError::CommandFailed {
                    command: format!("git diff --name-only {rev1} {rev2:?}"),
                    source: color_eyre::Report::new(err),
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("unknown revision") || stderr.contains("bad revision") {
                    return Err(VcsError::BadRevision {
                        revision: rev1.to_string(),
                    }
                    .into());
                }
                return Err(VcsError::CommandFailed {
                    command: format!("git diff --name-only {rev1} {rev2:?}"),
                    source: color_eyre::eyre::eyre!("{stderr}"),
                }
                .into());
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let names = stdout
                .lines()
                .filter(|line| !line.is_empty())
                .map(RelFilePath::try_from)
                .collect::<color_eyre::Result<Vec<_>>>()?;
            trace!(count = names.len(), "diff names");
            Ok(names)
        }
        .boxed()
    }

    #[instrument(skip(self))]
    fn tag_list<'a>(&'a self, fetch: bool) -> BoxFuture<'a, color_eyre::Result<Vec<String>>> {
        async move {
            if fetch {
                let status = self
                    .command()
                    .args(["fetch", "--tags"])
                    .status()
                    .await
                    .map_err(|err| VcsError::CommandFailed {
                        command: "git fetch --tags".to_string(),
                        source: color_eyre::Report::new(err),
                    })?;
                if !status.success() {
                    warn!("git fetch --tags failed, listing local tags only");
                }
            }

            let output = self
                .command()
                .args(["tag", "--list"])
                .output()
                .await
                .map_err(|err| VcsError::CommandFailed {
                    command: "git tag --list".to_string(),
                    source: color_eyre::Report::new(err),
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(stdout
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect())
        }
        .boxed()
    }

    #[instrument(skip(self))]
    fn create_tag<'a>(&'a self, name: &'a str) -> BoxFuture<'a, color_eyre::Result<()>> {
        async move {
            let status = self
                .command()
                .args(["tag", "-a", name, "-m", name])
                .status()
                .await
                .map_err(|err| VcsError::CommandFailed {
                    command: format!("git tag -a {name}"),
                    source: color_eyre::Report::new(err),
                })?;
            if !status.success() {
                return Err(VcsError::CommandFailed {
                    command: format!("git tag -a {name}"),
                    source: color_eyre::eyre::eyre!("git exited with {status}"),
                }
                .into());
            }
            Ok(())
        }
        .boxed()
    }

    #[instrument(skip(self, paths))]
    fn commit<'a>(
        &'a self,
        paths: &'a [RelFilePath],
        message: &'a str,
    ) -> BoxFuture<'a, color_eyre::Result<()>> {
        async move {
            let mut add = self.command();
            add.arg("add").arg("--");
            for path in paths {
                add.arg(path.as_std_path());
            }
            let status = add.status().await.map_err(|err| VcsError::CommandFailed {
                command: "git add".to_string(),
                source: color_eyre::Report::new(err),
            })?;
            if !status.success() {
                return Err(VcsError::CommandFailed {
                    command: "git add".to_string(),
                    source: color_eyre::eyre::eyre!("git exited with {status}"),
                }
                .into());
            }

            let status = self
                .command()
                .args(["commit", "-m", message])
                .status()
                .await
                .map_err(|err| VcsError::CommandFailed {
                    command: "git commit".to_string(),
                    source: color_eyre::Report::new(err),
                })?;
            if !status.success() {
                return Err(VcsError::CommandFailed {
                    command: "git commit".to_string(),
                    source: color_eyre::eyre::eyre!("git exited with {status}"),
                }
                .into());
            }
            Ok(())
        }
        .boxed()
    }

    #[instrument(skip(self))]
    fn push_including_tags<'a>(&'a self) -> BoxFuture<'a, color_eyre::Result<()>> {
        async move {
            let status = self
                .command()
                .args(["push", "--follow-tags"])
                .status()
                .await
                .map_err(|err| VcsError::CommandFailed {
                    command: "git push --follow-tags".to_string(),
                    source: color_eyre::Report::new(err),
                })?;
            if !status.success() {
                return Err(VcsError::CommandFailed {
                    command: "git push --follow-tags".to_string(),
                    source: color_eyre::eyre::eyre!("git exited with {status}"),
                }
                .into());
            }
            Ok(())
        }
        .boxed()
    }
}

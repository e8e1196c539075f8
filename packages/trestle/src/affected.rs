//! Resolves which workspaces are "affected" by a version-control change.

use std::collections::HashMap;

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    error::VcsError,
    graph::WorkspaceGraph,
    manifest::Workspace,
    path::{AbsDirPath, JoinWith as _, RelativeTo as _},
    vcs::VcsProbe,
};

/// Computes affected-ness for a target across the workspace graph.
pub struct AffectedResolver<'a> {
    vcs: &'a dyn VcsProbe,
    project_root: &'a AbsDirPath,
}

impl<'a> AffectedResolver<'a> {
    pub fn new(vcs: &'a dyn VcsProbe, project_root: &'a AbsDirPath) -> Self {
        Self { vcs, project_root }
    }

    /// Whether `workspace` is affected by the changes between `rev1` and
    /// `rev2` (or the working tree, if `rev2` is `None`) for the given
    /// `target`. When `topological` is true, a dependency's own changes can
    /// also make `workspace` affected.
    #[instrument(skip(self, graph))]
    pub async fn resolve(
        &self,
        graph: &WorkspaceGraph,
        target: &str,
        workspace: &Workspace,
        rev1: &str,
        rev2: Option<&str>,
        topological: bool,
    ) -> Result<bool> {
        if !self.vcs.revision_exists(rev1).await {
            return Err(VcsError::BadRevision {
                revision: rev1.to_string(),
            }
            .into());
        }
        if let Some(rev2) = rev2
            && !self.vcs.revision_exists(rev2).await
        {
            return Err(VcsError::BadRevision {
                revision: rev2.to_string(),
            }
            .into());
        }

        let mut memo = HashMap::new();
        self.resolve_memoized(graph, target, workspace, rev1, rev2, topological, &mut memo)
            .await
    }

    fn resolve_memoized<'b>(
        &'b self,
        graph: &'b WorkspaceGraph,
        target: &'b str,
        workspace: &'b Workspace,
        rev1: &'b str,
        rev2: Option<&'b str>,
        topological: bool,
        memo: &'b mut HashMap<String, bool>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool>> + 'b>> {
        Box::pin(async move {
            if let Some(cached) = memo.get(&workspace.name) {
                return Ok(*cached);
            }

            let local = self.is_locally_affected(target, workspace, rev1, rev2).await?;
            if !topological || local {
                memo.insert(workspace.name.clone(), local);
                return Ok(local);
            }

            for dependency in graph.dependencies_of(&workspace.name) {
                if self
                    .resolve_memoized(graph, target, dependency, rev1, rev2, topological, memo)
                    .await?
                {
                    memo.insert(workspace.name.clone(), true);
                    return Ok(true);
                }
            }

            memo.insert(workspace.name.clone(), false);
            Ok(false)
        })
    }

    #[instrument(skip(self, workspace))]
    async fn is_locally_affected(
        &self,
        target: &str,
        workspace: &Workspace,
        rev1: &str,
        rev2: Option<&str>,
    ) -> Result<bool> {
        let diffs = self
            .vcs
            .diff_names(rev1, rev2, Some(&workspace.root))
            .await
            .context("diff names")?;

        let patterns = workspace
            .targets
            .get(target)
            .map(|t| t.src.clone())
            .unwrap_or_default();

        if patterns.is_empty() || (patterns.len() == 1 && patterns[0] == "**") {
            let affected = !diffs.is_empty();
            debug!(?affected, workspace = %workspace.name, "wildcard affected check");
            return Ok(affected);
        }

        let mut expanded = Vec::new();
        for pattern in &patterns {
            let full_pattern = workspace.root.as_std_path().join(pattern);
            let full_pattern = full_pattern.to_string_lossy().into_owned();
            for entry in glob::glob(&full_pattern).with_context(|| format!("glob pattern {pattern}"))? {
                let path = entry.context("read glob match")?;
                let abs = crate::path::AbsFilePath::try_from(path)?;
                let rel = abs.relative_to(self.project_root).context("relativize match")?;
                expanded.push(rel);
            }
        }

        let affected = diffs.iter().any(|diff| expanded.contains(diff));
        debug!(?affected, workspace = %workspace.name, "glob affected check");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manifest::TargetConfig, path::RelFilePath};
    use futures::future::{BoxFuture, FutureExt};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    struct FakeVcs {
        diffs: Vec<RelFilePath>,
    }

    impl VcsProbe for FakeVcs {
        fn revision_exists<'a>(&'a self, _rev: &'a str) -> BoxFuture<'a, bool> {
            async { true }.boxed()
        }

        fn diff_names<'a>(
            &'a self,
            _rev1: &'a str,
            _rev2: Option<&'a str>,
            _path_prefix: Option<&'a AbsDirPath>,
        ) -> BoxFuture<'a, Result<Vec<RelFilePath>>> {
            async move { Ok(self.diffs.clone()) }.boxed()
        }

        fn tag_list<'a>(&'a self, _fetch: bool) -> BoxFuture<'a, Result<Vec<String>>> {
            async { Ok(Vec::new()) }.boxed()
        }

        fn create_tag<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn commit<'a>(&'a self, _paths: &'a [RelFilePath], _message: &'a str) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn push_including_tags<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    fn workspace(name: &str, deps: &[&str], target_patterns: Option<&[&str]>) -> Workspace {
        let mut targets = BTreeMap::new();
        if let Some(patterns) = target_patterns {
            targets.insert(
                "build".to_string(),
                TargetConfig {
                    cmd: vec![crate::manifest::Command::Shell("true".to_string())],
                    src: patterns.iter().map(|p| p.to_string()).collect(),
                },
            );
        }
        Workspace {
            name: name.to_string(),
            root: AbsDirPath::current().unwrap(),
            version: None,
            private: false,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            targets,
        }
    }

    #[tokio::test]
    async fn wildcard_pattern_is_affected_by_any_diff() {
        let vcs = FakeVcs {
            diffs: vec![crate::path::mk_rel_file!("src/lib.rs")],
        };
        let root = AbsDirPath::current().unwrap();
        let resolver = AffectedResolver::new(&vcs, &root);
        let graph = WorkspaceGraph::new(vec![workspace("a", &[], Some(&["**"]))]).unwrap();
        let workspace = graph.get("a").unwrap();

        let affected = resolver
            .resolve(&graph, "build", workspace, "HEAD~1", None, false)
            .await
            .unwrap();
        assert!(affected);
    }

    #[tokio::test]
    async fn unaffected_dependency_does_not_propagate() {
        let vcs = FakeVcs { diffs: vec![] };
        let root = AbsDirPath::current().unwrap();
        let resolver = AffectedResolver::new(&vcs, &root);
        let graph = WorkspaceGraph::new(vec![
            workspace("workspace-a", &[], Some(&["**"])),
            workspace("app-a", &["workspace-a"], Some(&["**"])),
        ])
        .unwrap();
        let app = graph.get("app-a").unwrap();

        let affected = resolver
            .resolve(&graph, "build", app, "HEAD~1", None, true)
            .await
            .unwrap();
        assert_eq!(affected, false);
    }
}

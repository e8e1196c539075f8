//! Builds an [`OrderedTargets`] execution plan for a `run_command` call.

use std::collections::{BTreeSet, HashSet};

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{affected::AffectedResolver, graph::WorkspaceGraph, manifest::Workspace};

/// Whether a plan executes every eligible workspace at once, or layers them
/// by dependency order.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Parallel,
    Topological,
}

/// Which child-process stdio handling a run requests.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Capture stdout/stderr (and a combined interleaving) for each command.
    #[default]
    Capture,
    /// Pass the child's stdio through to this process's own, uncaptured.
    Inherit,
}

/// Caller-supplied options for one `run_command` invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOptions {
    pub mode: Mode,
    #[serde(default)]
    pub force: bool,
    /// `(rev1, rev2?)`; absent means "every eligible workspace is affected".
    #[serde(default)]
    pub affected: Option<(String, Option<String>)>,
    #[serde(default)]
    pub stdio: StdioMode,
    /// Topological mode only: run up to (and including) this workspace.
    #[serde(default)]
    pub to: Option<String>,
    /// Parallel mode only: restrict to this workspace set. Absent means all.
    #[serde(default)]
    pub workspaces: Option<BTreeSet<String>>,
    /// Maximum number of tasks running concurrently within a step.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

/// One workspace's resolved eligibility for the requested target.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub workspace: String,
    pub affected: bool,
    pub has_command: bool,
}

/// A set of workspaces eligible to run concurrently.
pub type Step = Vec<ResolvedTarget>;

/// The full plan for one `run_command` invocation: steps execute in strict
/// sequence, tasks within a step may run concurrently.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct OrderedTargets {
    pub steps: Vec<Step>,
}

impl OrderedTargets {
    /// The step index containing `workspace`, if any.
    pub fn step_of(&self, workspace: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.iter().any(|t| t.workspace == workspace))
    }

    /// The [`ResolvedTarget`] for `workspace`, if it is part of this plan.
    pub fn resolved(&self, workspace: &str) -> Option<&ResolvedTarget> {
        self.steps
            .iter()
            .flatten()
            .find(|t| t.workspace == workspace)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|step| step.is_empty())
    }
}

/// Builds an [`OrderedTargets`] plan from a target name, the workspace graph,
/// and [`RunOptions`].
pub struct TargetsResolver<'a> {
    graph: &'a WorkspaceGraph,
    affected: &'a AffectedResolver<'a>,
}

impl<'a> TargetsResolver<'a> {
    pub fn new(graph: &'a WorkspaceGraph, affected: &'a AffectedResolver<'a>) -> Self {
        Self { graph, affected }
    }

    #[instrument(skip(self, options))]
    pub async fn resolve(&self, target: &str, options: &RunOptions) -> Result<OrderedTargets> {
        match options.mode {
            Mode::Parallel => self.resolve_parallel(target, options).await,
            Mode::Topological => self.resolve_topological(target, options).await,
        }
    }

    async fn resolve_parallel(&self, target: &str, options: &RunOptions) -> Result<OrderedTargets> {
        let eligible: Vec<&Workspace> = match &options.workspaces {
            Some(names) => names
                .iter()
                .filter_map(|name| self.graph.get(name))
                .collect(),
            None => self.graph.workspaces().collect(),
        };

        let mut step = Step::with_capacity(eligible.len());
        for workspace in eligible {
            let affected = self
                .resolve_affected(target, workspace, &options.affected, false)
                .await?;
            step.push(ResolvedTarget {
                workspace: workspace.name.clone(),
                affected,
                has_command: workspace.has_command(target),
            });
        }

        Ok(OrderedTargets { steps: vec![step] })
    }

    async fn resolve_topological(
        &self,
        target: &str,
        options: &RunOptions,
    ) -> Result<OrderedTargets> {
        let ordered = self.graph.topological(options.to.as_deref());
        let eligible: HashSet<&str> = ordered.iter().map(|w| w.name.as_str()).collect();

        let mut steps: Vec<Step> = Vec::new();
        let mut placed: HashSet<String> = HashSet::new();

        let mut remaining = ordered;
        while !remaining.is_empty() {
            let mut step = Step::new();
            let mut leftover = Vec::new();

            for workspace in remaining {
                let deps_ready = workspace
                    .dependencies
                    .iter()
                    .filter(|dep| eligible.contains(dep.as_str()))
                    .all(|dep| placed.contains(dep));

                if deps_ready {
                    let affected = self
                        .resolve_affected(target, workspace, &options.affected, true)
                        .await?;
                    step.push(ResolvedTarget {
                        workspace: workspace.name.clone(),
                        affected,
                        has_command: workspace.has_command(target),
                    });
                } else {
                    leftover.push(workspace);
                }
            }

            for resolved in &step {
                placed.insert(resolved.workspace.clone());
            }
            steps.push(step);
            remaining = leftover;
        }

        Ok(OrderedTargets { steps })
    }

    async fn resolve_affected(
        &self,
        target: &str,
        workspace: &Workspace,
        affected_range: &Option<(String, Option<String>)>,
        topological: bool,
    ) -> Result<bool> {
        let Some((rev1, rev2)) = affected_range else {
            return Ok(true);
        };
        self.affected
            .resolve(
                self.graph,
                target,
                workspace,
                rev1,
                rev2.as_deref(),
                topological,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manifest::TargetConfig, manifest::Command, path::AbsDirPath, vcs::VcsProbe};
    use futures::future::{BoxFuture, FutureExt};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    struct AlwaysAffectedVcs;

    impl VcsProbe for AlwaysAffectedVcs {
        fn revision_exists<'a>(&'a self, _rev: &'a str) -> BoxFuture<'a, bool> {
            async { true }.boxed()
        }

        fn diff_names<'a>(
            &'a self,
            _rev1: &'a str,
            _rev2: Option<&'a str>,
            _path_prefix: Option<&'a AbsDirPath>,
        ) -> BoxFuture<'a, Result<Vec<crate::path::RelFilePath>>> {
            async { Ok(vec![crate::path::mk_rel_file!("src/lib.rs")]) }.boxed()
        }

        fn tag_list<'a>(&'a self, _fetch: bool) -> BoxFuture<'a, Result<Vec<String>>> {
            async { Ok(Vec::new()) }.boxed()
        }

        fn create_tag<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn commit<'a>(
            &'a self,
            _paths: &'a [crate::path::RelFilePath],
            _message: &'a str,
        ) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn push_including_tags<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    fn workspace(name: &str, deps: &[&str], has_target: bool) -> Workspace {
        let mut targets = BTreeMap::new();
        if has_target {
            targets.insert(
                "build".to_string(),
                TargetConfig {
                    cmd: vec![Command::Shell("true".to_string())],
                    src: vec!["**".to_string()],
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

    fn options(mode: Mode) -> RunOptions {
        RunOptions {
            mode,
            force: false,
            affected: None,
            stdio: StdioMode::default(),
            to: None,
            workspaces: None,
            concurrency: 4,
        }
    }

    #[tokio::test]
    async fn parallel_mode_produces_one_step_with_every_workspace() {
        let graph = WorkspaceGraph::new(vec![
            workspace("a", &[], true),
            workspace("b", &["a"], true),
        ])
        .unwrap();
        let root = AbsDirPath::current().unwrap();
        let vcs = AlwaysAffectedVcs;
        let affected = AffectedResolver::new(&vcs, &root);
        let resolver = TargetsResolver::new(&graph, &affected);

        let plan = resolver.resolve("build", &options(Mode::Parallel)).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].len(), 2);
        assert!(plan.steps[0].iter().all(|t| t.affected && t.has_command));
    }

    #[tokio::test]
    async fn topological_mode_layers_by_dependency() {
        let graph = WorkspaceGraph::new(vec![
            workspace("a", &[], true),
            workspace("b", &["a"], true),
            workspace("c", &["b"], true),
        ])
        .unwrap();
        let root = AbsDirPath::current().unwrap();
        let vcs = AlwaysAffectedVcs;
        let affected = AffectedResolver::new(&vcs, &root);
        let resolver = TargetsResolver::new(&graph, &affected);

        let plan = resolver
            .resolve("build", &options(Mode::Topological))
            .await
            .unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0][0].workspace, "a");
        assert_eq!(plan.steps[1][0].workspace, "b");
        assert_eq!(plan.steps[2][0].workspace, "c");
    }

    #[tokio::test]
    async fn workspace_without_command_is_marked_unresolvable() {
        let graph = WorkspaceGraph::new(vec![workspace("a", &[], false)]).unwrap();
        let root = AbsDirPath::current().unwrap();
        let vcs = AlwaysAffectedVcs;
        let affected = AffectedResolver::new(&vcs, &root);
        let resolver = TargetsResolver::new(&graph, &affected);

        let plan = resolver.resolve("build", &options(Mode::Parallel)).await.unwrap();
        assert!(!plan.steps[0][0].has_command);
    }
}

//! The workspace dependency graph.
//!
//! Workspaces are loaded once at startup and never mutated; the graph is
//! rebuilt from scratch on each `trestle` invocation rather than cached, since
//! the source-of-truth (the manifests on disk) can change between runs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::instrument;

use crate::{error::ProjectLoadError, manifest::Workspace};

/// The full set of workspaces in a project, with dependency edges resolved.
///
/// Only edges between two *known* workspaces are tracked; a `dependencies`
/// entry naming a package that isn't a workspace in this project is ignored
/// for graph purposes (it may be an external registry dependency).
#[derive(Debug, Clone)]
pub struct WorkspaceGraph {
    workspaces: BTreeMap<String, Workspace>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl WorkspaceGraph {
    /// Build a graph from the given workspaces, rejecting dependency cycles.
    #[instrument(skip(workspaces))]
    pub fn new(workspaces: Vec<Workspace>) -> Result<Self, ProjectLoadError> {
        let workspaces: BTreeMap<String, Workspace> =
            workspaces.into_iter().map(|w| (w.name.clone(), w)).collect();

        let mut dependents: BTreeMap<String, BTreeSet<String>> = workspaces
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for (name, workspace) in &workspaces {
            for dep in &workspace.dependencies {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(name.clone());
                }
            }
        }

        let graph = Self {
            workspaces,
            dependents,
        };
        graph.assert_acyclic()?;
        Ok(graph)
    }

    fn assert_acyclic(&self) -> Result<(), ProjectLoadError> {
        #[derive(Copy, Clone, Eq, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        fn visit<'a>(
            graph: &'a WorkspaceGraph,
            name: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Result<(), ProjectLoadError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(ProjectLoadError::Cycle {
                        workspace: name.to_string(),
                    });
                }
                None => {}
            }
            marks.insert(name, Mark::InProgress);
            if let Some(workspace) = graph.workspaces.get(name) {
                for dep in &workspace.dependencies {
                    if graph.workspaces.contains_key(dep) {
                        visit(graph, dep, marks)?;
                    }
                }
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        for name in self.workspaces.keys() {
            visit(self, name, &mut marks)?;
        }
        Ok(())
    }

    /// All workspaces known to the graph, in manifest-name order.
    pub fn workspaces(&self) -> impl Iterator<Item = &Workspace> {
        self.workspaces.values()
    }

    /// Look up a workspace by name.
    pub fn get(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.get(name)
    }

    /// The direct dependencies of `name` that are themselves known workspaces.
    pub fn dependencies_of(&self, name: &str) -> Vec<&Workspace> {
        let Some(workspace) = self.workspaces.get(name) else {
            return Vec::new();
        };
        workspace
            .dependencies
            .iter()
            .filter_map(|dep| self.workspaces.get(dep))
            .collect()
    }

    /// The direct dependents of `name`: workspaces that declare `name` as a
    /// dependency. Computed once at construction, not searched on demand.
    pub fn dependents_of(&self, name: &str) -> Vec<&Workspace> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|dependent| self.workspaces.get(dependent))
            .collect()
    }

    /// A topological ordering (dependencies before dependents) of every
    /// workspace reachable from `to` via dependency edges, or of every
    /// workspace in the graph if `to` is `None`.
    #[instrument(skip(self))]
    pub fn topological(&self, to: Option<&str>) -> Vec<&Workspace> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();

        let roots: Vec<&str> = match to {
            Some(name) => vec![name],
            None => self.workspaces.keys().map(String::as_str).collect(),
        };

        for root in roots {
            self.visit_postorder(root, &mut visited, &mut order);
        }
        order
    }

    fn visit_postorder<'a>(
        &'a self,
        name: &str,
        visited: &mut BTreeSet<String>,
        order: &mut Vec<&'a Workspace>,
    ) {
        if visited.contains(name) {
            return;
        }
        visited.insert(name.to_string());
        let Some(workspace) = self.workspaces.get(name) else {
            return;
        };
        for dep in &workspace.dependencies {
            if self.workspaces.contains_key(dep) {
                self.visit_postorder(dep, visited, order);
            }
        }
        order.push(workspace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::AbsDirPath;
    use pretty_assertions::assert_eq;

    fn workspace(name: &str, deps: &[&str]) -> Workspace {
        Workspace {
            name: name.to_string(),
            root: AbsDirPath::current().unwrap(),
            version: None,
            private: false,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            targets: Default::default(),
        }
    }

    #[test]
    fn topological_orders_dependencies_before_dependents() {
        let graph = WorkspaceGraph::new(vec![
            workspace("workspace-a", &[]),
            workspace("workspace-c", &[]),
            workspace("workspace-b", &["workspace-a"]),
            workspace("app-a", &["workspace-a", "workspace-c"]),
            workspace("api", &["workspace-b", "app-a"]),
            workspace("app-b", &["api"]),
        ])
        .unwrap();

        let order: Vec<&str> = graph.topological(None).into_iter().map(|w| w.name.as_str()).collect();
        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();

        assert!(pos("workspace-a") < pos("workspace-b"));
        assert!(pos("workspace-a") < pos("app-a"));
        assert!(pos("workspace-c") < pos("app-a"));
        assert!(pos("workspace-b") < pos("api"));
        assert!(pos("app-a") < pos("api"));
        assert!(pos("api") < pos("app-b"));
    }

    #[test]
    fn cycle_is_rejected() {
        let err = WorkspaceGraph::new(vec![
            workspace("a", &["b"]),
            workspace("b", &["a"]),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "dependency cycle detected, first revisited workspace: a"
        );
    }

    #[test]
    fn dependents_of_is_inverse_adjacency() {
        let graph = WorkspaceGraph::new(vec![
            workspace("workspace-a", &[]),
            workspace("app-a", &["workspace-a"]),
            workspace("app-b", &["workspace-a"]),
        ])
        .unwrap();
        let mut dependents: Vec<&str> = graph
            .dependents_of("workspace-a")
            .into_iter()
            .map(|w| w.name.as_str())
            .collect();
        dependents.sort_unstable();
        assert_eq!(dependents, vec!["app-a", "app-b"]);
    }

    #[test]
    fn unknown_dependency_is_ignored() {
        let graph = WorkspaceGraph::new(vec![workspace("only", &["missing"])]).unwrap();
        assert!(graph.dependencies_of("only").is_empty());
    }
}

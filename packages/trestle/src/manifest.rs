//! Project, workspace, and target-configuration manifests.
//!
//! A project root carries a `workspace.json` manifest naming the glob
//! patterns under which member workspaces live (mirroring the `workspaces`
//! field of an npm-style root manifest). Each member workspace root carries
//! its own `workspace.json` (identity + dependency edges) and an optional
//! `targets.json` (the commands it knows how to run), split the way
//! `turbo.json` is split from `package.json` in a JS monorepo, so that
//! dependency edges and runnable commands can be loaded independently.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::ProjectLoadError,
    fs,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, TryJoinWith as _, mk_rel_file},
};

const WORKSPACE_MANIFEST_FILE: &str = "workspace.json";
const TARGET_CONFIG_FILE: &str = "targets.json";

/// A fully resolved workspace: identity, graph edges, and runnable targets.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub root: AbsDirPath,
    pub version: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

impl Workspace {
    /// Whether this workspace knows how to run the named target.
    pub fn has_command(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }
}

/// The shape of a workspace's `workspace.json` on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WorkspaceManifestFile {
    name: String,
    version: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: BTreeMap<String, String>,
    /// Only meaningful at the project root: glob patterns (relative to the
    /// root) under which member workspace directories live.
    #[serde(default)]
    workspaces: Vec<String>,
}

/// A single command run as part of a target.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// A plain shell command.
    Shell(String),
    /// A command that may additionally run as a supervised daemon.
    WithDaemon {
        run: String,
        #[serde(default)]
        daemon: Option<DaemonSpecField>,
    },
}

impl Command {
    /// The literal command string to hand the shell, regardless of variant.
    pub fn run_str(&self) -> &str {
        match self {
            Command::Shell(run) => run,
            Command::WithDaemon { run, .. } => run,
        }
    }

    /// The daemon log conditions attached to this command, if any.
    pub fn daemon_conditions(&self) -> &[LogCondition] {
        match self {
            Command::Shell(_) => &[],
            Command::WithDaemon { daemon, .. } => daemon
                .as_ref()
                .map(DaemonSpecField::as_slice)
                .unwrap_or(&[]),
        }
    }
}

/// `daemon` may be a single condition or a list of conditions.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaemonSpecField {
    One(LogCondition),
    Many(Vec<LogCondition>),
}

impl DaemonSpecField {
    fn as_slice(&self) -> &[LogCondition] {
        match self {
            DaemonSpecField::One(cond) => std::slice::from_ref(cond),
            DaemonSpecField::Many(conds) => conds,
        }
    }
}

/// Which stream of a child process a [`LogCondition`] watches.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stdio {
    Stdout,
    Stderr,
    All,
}

/// Whether a matched condition indicates the daemon succeeded or failed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Success,
    Failure,
}

const DEFAULT_CONDITION_TIMEOUT_MS: u64 = 120_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_CONDITION_TIMEOUT_MS
}

/// A single readiness/failure condition evaluated against a daemon's output.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct LogCondition {
    pub stdio: Stdio,
    /// Only `"contains"` is recognized; anything else is a configuration
    /// error raised at target-config parse time.
    pub matcher: String,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl LogCondition {
    fn validate(&self, target: &str) -> Result<(), ProjectLoadError> {
        if self.matcher != "contains" {
            return Err(ProjectLoadError::UnknownMatcher {
                target: target.to_string(),
                matcher: self.matcher.clone(),
            });
        }
        Ok(())
    }

    /// Whether the given line satisfies this condition.
    pub fn matches(&self, line: &str) -> bool {
        line.contains(self.value.as_str())
    }
}

/// A named, runnable command, plus the source globs that fingerprint it.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(deserialize_with = "deserialize_one_or_many")]
    pub cmd: Vec<Command>,
    #[serde(default)]
    pub src: Vec<String>,
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<Command>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Command),
        Many(Vec<Command>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(cmd) => vec![cmd],
        OneOrMany::Many(cmds) => cmds,
    })
}

/// The shape of a workspace's optional `targets.json` on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TargetConfigFile {
    #[serde(default)]
    targets: BTreeMap<String, TargetConfig>,
    extends: Option<String>,
}

/// Load the full project: discover member workspaces from the root manifest's
/// `workspaces` globs, parse each one, and resolve its target configuration.
///
/// The project root itself is included as a workspace when it carries a
/// `workspace.json` naming a target-bearing identity (i.e. it participates
/// like any other workspace, in addition to declaring `workspaces`).
pub async fn load_project(root: &AbsDirPath) -> Result<Vec<Workspace>> {
    let root_manifest_path = root.try_join_file(WORKSPACE_MANIFEST_FILE)?;
    let root_manifest = read_manifest_file(&root_manifest_path).await?;

    let mut dirs = vec![root.clone()];
    for pattern in &root_manifest.workspaces {
        dirs.extend(expand_workspace_glob(root, pattern)?);
    }

    let mut workspaces = Vec::with_capacity(dirs.len());
    for dir in dirs {
        if let Some(workspace) = load_workspace(&dir).await? {
            workspaces.push(workspace);
        }
    }
    Ok(workspaces)
}

fn expand_workspace_glob(root: &AbsDirPath, pattern: &str) -> Result<Vec<AbsDirPath>> {
    let full_pattern = root.as_std_path().join(pattern);
    let full_pattern = full_pattern.to_string_lossy().into_owned();
    let mut dirs = Vec::new();
    let paths = glob::glob(&full_pattern).map_err(|source| ProjectLoadError::BadWorkspaceGlob {
        pattern: pattern.to_string(),
        source: color_eyre::Report::new(source),
    })?;
    for entry in paths {
        let path = entry.with_context(|| format!("read glob match for pattern {pattern:?}"))?;
        if fs::is_dir(&path).await {
            dirs.push(AbsDirPath::try_from(path)?);
        }
    }
    Ok(dirs)
}

/// Load a single workspace directory's manifest and target configuration.
///
/// Returns `Ok(None)` if the directory has no `workspace.json`, so that
/// glob-matched directories which are not actually workspaces (e.g. a
/// `node_modules`-style incidental match) are silently skipped.
async fn load_workspace(dir: &AbsDirPath) -> Result<Option<Workspace>> {
    let manifest_path = dir.try_join_file(WORKSPACE_MANIFEST_FILE)?;
    if !manifest_path.exists().await {
        return Ok(None);
    }
    let manifest = read_manifest_file(&manifest_path).await?;

    let mut dependencies: BTreeSet<String> = manifest.dependencies.into_keys().collect();
    dependencies.extend(manifest.dev_dependencies.into_keys());

    let targets = load_target_config(dir, &manifest.name).await?;

    Ok(Some(Workspace {
        name: manifest.name,
        root: dir.clone(),
        version: manifest.version,
        private: manifest.private,
        dependencies,
        targets,
    }))
}

async fn read_manifest_file(path: &AbsFilePath) -> Result<WorkspaceManifestFile> {
    let contents =
        fs::must_read_buffered_utf8(path)
            .await
            .map_err(|source| ProjectLoadError::UnreadableManifest {
                path: path.clone(),
                source,
            })?;
    serde_json::from_str(&contents).map_err(|err| {
        ProjectLoadError::UnreadableManifest {
            path: path.clone(),
            source: color_eyre::Report::new(err),
        }
        .into()
    })
}

async fn load_target_config(
    dir: &AbsDirPath,
    workspace_name: &str,
) -> Result<BTreeMap<String, TargetConfig>> {
    let config_path = dir.join(mk_rel_file!("targets.json"));
    let mut visited = HashSet::new();
    let targets = resolve_target_chain(&config_path, &mut visited).await?;
    for (name, target) in &targets {
        for command in &target.cmd {
            for condition in command.daemon_conditions() {
                condition
                    .validate(name)
                    .with_context(|| format!("target `{name}` in workspace `{workspace_name}`"))?;
            }
        }
    }
    Ok(targets)
}

fn resolve_target_chain<'a>(
    path: &'a AbsFilePath,
    visited: &'a mut HashSet<AbsFilePath>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<BTreeMap<String, TargetConfig>>> + 'a>>
{
    Box::pin(async move {
        if !path.exists().await {
            return Ok(BTreeMap::new());
        }
        if !visited.insert(path.clone()) {
            bail!(ProjectLoadError::ExtendsCycle { path: path.clone() });
        }

        let contents = fs::must_read_buffered_utf8(path)
            .await
            .with_context(|| format!("read target config {path}"))?;
        let file: TargetConfigFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse target config {path}"))?;

        let mut merged = if let Some(extends) = &file.extends {
            let parent = path
                .parent()
                .with_context(|| format!("get parent directory of {path}"))?;
            let base_path = parent.try_join_file(extends.as_str())?;
            if &base_path == path {
                bail!(ProjectLoadError::ExtendsCycle { path: path.clone() });
            }
            resolve_target_chain(&base_path, visited).await?
        } else {
            BTreeMap::new()
        };

        for (name, target) in file.targets {
            merged.insert(name, target);
        }

        Ok(merged)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn log_condition_rejects_unknown_matcher() {
        let cond = LogCondition {
            stdio: Stdio::Stdout,
            matcher: "regex".to_string(),
            value: "ready".to_string(),
            kind: ConditionKind::Success,
            timeout_ms: 1000,
        };
        let err = cond.validate("serve").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown log condition matcher `regex` on target `serve`"
        );
    }

    #[test]
    fn log_condition_contains_matches_substring() {
        let cond = LogCondition {
            stdio: Stdio::Stdout,
            matcher: "contains".to_string(),
            value: "listening on".to_string(),
            kind: ConditionKind::Success,
            timeout_ms: 1000,
        };
        assert!(cond.matches("server listening on :8080"));
        assert!(!cond.matches("server starting"));
    }

    #[test]
    fn command_variants_expose_run_str() {
        let plain: Command = serde_json::from_str("\"echo hi\"").unwrap();
        assert_eq!(plain.run_str(), "echo hi");

        let with_daemon: Command = serde_json::from_str(
            r#"{"run": "serve", "daemon": {"stdio": "stdout", "matcher": "contains", "value": "ready", "type": "success"}}"#,
        )
        .unwrap();
        assert_eq!(with_daemon.run_str(), "serve");
        assert_eq!(with_daemon.daemon_conditions().len(), 1);
    }
}

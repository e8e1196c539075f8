//! Typed error taxonomy for `trestle`'s components.
//!
//! Each component in this crate raises one of the enums below instead of an
//! opaque [`color_eyre::Report`]; callers that need to branch on failure mode
//! (the scheduler deciding whether a failure is recoverable, tests asserting
//! a specific rejection) match on these variants. Contextual wrapping still
//! happens with `color_eyre`/`eyre::Context` at the call site, matching the
//! ambient error-reporting style used throughout the rest of the crate.

use crate::path::{AbsDirPath, AbsFilePath};

/// Failures while discovering or loading the workspace graph and manifests.
#[derive(Debug, thiserror::Error)]
pub enum ProjectLoadError {
    #[error("dependency cycle detected, first revisited workspace: {workspace}")]
    Cycle { workspace: String },

    #[error("unreadable manifest at {path}")]
    UnreadableManifest {
        path: AbsFilePath,
        #[source]
        source: color_eyre::Report,
    },

    #[error("workspace glob pattern is invalid: {pattern}")]
    BadWorkspaceGlob {
        pattern: String,
        #[source]
        source: color_eyre::Report,
    },

    #[error("target configuration `extends` chain cycles back to {path}")]
    ExtendsCycle { path: AbsFilePath },

    #[error("unknown log condition matcher `{matcher}` on target `{target}`")]
    UnknownMatcher { target: String, matcher: String },
}

/// Failures communicating with the version-control tool.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("revision does not exist: {revision}")]
    BadRevision { revision: String },

    #[error("vcs command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: color_eyre::Report,
    },
}

/// Failures reading, writing, or invalidating the on-disk cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("target `{target}` in workspace `{workspace}` has no files matching its `src` globs")]
    NoInputs { workspace: String, target: String },

    #[error("failed to invalidate cache for `{workspace}`/`{target}` at {dir}")]
    InvalidationFailed {
        workspace: String,
        target: String,
        dir: AbsDirPath,
        #[source]
        source: color_eyre::Report,
    },
}

/// Failures spawning or communicating with a child process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command exited with status {code}: {command}")]
    Exit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn command: {command}")]
    SpawnFailed {
        command: String,
        #[source]
        source: color_eyre::Report,
    },
}

/// Failures supervising a long-lived daemon process via its log conditions.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon reported failure condition: {}", .condition.value)]
    Failure {
        condition: crate::manifest::LogCondition,
    },

    #[error("daemon did not satisfy condition `{}` within {timeout_ms}ms", .condition.value)]
    Timeout {
        condition: crate::manifest::LogCondition,
        timeout_ms: u64,
    },

    #[error("daemon process exited before any condition resolved, status: {status}")]
    Crashed { status: String },
}

/// Failures in the scheduler itself, raised before plan execution begins.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no target named `{target}` is defined by any selected workspace")]
    UnknownTarget { target: String },

    #[error("failed to invalidate cache while executing the plan")]
    ErrorInvalidatingCache {
        #[source]
        source: CacheError,
    },
}

//! The closed set of events the [`crate::scheduler::Scheduler`] emits.
//!
//! Consumers iterate a stream of `Result<RunCommandEvent>`: every `Ok` is one
//! of the variants below, and an `Err` ends the stream (only
//! [`ErrorInvalidatingCache`](RunCommandEvent::ErrorInvalidatingCache) and a
//! topological [`NodeErrored`](RunCommandEvent::NodeErrored) ever cause one).

use serde::{Deserialize, Serialize};

use crate::{cache::CommandResult, plan::ResolvedTarget};

/// The kind of raw filesystem change a watch-mode [`RunCommandEvent::SourcesChanged`]
/// carries, mirroring the `chokidar`-style taxonomy the original tool watched.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
}

/// One event in a `run_command` invocation's event stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunCommandEvent {
    /// Always the first event, emitted exactly once, once the plan is built.
    TargetsResolved { targets: Vec<ResolvedTarget> },

    /// A workspace's task has begun executing (cache checked, about to run
    /// or already running its commands).
    NodeStarted { workspace: String },

    /// A workspace's task finished without error, either from cache or by
    /// actually running its commands.
    NodeProcessed {
        workspace: String,
        results: Vec<CommandResult>,
        from_cache: bool,
    },

    /// A workspace's task failed.
    NodeErrored { workspace: String, error: String },

    /// A workspace was not run this pass, either because it isn't affected
    /// by the requested revision range or because it doesn't define the
    /// target at all.
    NodeSkipped {
        workspace: String,
        affected: bool,
        has_command: bool,
    },

    /// A workspace's in-flight task was killed in reaction to a watch-mode
    /// source change. Its eventual `NodeProcessed` (if any) is swallowed.
    NodeInterrupted { workspace: String },

    /// A workspace's cache entry was removed because its step (or an
    /// earlier step, in topological mode) errored or rebuilt.
    CacheInvalidated { workspace: String },

    /// Invalidating a workspace's cache entry failed for a reason other than
    /// "the files were already gone". Fatal: the stream errors immediately
    /// after this event.
    ErrorInvalidatingCache { workspace: String, error: String },

    /// Watch mode only: a workspace's source files changed on disk.
    SourcesChanged {
        workspace: String,
        fs_event_kind: ChangeKind,
        path: String,
    },
}

//! Builds a plan for a target and drives it to completion, emitting the
//! [`RunCommandEvent`] stream a `run_command` caller consumes.
//!
//! Non-watch execution and watch-mode reactive rescheduling share one code
//! path: the step loop always tracks a "current step" cursor, and a watch
//! batch arriving after the whole plan has already finished is treated the
//! same way as one arriving mid-run, just against a cursor parked past the
//! last step.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use color_eyre::{Result, eyre::eyre};
use flume::{Receiver, Sender};
use tokio::sync::watch;
use tracing::{instrument, warn};

use crate::{
    affected::AffectedResolver,
    cache::{CacheEntry, CacheStore, CommandResult},
    error::SchedulerError,
    events::RunCommandEvent,
    fingerprint,
    graph::WorkspaceGraph,
    manifest::Workspace,
    path::AbsDirPath,
    plan::{Mode, OrderedTargets, ResolvedTarget, RunOptions, StdioMode, TargetsResolver},
    process::{ProcessRegistry, ProcessRunner},
    vcs::VcsProbe,
    watcher::{WatchEvent, Watcher},
};

/// Watch-mode knobs for a `run_command` call. Absent means a single pass.
#[derive(Clone, Debug)]
pub struct WatchOptions {
    pub debounce_ms: u64,
}

/// A live `run_command` invocation: its event stream plus an `unwatch` handle.
pub struct RunCommandHandle {
    events: Receiver<Result<RunCommandEvent>>,
    abort: watch::Sender<bool>,
}

impl RunCommandHandle {
    /// The next event in the stream, or `None` once it has ended.
    pub async fn next(&self) -> Option<Result<RunCommandEvent>> {
        self.events.recv_async().await.ok()
    }

    /// Adapt this handle into a [`futures::Stream`], for `while let` consumers.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<RunCommandEvent>> {
        self.events.into_stream()
    }

    /// Stop watching. Already-running tasks finish; the stream then ends.
    pub fn unwatch(&self) {
        let _ = self.abort.send(true);
    }
}

/// Builds plans and drives them: the sole entry point for `run_command`.
#[derive(Clone)]
pub struct Scheduler {
    graph: Arc<WorkspaceGraph>,
    vcs: Arc<dyn VcsProbe>,
    project_root: Arc<AbsDirPath>,
    registry: ProcessRegistry,
    process: ProcessRunner,
}

impl Scheduler {
    pub fn new(graph: Arc<WorkspaceGraph>, vcs: Arc<dyn VcsProbe>, project_root: Arc<AbsDirPath>) -> Self {
        let registry = ProcessRegistry::new();
        let process = ProcessRunner::new(registry.clone());
        Self {
            graph,
            vcs,
            project_root,
            registry,
            process,
        }
    }

    pub fn graph(&self) -> &WorkspaceGraph {
        &self.graph
    }

    /// Resolve and begin executing `target`. Returns a handle to the event
    /// stream immediately; the plan itself resolves and runs on a background
    /// task, with `TargetsResolved` always its first event.
    #[instrument(skip(self, options, args, env))]
    pub fn run_command(
        &self,
        target: &str,
        options: RunOptions,
        args: Vec<String>,
        env: HashMap<String, String>,
        watch: Option<WatchOptions>,
    ) -> Result<RunCommandHandle, SchedulerError> {
        if !self.graph.workspaces().any(|w| w.has_command(target)) {
            return Err(SchedulerError::UnknownTarget {
                target: target.to_string(),
            });
        }

        let (tx, rx) = flume::unbounded();
        let (abort_tx, abort_rx) = watch::channel(false);

        let graph = self.graph.clone();
        let vcs = self.vcs.clone();
        let project_root = self.project_root.clone();
        let process = self.process.clone();
        let registry = self.registry.clone();
        let target = target.to_string();

        tokio::spawn(async move {
            let send = tx.clone();
            if let Err(err) = drive(
                &graph,
                vcs.as_ref(),
                &project_root,
                &process,
                &registry,
                &target,
                options,
                args,
                env,
                watch,
                abort_rx,
                tx,
            )
            .await
            {
                let _ = send.send(Err(err));
            }
        });

        Ok(RunCommandHandle { events: rx, abort: abort_tx })
    }
}

fn flatten(plan: &OrderedTargets) -> Vec<ResolvedTarget> {
    plan.steps.iter().flatten().cloned().collect()
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    graph: &WorkspaceGraph,
    vcs: &dyn VcsProbe,
    project_root: &AbsDirPath,
    process: &ProcessRunner,
    registry: &ProcessRegistry,
    target: &str,
    options: RunOptions,
    args: Vec<String>,
    env: HashMap<String, String>,
    watch: Option<WatchOptions>,
    mut abort_rx: watch::Receiver<bool>,
    tx: Sender<Result<RunCommandEvent>>,
) -> Result<()> {
    let affected = AffectedResolver::new(vcs, project_root);
    let resolver = TargetsResolver::new(graph, &affected);
    let plan = resolver.resolve(target, &options).await?;

    tx.send(Ok(RunCommandEvent::TargetsResolved {
        targets: flatten(&plan),
    }))
    .ok();
    if plan.is_empty() {
        return Ok(());
    }

    let roots: HashMap<String, AbsDirPath> = graph
        .workspaces()
        .map(|w| (w.name.clone(), w.root.clone()))
        .collect();
    let patterns: HashMap<String, Vec<String>> = graph
        .workspaces()
        .filter_map(|w| w.targets.get(target).map(|t| (w.name.clone(), t.src.clone())))
        .collect();

    let mut watcher = match &watch {
        Some(opts) => Some(Watcher::watch(&plan, target, &roots, &patterns, opts.debounce_ms)?),
        None => None,
    };

    let mut start_step = 0usize;
    let mut reduced: Option<HashSet<String>> = None;

    loop {
        if *abort_rx.borrow() {
            return Ok(());
        }

        let mut step_index = start_step;
        let mut rescheduled = false;

        while step_index < plan.steps.len() {
            if *abort_rx.borrow() {
                return Ok(());
            }

            let step = &plan.steps[step_index];
            let selection: Vec<ResolvedTarget> = match &reduced {
                Some(set) if step_index == start_step => {
                    step.iter().filter(|r| set.contains(&r.workspace)).cloned().collect()
                }
                _ => step.clone(),
            };

            let outcome = run_step(
                graph,
                target,
                &options,
                &args,
                &env,
                process,
                registry,
                &tx,
                &selection,
                step_index,
                &plan,
                watcher.as_mut(),
                &mut abort_rx,
            )
            .await?;

            emit_invalidations(graph, target, &tx, &outcome, options.mode, step_index, &plan).await?;

            if let Some((from, impacted)) = outcome.reschedule {
                start_step = from;
                reduced = Some(impacted);
                rescheduled = true;
                break;
            }

            if let Some((_, error)) = outcome.fatal {
                return Err(error);
            }

            step_index += 1;
        }

        if rescheduled {
            continue;
        }

        let Some(watcher_ref) = watcher.as_mut() else {
            return Ok(());
        };
        // The whole plan finished. Park the cursor past the last step so any
        // later change is, by definition, "earlier" and triggers a reschedule.
        start_step = plan.steps.len();

        loop {
            tokio::select! {
                changed = abort_rx.changed() => {
                    if changed.is_err() || *abort_rx.borrow() {
                        return Ok(());
                    }
                }
                batch = watcher_ref.next_batch() => {
                    let Some(batch) = batch else { return Ok(()) };
                    let mut impacted = HashSet::new();
                    let mut from = usize::MAX;
                    for event in batch {
                        let Some(resolved) = plan.resolved(&event.workspace) else { continue };
                        if !resolved.has_command {
                            continue;
                        }
                        tx.send(Ok(RunCommandEvent::SourcesChanged {
                            workspace: event.workspace.clone(),
                            fs_event_kind: event.change_kind,
                            path: event.path.to_string_lossy().into_owned(),
                        })).ok();
                        if !resolved.affected {
                            continue;
                        }
                        if let Some(idx) = plan.step_of(&event.workspace) {
                            from = from.min(idx);
                            impacted.insert(event.workspace.clone());
                        }
                    }
                    if !impacted.is_empty() {
                        start_step = from;
                        reduced = Some(impacted);
                        break;
                    }
                }
            }
        }
    }
}

/// What one step's execution settled, for the caller to cascade.
#[derive(Default)]
struct StepOutcome {
    errored: Vec<String>,
    rebuilt: Vec<String>,
    /// First fatal (topological) failure; ends the stream once observed.
    fatal: Option<(String, color_eyre::Report)>,
    /// Set by a watch-mode reaction: resume here, running only these
    /// workspaces in that first step.
    reschedule: Option<(usize, HashSet<String>)>,
}

type TaskResult = std::result::Result<(Vec<CommandResult>, bool), String>;
type TaskTx = Sender<(String, TaskResult)>;

#[allow(clippy::too_many_arguments)]
async fn run_step(
    graph: &WorkspaceGraph,
    target: &str,
    options: &RunOptions,
    args: &[String],
    env: &HashMap<String, String>,
    process: &ProcessRunner,
    registry: &ProcessRegistry,
    tx: &Sender<Result<RunCommandEvent>>,
    selection: &[ResolvedTarget],
    step_index: usize,
    plan: &OrderedTargets,
    mut watcher: Option<&mut Watcher>,
    abort_rx: &mut watch::Receiver<bool>,
) -> Result<StepOutcome> {
    let mut queue: VecDeque<&ResolvedTarget> = VecDeque::new();
    for resolved in selection {
        if !resolved.affected || !resolved.has_command {
            tx.send(Ok(RunCommandEvent::NodeSkipped {
                workspace: resolved.workspace.clone(),
                affected: resolved.affected,
                has_command: resolved.has_command,
            }))
            .ok();
            continue;
        }
        queue.push_back(resolved);
    }

    let (task_tx, task_rx) = flume::unbounded::<(String, TaskResult)>();
    let mut running: HashSet<String> = HashSet::new();
    let mut killed: HashSet<String> = HashSet::new();
    let mut no_more_starts = false;
    let mut outcome = StepOutcome::default();

    let spawn_next = |queue: &mut VecDeque<&ResolvedTarget>, running: &mut HashSet<String>| {
        if let Some(resolved) = queue.pop_front() {
            spawn_task(graph, target, options, args, env, process, tx, resolved, task_tx.clone());
            running.insert(resolved.workspace.clone());
            true
        } else {
            false
        }
    };

    while !no_more_starts && running.len() < options.concurrency.max(1) {
        if !spawn_next(&mut queue, &mut running) {
            break;
        }
    }

    loop {
        if running.is_empty() && (queue.is_empty() || no_more_starts) {
            break;
        }

        tokio::select! {
            biased;

            changed = abort_rx.changed() => {
                if changed.is_ok() && *abort_rx.borrow() {
                    no_more_starts = true;
                }
            }

            batch = next_batch_or_pending(&mut watcher) => {
                let Some(batch) = batch else { continue };
                for event in batch {
                    react_to_change(
                        plan, tx, registry, target, step_index, &event,
                        &mut running, &mut killed, &mut no_more_starts, &mut outcome,
                    ).await;
                }
            }

            Ok((workspace, result)) = task_rx.recv_async() => {
                running.remove(&workspace);

                if !killed.contains(&workspace) {
                    match result {
                        Ok((results, from_cache)) => {
                            tx.send(Ok(RunCommandEvent::NodeProcessed {
                                workspace: workspace.clone(),
                                results,
                                from_cache,
                            })).ok();
                            if !from_cache {
                                outcome.rebuilt.push(workspace.clone());
                            }
                        }
                        Err(error) => {
                            tx.send(Ok(RunCommandEvent::NodeErrored {
                                workspace: workspace.clone(),
                                error: error.clone(),
                            })).ok();
                            outcome.errored.push(workspace.clone());
                            if matches!(options.mode, Mode::Topological) {
                                no_more_starts = true;
                                outcome.fatal.get_or_insert((workspace, eyre!(error)));
                            }
                        }
                    }
                }

                while !no_more_starts && running.len() < options.concurrency.max(1) {
                    if !spawn_next(&mut queue, &mut running) {
                        break;
                    }
                }
            }
        }
    }

    Ok(outcome)
}

async fn next_batch_or_pending(watcher: &mut Option<&mut Watcher>) -> Option<Vec<WatchEvent>> {
    match watcher {
        Some(w) => w.next_batch().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn react_to_change(
    plan: &OrderedTargets,
    tx: &Sender<Result<RunCommandEvent>>,
    registry: &ProcessRegistry,
    target: &str,
    step_index: usize,
    event: &WatchEvent,
    running: &mut HashSet<String>,
    killed: &mut HashSet<String>,
    no_more_starts: &mut bool,
    outcome: &mut StepOutcome,
) {
    let Some(resolved) = plan.resolved(&event.workspace) else {
        return;
    };
    if !resolved.has_command {
        return;
    }

    tx.send(Ok(RunCommandEvent::SourcesChanged {
        workspace: event.workspace.clone(),
        fs_event_kind: event.change_kind,
        path: event.path.to_string_lossy().into_owned(),
    }))
    .ok();

    if !resolved.affected {
        return;
    }

    let Some(event_step) = plan.step_of(&event.workspace) else {
        return;
    };

    if event_step < step_index {
        *no_more_starts = true;
        for workspace in running.iter().cloned().collect::<Vec<_>>() {
            if killed.insert(workspace.clone()) {
                tx.send(Ok(RunCommandEvent::NodeInterrupted { workspace: workspace.clone() })).ok();
                registry.kill(&workspace, target, &[]).await.ok();
            }
        }
        let entry = outcome.reschedule.get_or_insert((event_step, HashSet::new()));
        entry.0 = entry.0.min(event_step);
        entry.1.insert(event.workspace.clone());
    } else if event_step == step_index && running.contains(&event.workspace) {
        if killed.insert(event.workspace.clone()) {
            tx.send(Ok(RunCommandEvent::NodeInterrupted {
                workspace: event.workspace.clone(),
            }))
            .ok();
            registry.kill(&event.workspace, target, &[]).await.ok();
        }
        let entry = outcome.reschedule.get_or_insert((step_index, HashSet::new()));
        entry.1.insert(event.workspace.clone());
    }
    // event_step == step_index but not yet started, or event_step >
    // step_index: no action, it will run in its own turn.
}

#[allow(clippy::too_many_arguments)]
fn spawn_task(
    graph: &WorkspaceGraph,
    target: &str,
    options: &RunOptions,
    args: &[String],
    env: &HashMap<String, String>,
    process: &ProcessRunner,
    tx: &Sender<Result<RunCommandEvent>>,
    resolved: &ResolvedTarget,
    task_tx: TaskTx,
) {
    let Some(workspace) = graph.get(&resolved.workspace).cloned() else {
        return;
    };
    tx.send(Ok(RunCommandEvent::NodeStarted {
        workspace: workspace.name.clone(),
    }))
    .ok();

    let target = target.to_string();
    let force = options.force;
    let stdio = options.stdio;
    let args = args.to_vec();
    let env = env.clone();
    let process = process.clone();

    tokio::spawn(async move {
        let result = execute_target(&workspace, &target, force, stdio, &args, &env, &process)
            .await
            .map_err(|err| format!("{err:#}"));
        let _ = task_tx.send((workspace.name.clone(), result));
    });
}

/// Runs (or serves from cache) one workspace's commands for `target`.
#[instrument(skip(workspace, args, env, process), fields(workspace = %workspace.name, target))]
async fn execute_target(
    workspace: &Workspace,
    target: &str,
    force: bool,
    stdio: StdioMode,
    args: &[String],
    env: &HashMap<String, String>,
    process: &ProcessRunner,
) -> Result<(Vec<CommandResult>, bool)> {
    let config = workspace
        .targets
        .get(target)
        .expect("caller only spawns tasks for workspaces with this target");

    let fingerprint = match fingerprint::compute(
        &workspace.root,
        &workspace.name,
        target,
        &config.cmd,
        &config.src,
        args,
    )
    .await
    {
        Ok(fp) => Some(fp),
        Err(err) => {
            warn!(%err, workspace = %workspace.name, target, "treating as cache miss");
            None
        }
    };

    if !force {
        if let Some(fp) = &fingerprint {
            if let Some(results) = CacheStore::read(&workspace.root, target, fp).await {
                return Ok((results, true));
            }
        }
    }

    let mut results = Vec::with_capacity(config.cmd.len());
    for command in &config.cmd {
        let conditions = command.daemon_conditions();
        let result = if conditions.is_empty() {
            process
                .run(&workspace.name, target, &workspace.root, command.run_str(), env, stdio)
                .await?
        } else {
            let daemon = process
                .run_daemon(&workspace.name, target, &workspace.root, command.run_str(), env, conditions)
                .await?;
            CommandResult {
                command: command.run_str().to_string(),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                combined: String::new(),
                duration_ms: daemon.took.as_millis() as u64,
            }
        };
        results.push(result);
    }

    match fingerprint {
        Some(fp) => {
            let entry = CacheEntry {
                fingerprint: fp,
                results: results.clone(),
            };
            CacheStore::write(&workspace.root, &workspace.name, target, &entry).await?;
        }
        None => {
            CacheStore::invalidate(&workspace.root, &workspace.name, target).await?;
        }
    }

    Ok((results, false))
}

/// After a step settles: invalidate errored workspaces, and — in topological
/// mode, if anything errored or actually rebuilt — every workspace in every
/// strictly later step, since their cached output may assume stale upstream
/// state.
async fn emit_invalidations(
    graph: &WorkspaceGraph,
    target: &str,
    tx: &Sender<Result<RunCommandEvent>>,
    outcome: &StepOutcome,
    mode: Mode,
    step_index: usize,
    plan: &OrderedTargets,
) -> Result<(), SchedulerError> {
    let mut to_invalidate: Vec<String> = outcome.errored.clone();

    let any_error_or_rebuild = !outcome.errored.is_empty() || !outcome.rebuilt.is_empty();
    if any_error_or_rebuild && matches!(mode, Mode::Topological) {
        for step in &plan.steps[step_index + 1..] {
            for resolved in step {
                to_invalidate.push(resolved.workspace.clone());
            }
        }
    }

    for workspace_name in to_invalidate {
        let Some(workspace) = graph.get(&workspace_name) else {
            continue;
        };
        match CacheStore::invalidate(&workspace.root, &workspace.name, target).await {
            Ok(()) => {
                tx.send(Ok(RunCommandEvent::CacheInvalidated {
                    workspace: workspace_name,
                }))
                .ok();
            }
            Err(err) => {
                tx.send(Ok(RunCommandEvent::ErrorInvalidatingCache {
                    workspace: workspace_name,
                    error: err.to_string(),
                }))
                .ok();
                return Err(SchedulerError::ErrorInvalidatingCache { source: err });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manifest::{Command, TargetConfig},
        path::RelFilePath,
    };
    use futures::future::{BoxFuture, FutureExt};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct FakeVcs;

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
            async { Ok(Vec::new()) }.boxed()
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

    fn workspace_with_command(dir: &TempDir, name: &str, deps: &[&str], run: &str) -> Workspace {
        std::fs::write(dir.path().join("input.txt"), b"x").unwrap();
        let mut targets = BTreeMap::new();
        targets.insert(
            "build".to_string(),
            TargetConfig {
                cmd: vec![Command::Shell(run.to_string())],
                src: vec!["*.txt".to_string()],
            },
        );
        Workspace {
            name: name.to_string(),
            root: AbsDirPath::try_from(dir.path().to_path_buf()).unwrap(),
            version: None,
            private: false,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            targets,
        }
    }

    fn scheduler_with(graph: WorkspaceGraph) -> Scheduler {
        Scheduler::new(
            Arc::new(graph),
            Arc::new(FakeVcs),
            Arc::new(AbsDirPath::current().unwrap()),
        )
    }

    fn options(mode: Mode) -> RunOptions {
        RunOptions {
            mode,
            force: false,
            affected: None,
            stdio: StdioMode::Capture,
            to: None,
            workspaces: None,
            concurrency: 4,
        }
    }

    async fn drain(handle: RunCommandHandle) -> Vec<RunCommandEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            events.push(event.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn unknown_target_is_rejected_before_any_task_runs() {
        let dir = TempDir::new().unwrap();
        let graph = WorkspaceGraph::new(vec![workspace_with_command(&dir, "a", &[], "true")]).unwrap();
        let scheduler = scheduler_with(graph);

        let err = scheduler
            .run_command("lint", options(Mode::Parallel), Vec::new(), HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTarget { .. }));
    }

    #[tokio::test]
    async fn parallel_run_emits_started_then_processed_then_caches() {
        let dir = TempDir::new().unwrap();
        let graph = WorkspaceGraph::new(vec![workspace_with_command(&dir, "a", &[], "echo hi")]).unwrap();
        let scheduler = scheduler_with(graph);

        let handle = scheduler
            .run_command("build", options(Mode::Parallel), Vec::new(), HashMap::new(), None)
            .unwrap();
        let events = drain(handle).await;

        assert!(matches!(events[0], RunCommandEvent::TargetsResolved { .. }));
        assert!(events.iter().any(|e| matches!(e, RunCommandEvent::NodeStarted { workspace } if workspace == "a")));
        assert!(events.iter().any(|e| matches!(
            e,
            RunCommandEvent::NodeProcessed { workspace, from_cache, .. } if workspace == "a" && !from_cache
        )));
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let graph = WorkspaceGraph::new(vec![workspace_with_command(&dir, "a", &[], "echo hi")]).unwrap();
        let scheduler = scheduler_with(graph);

        drain(
            scheduler
                .run_command("build", options(Mode::Parallel), Vec::new(), HashMap::new(), None)
                .unwrap(),
        )
        .await;

        let events = drain(
            scheduler
                .run_command("build", options(Mode::Parallel), Vec::new(), HashMap::new(), None)
                .unwrap(),
        )
        .await;

        assert!(events.iter().any(|e| matches!(
            e,
            RunCommandEvent::NodeProcessed { workspace, from_cache, .. } if workspace == "a" && *from_cache
        )));
    }

    #[tokio::test]
    async fn workspace_without_the_target_is_skipped() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut bare = workspace_with_command(&dir_a, "a", &[], "true");
        bare.targets.clear();
        let graph = WorkspaceGraph::new(vec![
            bare,
            workspace_with_command(&dir_b, "b", &[], "true"),
        ])
        .unwrap();
        let scheduler = scheduler_with(graph);

        let events = drain(
            scheduler
                .run_command("build", options(Mode::Parallel), Vec::new(), HashMap::new(), None)
                .unwrap(),
        )
        .await;

        assert!(events.iter().any(|e| matches!(
            e,
            RunCommandEvent::NodeSkipped { workspace, has_command: false, .. } if workspace == "a"
        )));
    }

    #[tokio::test]
    async fn topological_error_invalidates_downstream_caches_and_ends_the_stream() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let graph = WorkspaceGraph::new(vec![
            workspace_with_command(&dir_a, "a", &[], "exit 1"),
            workspace_with_command(&dir_b, "b", &["a"], "true"),
        ])
        .unwrap();
        let scheduler = scheduler_with(graph);

        let handle = scheduler
            .run_command("build", options(Mode::Topological), Vec::new(), HashMap::new(), None)
            .unwrap();

        let mut events = Vec::new();
        let mut saw_error = false;
        while let Some(event) = handle.next().await {
            match event {
                Ok(event) => events.push(event),
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }

        assert!(saw_error, "topological failure must error the stream");
        assert!(events.iter().any(|e| matches!(e, RunCommandEvent::NodeErrored { workspace, .. } if workspace == "a")));
        assert!(!events.iter().any(|e| matches!(e, RunCommandEvent::NodeStarted { workspace } if workspace == "b")));
    }

    #[tokio::test]
    async fn parallel_error_does_not_end_the_stream() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let graph = WorkspaceGraph::new(vec![
            workspace_with_command(&dir_a, "a", &[], "exit 1"),
            workspace_with_command(&dir_b, "b", &[], "true"),
        ])
        .unwrap();
        let scheduler = scheduler_with(graph);

        let handle = scheduler
            .run_command("build", options(Mode::Parallel), Vec::new(), HashMap::new(), None)
            .unwrap();
        let events = drain(handle).await;

        assert!(events.iter().any(|e| matches!(e, RunCommandEvent::NodeErrored { workspace, .. } if workspace == "a")));
        assert!(events.iter().any(|e| matches!(
            e,
            RunCommandEvent::NodeProcessed { workspace, .. } if workspace == "b"
        )));
    }
}

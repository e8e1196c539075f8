//! Debounced, glob-filtered file-system watching for every workspace in a
//! plan, multiplexed into a single async stream of batches.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use color_eyre::{Result, eyre::Context};
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{instrument, trace, warn};

use crate::{
    events::ChangeKind,
    path::AbsDirPath,
    plan::OrderedTargets,
};

/// One file-system change, already attributed to the workspace whose source
/// globs it matched.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub workspace: String,
    pub change_kind: ChangeKind,
    pub path: PathBuf,
}

/// Watches every workspace's `src` globs named in a plan, debouncing raw
/// OS events per workspace and emitting non-empty batches.
pub struct Watcher {
    _debouncer: notify_debouncer_full::Debouncer<
        notify::RecommendedWatcher,
        notify_debouncer_full::RecommendedCache,
    >,
    events: UnboundedReceiverStream<Vec<WatchEvent>>,
}

impl Watcher {
    /// Start watching every workspace referenced by `plan` for the given
    /// `target`, debouncing raw events every `debounce_ms` milliseconds.
    #[instrument(skip(plan))]
    pub fn watch(plan: &OrderedTargets, target: &str, roots: &HashMap<String, AbsDirPath>, patterns: &HashMap<String, Vec<String>>, debounce_ms: u64) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Vec<notify_debouncer_full::DebouncedEvent>>();

        let mut debouncer = new_debouncer(
            Duration::from_millis(debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let _ = raw_tx.send(events);
                }
                Err(errors) => {
                    for error in errors {
                        warn!(?error, "watch error");
                    }
                }
            },
        )
        .context("create debouncer")?;

        let workspaces: Vec<&str> = plan
            .steps
            .iter()
            .flatten()
            .filter(|t| t.has_command)
            .map(|t| t.workspace.as_str())
            .collect();

        for name in &workspaces {
            if let Some(root) = roots.get(*name) {
                debouncer
                    .watch(root.as_std_path(), RecursiveMode::Recursive)
                    .with_context(|| format!("watch workspace {name}"))?;
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let roots = roots.clone();
        let patterns = patterns.clone();
        let target = target.to_string();

        tokio::spawn(async move {
            let mut buffers: HashMap<String, Vec<WatchEvent>> = HashMap::new();
            while let Some(batch) = raw_rx.recv().await {
                for event in batch {
                    let Some((workspace, change_kind)) =
                        classify(&event, &roots, &patterns, &target)
                    else {
                        continue;
                    };
                    for path in &event.paths {
                        buffers.entry(workspace.clone()).or_default().push(WatchEvent {
                            workspace: workspace.clone(),
                            change_kind,
                            path: path.clone(),
                        });
                    }
                }

                let flushed: Vec<WatchEvent> = buffers.drain().flat_map(|(_, v)| v).collect();
                if !flushed.is_empty() && out_tx.send(flushed).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            _debouncer: debouncer,
            events: UnboundedReceiverStream::new(out_rx),
        })
    }

    /// The next debounced, non-empty batch of changes.
    pub async fn next_batch(&mut self) -> Option<Vec<WatchEvent>> {
        use tokio_stream::StreamExt as _;
        self.events.next().await
    }
}

fn classify(
    event: &notify_debouncer_full::DebouncedEvent,
    roots: &HashMap<String, AbsDirPath>,
    patterns: &HashMap<String, Vec<String>>,
    _target: &str,
) -> Option<(String, ChangeKind)> {
    let change_kind = match event.event.kind {
        notify::EventKind::Create(notify::event::CreateKind::Folder) => ChangeKind::AddDir,
        notify::EventKind::Create(_) => ChangeKind::Add,
        notify::EventKind::Remove(notify::event::RemoveKind::Folder) => ChangeKind::UnlinkDir,
        notify::EventKind::Remove(_) => ChangeKind::Unlink,
        notify::EventKind::Modify(_) => ChangeKind::Change,
        _ => return None,
    };

    let path = event.paths.first()?;
    for (name, root) in roots {
        let Ok(rel) = path.strip_prefix(root.as_std_path()) else {
            continue;
        };
        let rel_str = rel.to_string_lossy();
        let globs = patterns.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let matches_any = globs.is_empty()
            || globs.iter().any(|pattern| {
                pattern == "**"
                    || glob::Pattern::new(pattern)
                        .map(|p| p.matches(&rel_str))
                        .unwrap_or(false)
            });
        if matches_any {
            trace!(workspace = name, ?change_kind, path = %rel_str, "matched source glob");
            return Some((name.clone(), change_kind));
        }
    }
    None
}

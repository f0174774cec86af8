//! `juridoc watch`: follow both roots and keep the store current.
//!
//! The `notify` callback runs on the watcher's own thread. It only forwards
//! raw events into a bounded channel; this task debounces them, coalesces
//! the touched paths, and turns each batch into [`SyncCommand`]s for the
//! [`SyncWorker`](crate::worker::SyncWorker). Nothing here writes to the
//! store; it only polls the persisted roots so a `juridoc roots` run from
//! another shell moves the watch along.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::models::{NOTES_ROOT_KEY, SOURCES_ROOT_KEY};
use crate::store::ContentStore;
use crate::worker::{SyncCommand, SyncHandle};

/// Roots being watched. Either may be unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRoots {
    pub sources: Option<PathBuf>,
    pub notes: Option<PathBuf>,
}

impl WatchRoots {
    /// The roots currently persisted in the store.
    pub async fn load(store: &ContentStore) -> Result<Self> {
        Ok(Self {
            sources: store.get_config(SOURCES_ROOT_KEY).await?.map(PathBuf::from),
            notes: store.get_config(NOTES_ROOT_KEY).await?.map(PathBuf::from),
        })
    }

    fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.sources.iter().chain(self.notes.iter())
    }

    fn contains(&self, root: &Path) -> bool {
        self.iter().any(|r| r == root)
    }
}

/// Watch until Ctrl-C.
pub async fn run_watch(
    handle: SyncHandle,
    store: Arc<ContentStore>,
    mut roots: WatchRoots,
    config: &WatchConfig,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(config.queue_capacity);
    let mut watcher = recommended_watcher(move |event| {
        let _ = tx.blocking_send(event);
    })
    .context("Failed to create filesystem watcher")?;

    for root in roots.iter() {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        info!(root = %root.display(), "watching");
    }

    let mut poll = tokio::time::interval(Duration::from_millis(config.roots_poll_ms));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.tick().await;

    let debounce = Duration::from_millis(config.debounce_ms);
    loop {
        let first = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = poll.tick() => {
                let current = WatchRoots::load(&store).await?;
                if current != roots {
                    info!(?current, "persisted roots changed");
                    rewatch(&mut watcher, &roots, &current);
                    roots = current;
                    // Switch the worker before any event of the new roots reaches it.
                    handle.send(SyncCommand::RefreshRoots).await?;
                }
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping watch");
                break;
            }
        };

        let mut paths = BTreeSet::new();
        collect_paths(first, &mut paths);
        // Keep absorbing events until the tree has been quiet for `debounce`.
        while let Ok(Some(event)) = tokio::time::timeout(debounce, rx.recv()).await {
            collect_paths(event, &mut paths);
        }

        let commands = plan_batch(&paths, &roots);
        debug!(paths = paths.len(), commands = commands.len(), "dispatching batch");
        for command in commands {
            handle.send(command).await?;
        }
    }

    drop(watcher);
    Ok(())
}

/// Move the watcher from `old` to `new`. A root that cannot be watched is
/// logged; the worker still reconciles it on the next scan.
fn rewatch(watcher: &mut impl Watcher, old: &WatchRoots, new: &WatchRoots) {
    for root in old.iter().filter(|r| !new.contains(r)) {
        match watcher.unwatch(root) {
            Ok(()) => info!(root = %root.display(), "stopped watching"),
            Err(e) => warn!(root = %root.display(), error = %e, "cannot unwatch"),
        }
    }
    for root in new.iter().filter(|r| !old.contains(r)) {
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => info!(root = %root.display(), "watching"),
            Err(e) => warn!(root = %root.display(), error = %e, "cannot watch new root"),
        }
    }
}

fn collect_paths(event: notify::Result<Event>, paths: &mut BTreeSet<PathBuf>) {
    match event {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            paths.extend(event.paths);
        }
        Err(e) => warn!(error = %e, "watch error"),
    }
}

/// Turn a coalesced set of touched paths into worker commands.
///
/// Each sources path becomes a change or a removal depending on whether it
/// exists *now*; the root itself (or a path the watcher could not place)
/// triggers a full scan. Any notes path triggers one notes rebuild.
pub fn plan_batch(paths: &BTreeSet<PathBuf>, roots: &WatchRoots) -> Vec<SyncCommand> {
    let mut commands = Vec::new();
    let mut full_scan = false;
    let mut notes_changed = false;

    for path in paths {
        if let Some(notes) = roots.notes.as_deref() {
            if path.starts_with(notes) {
                notes_changed = true;
                continue;
            }
        }
        let Some(sources) = roots.sources.as_deref() else {
            continue;
        };
        if !path.starts_with(sources) {
            continue;
        }
        if path == sources {
            full_scan = true;
            continue;
        }
        commands.push(source_command(sources, path));
    }

    if full_scan {
        commands.retain(|c| !matches!(c, SyncCommand::SourceChanged { .. } | SyncCommand::SourceRemoved { .. }));
        commands.push(SyncCommand::ScanSources { reply: None });
    }
    if notes_changed {
        if let Some(root) = roots.notes.clone() {
            commands.push(SyncCommand::NotesChanged { root });
        }
    }
    commands
}

fn source_command(root: &Path, path: &Path) -> SyncCommand {
    let root = root.to_path_buf();
    let path = path.to_path_buf();
    if path.exists() {
        SyncCommand::SourceChanged { root, path }
    } else {
        SyncCommand::SourceRemoved { root, path }
    }
}

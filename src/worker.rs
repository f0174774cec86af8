//! The serialized mutation worker.
//!
//! Scans requested by the CLI, watch notifications and root changes are all
//! sent as [`SyncCommand`]s over one bounded channel to a single task. That task runs
//! commands strictly one after another, so a burst of file events can never
//! interleave with a full scan. A full channel applies backpressure to the
//! sender instead of dropping work.
//!
//! File events carry the root they were observed under. An event whose root
//! is no longer the active one is dropped: it describes a tree the store no
//! longer mirrors.
//!
//! The persisted roots are the authority. Another process (`juridoc roots`)
//! may rewrite them without this process ever seeing a broadcast, so the
//! worker re-reads both keys before each command and switches roots first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::models::{NOTES_ROOT_KEY, SOURCES_ROOT_KEY};
use crate::notes::{NoteAnalyzer, NotesReport};
use crate::source_sync::{ScanReport, SourceSync};
use crate::store::{ConfigChange, ContentStore};

type Reply<T> = Option<oneshot::Sender<Result<T>>>;

pub enum SyncCommand {
    ScanSources { reply: Reply<ScanReport> },
    ScanNotes { reply: Reply<NotesReport> },
    /// A file under `root` was created or modified.
    SourceChanged { root: PathBuf, path: PathBuf },
    /// A path under `root` disappeared.
    SourceRemoved { root: PathBuf, path: PathBuf },
    /// Anything under the notes root changed.
    NotesChanged { root: PathBuf },
    ConfigChanged(ConfigChange),
    /// Only re-read the persisted roots.
    RefreshRoots,
}

/// Cheap, clonable sender side of the worker queue.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub async fn scan_sources(&self) -> Result<ScanReport> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncCommand::ScanSources { reply: Some(reply) })
            .await?;
        rx.await.map_err(|_| anyhow!("sync worker dropped the request"))?
    }

    pub async fn scan_notes(&self) -> Result<NotesReport> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncCommand::ScanNotes { reply: Some(reply) })
            .await?;
        rx.await.map_err(|_| anyhow!("sync worker dropped the request"))?
    }

    pub async fn send(&self, command: SyncCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("sync worker has stopped"))
    }
}

pub struct SyncWorker {
    store: Arc<ContentStore>,
    sources: SourceSync,
    notes: NoteAnalyzer,
    sources_root: Option<PathBuf>,
    notes_root: Option<PathBuf>,
}

impl SyncWorker {
    /// Build a worker whose active roots are the ones persisted in the store.
    pub async fn new(
        store: Arc<ContentStore>,
        sources: SourceSync,
        notes: NoteAnalyzer,
    ) -> Result<Self> {
        let sources_root = store.get_config(SOURCES_ROOT_KEY).await?.map(PathBuf::from);
        let notes_root = store.get_config(NOTES_ROOT_KEY).await?.map(PathBuf::from);
        Ok(Self {
            store,
            sources,
            notes,
            sources_root,
            notes_root,
        })
    }

    pub fn sources_root(&self) -> Option<&Path> {
        self.sources_root.as_deref()
    }

    pub fn notes_root(&self) -> Option<&Path> {
        self.notes_root.as_deref()
    }

    /// Start the worker. It stops once every [`SyncHandle`] is dropped.
    pub fn spawn(self, capacity: usize) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let forward = forward_config_changes(self.store.subscribe_config(), tx.downgrade());
        let task = tokio::spawn(self.run(rx, forward));
        (SyncHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SyncCommand>, forward: JoinHandle<()>) {
        info!("sync worker started");
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        forward.abort();
        info!("sync worker stopped");
    }

    async fn handle(&mut self, command: SyncCommand) {
        self.refresh_roots().await;
        match command {
            SyncCommand::ScanSources { reply } => {
                let result = self.scan_sources().await;
                respond(reply, result, "sources scan");
            }
            SyncCommand::ScanNotes { reply } => {
                let result = self.scan_notes().await;
                respond(reply, result, "notes rebuild");
            }
            SyncCommand::SourceChanged { root, path } => {
                if !is_active(&self.sources_root, &root) {
                    debug!(path = %path.display(), "dropping event for inactive sources root");
                    return;
                }
                let result = self.sources.reconcile_file(&root, &path).await;
                self.after_sources(result).await;
            }
            SyncCommand::SourceRemoved { root, path } => {
                if !is_active(&self.sources_root, &root) {
                    debug!(path = %path.display(), "dropping event for inactive sources root");
                    return;
                }
                let result = self.sources.remove_file(&root, &path).await;
                self.after_sources(result).await;
            }
            SyncCommand::NotesChanged { root } => {
                if !is_active(&self.notes_root, &root) {
                    debug!(root = %root.display(), "dropping event for inactive notes root");
                    return;
                }
                if let Err(e) = self.notes.rebuild(&root).await {
                    warn!(error = %e, "notes rebuild failed");
                }
            }
            SyncCommand::ConfigChanged(change) => {
                debug!(key = %change.key, "config change seen");
            }
            SyncCommand::RefreshRoots => {}
        }
    }

    /// Switch to whatever roots are persisted now. A broadcast payload may
    /// already be stale by the time it is handled, so only the store is read.
    async fn refresh_roots(&mut self) {
        for key in [SOURCES_ROOT_KEY, NOTES_ROOT_KEY] {
            match self.store.get_config(key).await {
                Ok(Some(value)) => self.apply_root(key, PathBuf::from(value)).await,
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "cannot read persisted root"),
            }
        }
    }

    async fn scan_sources(&mut self) -> Result<ScanReport> {
        let root = self
            .sources_root
            .clone()
            .ok_or(SyncError::RootNotConfigured(SOURCES_ROOT_KEY))?;
        let mut report = self.sources.reconcile_root(&root).await?;
        // Rows of a previous root are retired only after the new root was
        // matched by hash, so content that moved along keeps its id.
        let retired = self.sources.retire_other_roots(&root).await?;
        report.events.extend(retired.events);
        self.relink_if_needed(&report).await;
        Ok(report)
    }

    async fn scan_notes(&mut self) -> Result<NotesReport> {
        let root = self
            .notes_root
            .clone()
            .ok_or(SyncError::RootNotConfigured(NOTES_ROOT_KEY))?;
        self.notes.rebuild(&root).await
    }

    async fn after_sources(&mut self, result: Result<ScanReport>) {
        match result {
            Ok(report) => self.relink_if_needed(&report).await,
            Err(e) => warn!(error = %e, "source reconcile failed"),
        }
    }

    /// Rebuild the notes when the set of known hashes changed, so links to
    /// new content resolve and links to vanished content stop resolving.
    async fn relink_if_needed(&mut self, report: &ScanReport) {
        if !report.alters_identity() {
            return;
        }
        if let Some(root) = self.notes_root.clone() {
            if let Err(e) = self.notes.rebuild(&root).await {
                warn!(error = %e, "notes rebuild after source changes failed");
            }
        }
    }

    async fn apply_root(&mut self, key: &str, root: PathBuf) {
        match key {
            SOURCES_ROOT_KEY => {
                if self.sources_root.as_deref() == Some(root.as_path()) {
                    return;
                }
                info!(root = %root.display(), "sources root changed");
                self.sources_root = Some(root);
                if let Err(e) = self.scan_sources().await {
                    warn!(error = %e, "scan of new sources root failed");
                }
            }
            NOTES_ROOT_KEY => {
                if self.notes_root.as_deref() == Some(root.as_path()) {
                    return;
                }
                info!(root = %root.display(), "notes root changed");
                if let Some(previous) = self.notes_root.replace(root.clone()) {
                    if let Err(e) = self.notes.clear(&previous).await {
                        warn!(error = %e, "clearing previous notes root failed");
                    }
                }
                if let Err(e) = self.notes.rebuild(&root).await {
                    warn!(error = %e, "notes rebuild failed");
                }
            }
            _ => {}
        }
    }
}

fn is_active(active: &Option<PathBuf>, root: &Path) -> bool {
    active.as_deref() == Some(root)
}

fn respond<T>(reply: Reply<T>, result: Result<T>, what: &str) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                warn!(error = %e, "{} failed", what);
            }
        }
    }
}

/// Feed persisted config writes into the worker queue, behind any file
/// events already waiting there.
fn forward_config_changes(
    mut changes: broadcast::Receiver<ConfigChange>,
    tx: mpsc::WeakSender<SyncCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "config notifications lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(tx) = tx.upgrade() else {
                break;
            };
            if tx.send(SyncCommand::ConfigChanged(change)).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, ChangeNotifier};
    use crate::models::root_key;
    use crate::odt::tests::build_odt;
    use crate::store::tests::test_store;
    use crate::walk::{file_hash, WalkOptions};
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout, Duration};

    struct Fixture {
        tmp: TempDir,
        store: Arc<ContentStore>,
        notifier: ChangeNotifier,
        sources: PathBuf,
        notes: PathBuf,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let sources = tmp.path().join("sources");
        let notes = tmp.path().join("notes");
        fs::create_dir_all(&sources).unwrap();
        fs::create_dir_all(&notes).unwrap();
        let store = Arc::new(test_store(&tmp).await);
        store.set_config(SOURCES_ROOT_KEY, &root_key(&sources)).await.unwrap();
        store.set_config(NOTES_ROOT_KEY, &root_key(&notes)).await.unwrap();
        Fixture {
            tmp,
            store,
            notifier: ChangeNotifier::new(64),
            sources,
            notes,
        }
    }

    async fn start(f: &Fixture) -> (SyncHandle, JoinHandle<()>) {
        let worker = SyncWorker::new(
            f.store.clone(),
            SourceSync::new(f.store.clone(), f.notifier.clone(), WalkOptions::default()),
            NoteAnalyzer::new(f.store.clone(), f.notifier.clone(), WalkOptions::default()),
        )
        .await
        .unwrap();
        worker.spawn(4)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn new_source_relinks_notes() {
        let f = fixture().await;
        fs::write(f.sources.join("a.pdf"), b"alpha").unwrap();
        let (handle, task) = start(&f).await;
        handle.scan_sources().await.unwrap();

        // The note links to content the store has never seen.
        let h2 = {
            let scratch = f.tmp.path().join("scratch");
            fs::write(&scratch, b"bravo").unwrap();
            file_hash(&scratch).unwrap()
        };
        fs::write(
            f.notes.join("note.odt"),
            build_odt(&format!(r#"<text:p><text:a xlink:href="src:{}">b</text:a></text:p>"#, h2)),
        )
        .unwrap();
        let report = handle.scan_notes().await.unwrap();
        assert_eq!(report.dangling, 1);

        let mut rx = f.notifier.subscribe();
        fs::write(f.sources.join("b.pdf"), b"bravo").unwrap();
        handle
            .send(SyncCommand::SourceChanged {
                root: f.sources.clone(),
                path: f.sources.join("b.pdf"),
            })
            .await
            .unwrap();

        let added = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(added, ChangeEvent::Added { .. }));
        let relinked = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(relinked, ChangeEvent::XrefChanged { ref source } if source.xref));
        assert!(f.store.xref_flag(&h2).await.unwrap());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn events_for_inactive_root_are_dropped() {
        let f = fixture().await;
        let old = f.tmp.path().join("old");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("x.pdf"), b"stale").unwrap();
        let (handle, task) = start(&f).await;

        handle
            .send(SyncCommand::SourceChanged {
                root: old.clone(),
                path: old.join("x.pdf"),
            })
            .await
            .unwrap();
        // Commands run in order, so once this returns the event was handled.
        handle.scan_sources().await.unwrap();

        assert!(f.store.sources().await.unwrap().is_empty());
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn scan_without_root_reports_not_configured() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(test_store(&tmp).await);
        let notifier = ChangeNotifier::default();
        let worker = SyncWorker::new(
            store.clone(),
            SourceSync::new(store.clone(), notifier.clone(), WalkOptions::default()),
            NoteAnalyzer::new(store.clone(), notifier, WalkOptions::default()),
        )
        .await
        .unwrap();
        assert!(worker.sources_root().is_none());
        let (handle, _task) = worker.spawn(4);

        let err = handle.scan_sources().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::RootNotConfigured(SOURCES_ROOT_KEY))
        ));
    }

    #[tokio::test]
    async fn changing_sources_root_rescans_and_retires_old_rows() {
        let f = fixture().await;
        fs::write(f.sources.join("a.pdf"), b"alpha").unwrap();
        fs::write(f.sources.join("b.pdf"), b"bravo").unwrap();
        let (handle, task) = start(&f).await;
        handle.scan_sources().await.unwrap();

        let moved = f.tmp.path().join("moved");
        fs::create_dir_all(&moved).unwrap();
        fs::write(moved.join("a.pdf"), b"alpha").unwrap();
        f.store
            .set_config(SOURCES_ROOT_KEY, &root_key(&moved))
            .await
            .unwrap();

        let store = f.store.clone();
        let moved_key = root_key(&moved);
        eventually(|| {
            let store = store.clone();
            let moved_key = moved_key.clone();
            async move {
                let sources = store.sources().await.unwrap();
                sources.len() == 1 && sources[0].root == moved_key
            }
        })
        .await;

        drop(handle);
        task.await.unwrap();
    }

    /// A second handle on the same database file, standing in for another
    /// `juridoc` process. Its writes never reach the worker's broadcast.
    async fn other_process(f: &Fixture) -> Arc<ContentStore> {
        let config = crate::config::Config::minimal(f.tmp.path().join("data").join("juridoc.sqlite"));
        Arc::new(ContentStore::open(&config).await.unwrap())
    }

    #[tokio::test]
    async fn sources_root_persisted_elsewhere_wins_over_stale_events() {
        let f = fixture().await;
        fs::write(f.sources.join("a.pdf"), b"alpha").unwrap();
        let (handle, task) = start(&f).await;
        handle.scan_sources().await.unwrap();

        let new = f.tmp.path().join("new");
        fs::create_dir_all(&new).unwrap();
        fs::write(new.join("n.pdf"), b"november").unwrap();
        let other = other_process(&f).await;
        other.set_config(SOURCES_ROOT_KEY, &root_key(&new)).await.unwrap();
        let sync = SourceSync::new(other.clone(), ChangeNotifier::default(), WalkOptions::default());
        sync.reconcile_root(&new).await.unwrap();
        sync.retire_other_roots(&new).await.unwrap();

        // The watcher still thinks the old root is live.
        fs::write(f.sources.join("b.pdf"), b"bravo").unwrap();
        handle
            .send(SyncCommand::SourceChanged {
                root: f.sources.clone(),
                path: f.sources.join("b.pdf"),
            })
            .await
            .unwrap();
        handle.scan_sources().await.unwrap();

        let rows: Vec<(String, String)> = f
            .store
            .sources()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.root, s.path))
            .collect();
        assert_eq!(rows, vec![(root_key(&new), "n.pdf".to_string())]);

        other.close().await;
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn notes_root_persisted_elsewhere_replaces_the_old_notes() {
        let f = fixture().await;
        fs::write(f.notes.join("old.txt"), b"old").unwrap();
        let (handle, task) = start(&f).await;
        handle.scan_notes().await.unwrap();

        let fresh = f.tmp.path().join("fresh");
        fs::create_dir_all(&fresh).unwrap();
        fs::write(fresh.join("new.txt"), b"new").unwrap();
        let other = other_process(&f).await;
        other.set_config(NOTES_ROOT_KEY, &root_key(&fresh)).await.unwrap();

        handle.send(SyncCommand::NotesChanged { root: f.notes.clone() }).await.unwrap();
        handle.send(SyncCommand::RefreshRoots).await.unwrap();
        handle.scan_notes().await.unwrap();

        assert!(f.store.notes_for_root(&root_key(&f.notes)).await.unwrap().is_empty());
        let notes = f.store.notes_for_root(&root_key(&fresh)).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].path, "new.txt");

        other.close().await;
        drop(handle);
        task.await.unwrap();
    }
}

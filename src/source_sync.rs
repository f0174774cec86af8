//! Reconciliation of the sources corpus against the store.
//!
//! A full scan hashes every file under the root, then matches each file to
//! an existing row in two passes:
//!
//! 1. by **hash** (global): same bytes, possibly a new location. The row is
//!    kept; if its location differs it is moved (`PathChanged`).
//! 2. by **(root, path)** for files the first pass left over: same
//!    location, new bytes. The row is kept with the new hash
//!    (`HashChanged`, preview cleared).
//!
//! Files matching neither become new rows (`Added`); rows under the root
//! that no file claimed are deleted (`Removed`). A file that was renamed
//! *and* edited between two scans matches neither pass and therefore shows
//! up as `Removed` + `Added`.
//!
//! All writes of one scan happen in a single [`WriteTxn`]; events are
//! published only after it commits.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::events::{ChangeEvent, ChangeNotifier};
use crate::models::{relative_path, root_key, Source, SourceRecord, SOURCES_SCANNED_AT_KEY};
use crate::progress::{should_report, Corpus, NoProgress, ScanProgressEvent, ScanProgressReporter};
use crate::store::{ContentStore, WriteTxn};
use crate::walk::{file_hash, is_at_or_under, list_files, HashedFile, TreeListing, WalkOptions};

/// Outcome of one reconciliation.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Files hashed successfully.
    pub scanned: usize,
    /// Relative paths that could not be read.
    pub skipped: Vec<String>,
    /// Everything that was published, in publish order.
    pub events: Vec<ChangeEvent>,
}

impl ScanReport {
    fn count(&self, pred: impl Fn(&ChangeEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn added(&self) -> usize {
        self.count(|e| matches!(e, ChangeEvent::Added { .. }))
    }

    pub fn hash_changed(&self) -> usize {
        self.count(|e| matches!(e, ChangeEvent::HashChanged { .. }))
    }

    pub fn path_changed(&self) -> usize {
        self.count(|e| matches!(e, ChangeEvent::PathChanged { .. }))
    }

    pub fn xref_changed(&self) -> usize {
        self.count(|e| matches!(e, ChangeEvent::XrefChanged { .. }))
    }

    pub fn removed(&self) -> usize {
        self.count(|e| matches!(e, ChangeEvent::Removed { .. }))
    }

    /// Whether the set of known hashes changed.
    pub fn alters_identity(&self) -> bool {
        self.events.iter().any(ChangeEvent::alters_identity)
    }
}

pub struct SourceSync {
    store: Arc<ContentStore>,
    notifier: ChangeNotifier,
    walk: WalkOptions,
    progress: Arc<dyn ScanProgressReporter>,
    missing_reported: Mutex<HashSet<PathBuf>>,
}

impl SourceSync {
    pub fn new(store: Arc<ContentStore>, notifier: ChangeNotifier, walk: WalkOptions) -> Self {
        Self {
            store,
            notifier,
            walk,
            progress: Arc::new(NoProgress),
            missing_reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ScanProgressReporter>) -> Self {
        self.progress = Arc::from(progress);
        self
    }

    /// Bring every row recorded under `root` in line with the files on disk.
    pub async fn reconcile_root(&self, root: &Path) -> Result<ScanReport> {
        let key = root_key(root);

        let (hashed, skipped) = if root.is_dir() {
            self.forget_missing(root);
            self.progress.report(ScanProgressEvent::Discovering {
                corpus: Corpus::Sources,
            });
            let walk = self.walk.clone();
            let progress = self.progress.clone();
            let root_buf = root.to_path_buf();
            tokio::task::spawn_blocking(move || hash_tree(&root_buf, &walk, progress.as_ref()))
                .await?
        } else {
            self.report_missing(root);
            (Vec::new(), Vec::new())
        };

        ensure_unique_content(&hashed)?;

        let mut txn = self.store.begin_write().await?;
        let events = plan_and_apply(&mut txn, &key, &hashed, &skipped).await?;
        txn.put_config(SOURCES_SCANNED_AT_KEY, &chrono::Utc::now().to_rfc3339())
            .await?;
        txn.commit().await?;

        self.publish(&events);
        Ok(ScanReport {
            scanned: hashed.len(),
            skipped,
            events,
        })
    }

    /// Re-examine one file after an add/modify notification.
    ///
    /// Directories fall back to a full reconcile of `root`; a path that no
    /// longer exists is handled as a removal.
    pub async fn reconcile_file(&self, root: &Path, path: &Path) -> Result<ScanReport> {
        let key = root_key(root);
        let relative = relative_path(root, path).ok_or_else(|| SyncError::OutsideRoot {
            root: key.clone(),
            path: path.display().to_string(),
        })?;

        if path.is_dir() {
            return self.reconcile_root(root).await;
        }
        if !path.exists() {
            return self.remove_file(root, path).await;
        }
        if self.walk.is_excluded(&relative) {
            return Ok(ScanReport::default());
        }

        let absolute = path.to_path_buf();
        let hash = match tokio::task::spawn_blocking(move || file_hash(&absolute)).await? {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read source, skipping");
                return Ok(ScanReport {
                    skipped: vec![relative],
                    ..ScanReport::default()
                });
            }
        };

        let mut txn = self.store.begin_write().await?;
        let mut events = Vec::new();

        if let Some(row) = txn.lookup_source_by_hash(&hash).await? {
            if row.root != key || row.path != relative {
                // Same bytes still present at the old location: a copy, not a move.
                let previous = row.absolute_path();
                let previous_hash =
                    tokio::task::spawn_blocking(move || file_hash(&previous).ok()).await?;
                if previous_hash.as_deref() == Some(hash.as_str()) {
                    return Err(SyncError::DuplicateContent {
                        hash,
                        first: row.path,
                        second: relative,
                    }
                    .into());
                }

                if let Some(occupant) = txn.lookup_source_by_path(&key, &relative).await? {
                    if let Some(source) = txn.delete_source(occupant.id).await? {
                        events.push(ChangeEvent::Removed { source });
                    }
                }
                move_source(&mut txn, row, &key, &relative, &mut events).await?;
            }
        } else if let Some(row) = txn.lookup_source_by_path(&key, &relative).await? {
            rehash_source(&mut txn, row, &hash, &mut events).await?;
        } else {
            add_source(&mut txn, &key, &relative, &hash, &mut events).await?;
        }

        txn.commit().await?;
        self.publish(&events);
        Ok(ScanReport {
            scanned: 1,
            skipped: Vec::new(),
            events,
        })
    }

    /// Handle a removal notification for exactly one path.
    ///
    /// A path that still exists is a stale notification and is ignored. A
    /// path with no row of its own but rows beneath it was a directory; the
    /// whole root is reconciled in that case.
    pub async fn remove_file(&self, root: &Path, path: &Path) -> Result<ScanReport> {
        let key = root_key(root);
        let relative = relative_path(root, path).ok_or_else(|| SyncError::OutsideRoot {
            root: key.clone(),
            path: path.display().to_string(),
        })?;

        if path.exists() {
            debug!(path = %path.display(), "removal notification for existing path, ignoring");
            return Ok(ScanReport::default());
        }

        let mut txn = self.store.begin_write().await?;
        let Some(row) = txn.lookup_source_by_path(&key, &relative).await? else {
            let prefix = format!("{}/", relative);
            let was_directory = txn
                .sources_under_root(&key)
                .await?
                .iter()
                .any(|s| s.path.starts_with(&prefix));
            drop(txn);
            if was_directory {
                return self.reconcile_root(root).await;
            }
            return Ok(ScanReport::default());
        };

        let mut events = Vec::new();
        if let Some(source) = txn.delete_source(row.id).await? {
            events.push(ChangeEvent::Removed { source });
        }
        txn.commit().await?;

        self.publish(&events);
        Ok(ScanReport {
            scanned: 0,
            skipped: Vec::new(),
            events,
        })
    }

    /// Remove every source recorded under a root other than `active`.
    ///
    /// Run after reconciling a newly selected root, so files that moved
    /// along with the corpus have already been matched by hash.
    pub async fn retire_other_roots(&self, active: &Path) -> Result<ScanReport> {
        let mut txn = self.store.begin_write().await?;
        let events: Vec<ChangeEvent> = txn
            .delete_sources_outside_root(&root_key(active))
            .await?
            .into_iter()
            .map(|source| ChangeEvent::Removed { source })
            .collect();
        txn.commit().await?;

        self.publish(&events);
        Ok(ScanReport {
            events,
            ..ScanReport::default()
        })
    }

    fn publish(&self, events: &[ChangeEvent]) {
        for event in events {
            log_event(event);
        }
        self.notifier.publish_all(events);
    }

    fn report_missing(&self, root: &Path) {
        let mut reported = self
            .missing_reported
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if reported.insert(root.to_path_buf()) {
            warn!(root = %root.display(), "sources root does not exist, treating it as empty");
        }
    }

    fn forget_missing(&self, root: &Path) {
        let mut reported = self
            .missing_reported
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reported.remove(root);
    }
}

/// Hash every file under `root`. Entries that could not be walked or read
/// are returned separately.
fn hash_tree(
    root: &Path,
    walk: &WalkOptions,
    progress: &dyn ScanProgressReporter,
) -> (Vec<HashedFile>, Vec<String>) {
    let TreeListing { files, unreadable } = list_files(root, walk);
    let total = files.len() as u64;

    let mut hashed = Vec::with_capacity(files.len());
    let mut skipped = unreadable;
    for (i, file) in files.into_iter().enumerate() {
        match file_hash(&file.absolute) {
            Ok(hash) => hashed.push(HashedFile {
                relative: file.relative,
                hash,
            }),
            Err(e) => {
                warn!(path = %file.absolute.display(), error = %e, "cannot read source, skipping");
                skipped.push(file.relative);
            }
        }

        let n = i as u64 + 1;
        if should_report(n, total) {
            progress.report(ScanProgressEvent::Processing {
                corpus: Corpus::Sources,
                n,
                total,
                unreadable: skipped.len() as u64,
            });
        }
    }

    skipped.sort();
    (hashed, skipped)
}

fn ensure_unique_content(files: &[HashedFile]) -> Result<(), SyncError> {
    let mut seen: HashMap<&str, &str> = HashMap::with_capacity(files.len());
    for file in files {
        if let Some(first) = seen.insert(&file.hash, &file.relative) {
            return Err(SyncError::DuplicateContent {
                hash: file.hash.clone(),
                first: first.to_string(),
                second: file.relative.clone(),
            });
        }
    }
    Ok(())
}

/// Match `files` against the store and write the result into `txn`.
async fn plan_and_apply(
    txn: &mut WriteTxn,
    root: &str,
    files: &[HashedFile],
    skipped: &[String],
) -> Result<Vec<ChangeEvent>> {
    let existing = txn.sources_under_root(root).await?;

    // Rows at or under an entry that could not be read stay as they are.
    let mut keep: HashSet<i64> = existing
        .iter()
        .filter(|s| skipped.iter().any(|entry| is_at_or_under(&s.path, entry)))
        .map(|s| s.id)
        .collect();

    let mut moves: Vec<(Source, &HashedFile)> = Vec::new();
    let mut unmatched: Vec<&HashedFile> = Vec::new();
    for file in files {
        match txn.lookup_source_by_hash(&file.hash).await? {
            Some(row) => {
                keep.insert(row.id);
                if row.root != root || row.path != file.relative {
                    moves.push((row, file));
                }
            }
            None => unmatched.push(file),
        }
    }

    let mut edits: Vec<(Source, &HashedFile)> = Vec::new();
    let mut additions: Vec<&HashedFile> = Vec::new();
    for file in unmatched {
        match txn.lookup_source_by_path(root, &file.relative).await? {
            // A row claimed by hash has moved away; its old path is free.
            Some(row) if !keep.contains(&row.id) => {
                keep.insert(row.id);
                edits.push((row, file));
            }
            _ => additions.push(file),
        }
    }

    let mut events = Vec::new();

    for source in txn.delete_sources_not_in(root, &keep).await? {
        events.push(ChangeEvent::Removed { source });
    }

    // Park first so that swaps and rotations never collide on UNIQUE(root, path).
    for (row, _) in &moves {
        txn.park_source(row.id).await?;
    }
    for (row, file) in moves {
        move_source(txn, row, root, &file.relative, &mut events).await?;
    }

    for (row, file) in edits {
        rehash_source(txn, row, &file.hash, &mut events).await?;
    }

    for file in additions {
        add_source(txn, root, &file.relative, &file.hash, &mut events).await?;
    }

    Ok(events)
}

async fn move_source(
    txn: &mut WriteTxn,
    row: Source,
    root: &str,
    path: &str,
    events: &mut Vec<ChangeEvent>,
) -> Result<()> {
    let updated = txn
        .upsert_source(&SourceRecord {
            id: Some(row.id),
            hash: row.hash.clone(),
            root: root.to_string(),
            path: path.to_string(),
        })
        .await?;

    let xref_flipped = updated.xref != row.xref;
    events.push(ChangeEvent::PathChanged {
        source: updated.clone(),
        previous_root: row.root,
        previous_path: row.path,
    });
    if xref_flipped {
        events.push(ChangeEvent::XrefChanged { source: updated });
    }
    Ok(())
}

async fn rehash_source(
    txn: &mut WriteTxn,
    row: Source,
    hash: &str,
    events: &mut Vec<ChangeEvent>,
) -> Result<()> {
    let updated = txn
        .upsert_source(&SourceRecord {
            id: Some(row.id),
            hash: hash.to_string(),
            root: row.root.clone(),
            path: row.path.clone(),
        })
        .await?;

    let xref_flipped = updated.xref != row.xref;
    events.push(ChangeEvent::HashChanged {
        source: updated.clone(),
        previous_hash: row.hash,
    });
    if xref_flipped {
        events.push(ChangeEvent::XrefChanged { source: updated });
    }
    Ok(())
}

async fn add_source(
    txn: &mut WriteTxn,
    root: &str,
    path: &str,
    hash: &str,
    events: &mut Vec<ChangeEvent>,
) -> Result<()> {
    let source = txn
        .upsert_source(&SourceRecord {
            id: None,
            hash: hash.to_string(),
            root: root.to_string(),
            path: path.to_string(),
        })
        .await?;
    events.push(ChangeEvent::Added { source });
    Ok(())
}

fn log_event(event: &ChangeEvent) {
    match event {
        ChangeEvent::Added { source } => info!(id = source.id, "source added: {}", source.path),
        ChangeEvent::HashChanged { source, .. } => {
            info!(id = source.id, "source content changed: {}", source.path)
        }
        ChangeEvent::PathChanged {
            source,
            previous_path,
            ..
        } => info!(
            id = source.id,
            "source renamed: {} -> {}", previous_path, source.path
        ),
        ChangeEvent::XrefChanged { source } => {
            debug!(id = source.id, xref = source.xref, "source xref changed: {}", source.path)
        }
        ChangeEvent::Removed { source } => info!(id = source.id, "source removed: {}", source.path),
    }
}

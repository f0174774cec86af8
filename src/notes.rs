//! Notes analysis: rebuild every note and cross-reference of a notes root.
//!
//! Notes have no identity across scans, so each rebuild throws away the
//! root's previous rows and records the tree as it is now. Every regular
//! file becomes a note; only `.odt` documents are opened, and only their
//! `src:<hex>` links that name a known source become cross-references.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::events::{ChangeEvent, ChangeNotifier};
use crate::models::{root_key, AnalyzedNote};
use crate::odt;
use crate::progress::{should_report, Corpus, NoProgress, ScanProgressEvent, ScanProgressReporter};
use crate::store::ContentStore;
use crate::walk::{list_files, TreeListing, WalkOptions};

/// Outcome of one notes rebuild.
#[derive(Debug, Default)]
pub struct NotesReport {
    /// Notes recorded, documents or not.
    pub notes: usize,
    /// Notes that were parsed as documents.
    pub documents: usize,
    /// Documents that failed to parse; recorded with no references.
    pub malformed: Vec<String>,
    /// Files that could not be read and were left out.
    pub skipped: Vec<String>,
    pub xrefs: usize,
    /// `src:` links naming no known source.
    pub dangling: usize,
    pub events: Vec<ChangeEvent>,
}

pub struct NoteAnalyzer {
    store: Arc<ContentStore>,
    notifier: ChangeNotifier,
    walk: WalkOptions,
    progress: Arc<dyn ScanProgressReporter>,
}

struct AnalyzedTree {
    notes: Vec<AnalyzedNote>,
    documents: usize,
    malformed: Vec<String>,
    skipped: Vec<String>,
}

impl NoteAnalyzer {
    pub fn new(store: Arc<ContentStore>, notifier: ChangeNotifier, walk: WalkOptions) -> Self {
        Self {
            store,
            notifier,
            walk,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ScanProgressReporter>) -> Self {
        self.progress = Arc::from(progress);
        self
    }

    pub async fn rebuild(&self, root: &Path) -> Result<NotesReport> {
        let key = root_key(root);

        let tree = if root.is_dir() {
            self.progress.report(ScanProgressEvent::Discovering {
                corpus: Corpus::Notes,
            });
            let walk = self.walk.clone();
            let progress = self.progress.clone();
            let root_buf = root.to_path_buf();
            tokio::task::spawn_blocking(move || analyze_tree(&root_buf, &walk, progress.as_ref()))
                .await?
        } else {
            warn!(root = %root.display(), "notes root does not exist, treating it as empty");
            AnalyzedTree {
                notes: Vec::new(),
                documents: 0,
                malformed: Vec::new(),
                skipped: Vec::new(),
            }
        };

        let known = self.store.source_hashes().await?;
        let mut notes = tree.notes;
        let dangling = resolve_targets(&mut notes, &known);

        let replaced = self.store.replace_notes_for_root(&key, &notes).await?;

        for event in &replaced.events {
            let source = event.source();
            debug!(id = source.id, xref = source.xref, "source xref changed: {}", source.path);
        }
        self.notifier.publish_all(&replaced.events);

        info!(
            root = %key,
            notes = replaced.notes,
            xrefs = replaced.xrefs,
            dangling,
            "notes rebuilt"
        );
        Ok(NotesReport {
            notes: replaced.notes,
            documents: tree.documents,
            malformed: tree.malformed,
            skipped: tree.skipped,
            xrefs: replaced.xrefs,
            dangling,
            events: replaced.events,
        })
    }

    /// Forget every note of `root`, e.g. after the notes root moved elsewhere.
    pub async fn clear(&self, root: &Path) -> Result<NotesReport> {
        let replaced = self.store.replace_notes_for_root(&root_key(root), &[]).await?;
        self.notifier.publish_all(&replaced.events);
        info!(root = %root.display(), "notes cleared");
        Ok(NotesReport {
            events: replaced.events,
            ..NotesReport::default()
        })
    }
}

fn analyze_tree(
    root: &Path,
    walk: &WalkOptions,
    progress: &dyn ScanProgressReporter,
) -> AnalyzedTree {
    let TreeListing { files, unreadable } = list_files(root, walk);
    let total = files.len() as u64;

    let mut tree = AnalyzedTree {
        notes: Vec::with_capacity(files.len()),
        documents: 0,
        malformed: Vec::new(),
        skipped: unreadable,
    };

    for (i, file) in files.into_iter().enumerate() {
        let n = i as u64 + 1;
        if should_report(n, total) {
            progress.report(ScanProgressEvent::Processing {
                corpus: Corpus::Notes,
                n,
                total,
                unreadable: tree.skipped.len() as u64,
            });
        }

        if !odt::is_note_document(&file.absolute) {
            tree.notes.push(AnalyzedNote {
                path: file.relative,
                targets: Vec::new(),
            });
            continue;
        }

        let bytes = match std::fs::read(&file.absolute) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %file.absolute.display(), error = %e, "cannot read note, skipping");
                tree.skipped.push(file.relative);
                continue;
            }
        };

        tree.documents += 1;
        let targets = match odt::extract_link_targets(&bytes) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(path = %file.absolute.display(), error = %e, "malformed note document");
                tree.malformed.push(file.relative.clone());
                Vec::new()
            }
        };
        tree.notes.push(AnalyzedNote {
            path: file.relative,
            targets,
        });
    }

    tree.skipped.sort();
    tree
}

/// Drop targets that name no known source. Returns how many were dropped.
fn resolve_targets(notes: &mut [AnalyzedNote], known: &HashSet<String>) -> usize {
    let mut dangling = 0;
    for note in notes.iter_mut() {
        let before = note.targets.len();
        note.targets.retain(|hash| known.contains(hash));
        let dropped = before - note.targets.len();
        if dropped > 0 {
            debug!(note = %note.path, dropped, "unresolved source links");
        }
        dangling += dropped;
    }
    dangling
}

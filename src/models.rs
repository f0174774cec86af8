//! Core data models shared by the store, the sync layer and the exporters.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Persisted config key holding the active sources root.
pub const SOURCES_ROOT_KEY: &str = "sources_root";
/// Persisted config key holding the active notes root.
pub const NOTES_ROOT_KEY: &str = "notes_root";
/// Timestamp of the last completed full sources scan.
pub const SOURCES_SCANNED_AT_KEY: &str = "sources_scanned_at";
/// Timestamp of the last completed notes rebuild.
pub const NOTES_SCANNED_AT_KEY: &str = "notes_scanned_at";

/// A file of the sources corpus, identified by the SHA-256 of its bytes.
///
/// `xref` is never stored: it is derived from the `xref` table every time a
/// row is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub id: i64,
    pub hash: String,
    pub root: String,
    pub path: String,
    pub xref: bool,
    pub has_preview: bool,
}

impl Source {
    pub fn absolute_path(&self) -> PathBuf {
        Path::new(&self.root).join(&self.path)
    }
}

/// Fields written by [`crate::store::WriteTxn::upsert_source`].
///
/// `id: None` inserts a new identity; `Some(id)` updates that row in place.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: Option<i64>,
    pub hash: String,
    pub root: String,
    pub path: String,
}

/// A file of the notes corpus. Ids are not stable across rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    pub id: i64,
    pub root: String,
    pub path: String,
    pub xref_count: i64,
}

/// One analysed note, ready to be written by
/// [`crate::store::ContentStore::replace_notes_for_root`].
#[derive(Debug, Clone, Default)]
pub struct AnalyzedNote {
    pub path: String,
    /// Lowercase hex hashes the note links to via `src:<hex>`.
    pub targets: Vec<String>,
}

/// A source as seen by the index exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub id: i64,
    pub hash: String,
    pub root: String,
    pub path: String,
    pub xref: bool,
}

/// Relative path of `path` under `root`, always with `/` separators.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// String form of a root as stored in the `root` columns.
pub fn root_key(root: &Path) -> String {
    root.to_string_lossy().to_string()
}

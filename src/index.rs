//! The numbered sources index (`index.csv`).
//!
//! Every source gets an `idx` the first time it is exported. The index is
//! meant to be edited by hand, so re-exporting merges against the previous
//! file: a source that already has a row keeps every non-empty cell of that
//! row, even where the freshly computed value differs (stale wins), and any
//! columns the user added are carried along verbatim.
//!
//! # Columns
//!
//! | Column | Fresh value |
//! |--------|-------------|
//! | `idx` | Source id, or the next free number if that id is taken |
//! | `uri` | Content hash |
//! | `source` | Path relative to the sources root |
//! | `dest` | Same directory, file name prefixed with `NNN - ` |
//! | `xref` | `true` / `false` |

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::models::ExportRow;
use crate::store::ContentStore;

pub const IDX: &str = "idx";
pub const URI: &str = "uri";
pub const SOURCE: &str = "source";
pub const DEST: &str = "dest";
pub const XREF: &str = "xref";

/// Base columns, in output order. Custom columns follow.
pub const BASE_COLUMNS: [&str; 5] = [IDX, URI, SOURCE, DEST, XREF];

/// One index row: column name to cell value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRow {
    cells: HashMap<String, String>,
}

impl IndexRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells.get(column).map(String::as_str)
    }

    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        self.cells.insert(column.to_string(), value.into());
    }

    pub fn idx(&self) -> Option<u64> {
        self.get(IDX).and_then(|v| v.trim().parse().ok())
    }

    pub fn uri(&self) -> Option<&str> {
        self.get(URI)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTable {
    pub headers: Vec<String>,
    pub rows: Vec<IndexRow>,
}

impl IndexTable {
    /// Read a previously exported index. A missing file is `Ok(None)`.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open index: {}", path.display()))?;

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read index header: {}", path.display()))?
            .iter()
            .map(normalize_header)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Malformed index: {}", path.display()))?;
            let mut row = IndexRow::default();
            for (i, header) in headers.iter().enumerate() {
                if header.is_empty() || row.cells.contains_key(header) {
                    continue;
                }
                row.set(header, record.get(i).unwrap_or(""));
            }
            rows.push(row);
        }

        Ok(Some(Self { headers, rows }))
    }

    /// Write the table, header row first. Parent directories are created.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create index: {}", path.display()))?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(self.headers.iter().map(|h| row.get(h).unwrap_or("")))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn row_for(&self, uri: &str) -> Option<&IndexRow> {
        self.rows
            .iter()
            .find(|r| r.uri().is_some_and(|u| u.eq_ignore_ascii_case(uri)))
    }

    /// `idx` cell per (lowercased) uri, as written.
    pub fn idx_by_uri(&self) -> HashMap<String, String> {
        self.column_by_uri(IDX)
    }

    /// `dest` cell per (lowercased) uri, as written.
    pub fn dest_by_uri(&self) -> HashMap<String, String> {
        self.column_by_uri(DEST)
    }

    fn column_by_uri(&self, column: &str) -> HashMap<String, String> {
        self.rows
            .iter()
            .filter_map(|r| Some((r.uri()?.to_ascii_lowercase(), r.get(column)?.to_string())))
            .filter(|(_, v)| !v.is_empty())
            .collect()
    }
}

/// Builds and writes the index from the store's current sources.
pub struct IndexExporter {
    store: Arc<ContentStore>,
}

impl IndexExporter {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }

    /// Merge the store's sources with the index at `path` (if any), without
    /// writing anything.
    pub async fn build(&self, path: &Path) -> Result<IndexTable> {
        let sources = self.store.export_rows().await?;
        let prior = IndexTable::read(path)?;
        Ok(merge_index(&sources, prior.as_ref()))
    }

    /// Merge and write the index to `path`.
    pub async fn export(&self, path: &Path) -> Result<IndexTable> {
        let table = self.build(path).await?;
        table.write(path)?;
        info!(path = %path.display(), rows = table.rows.len(), "index exported");
        Ok(table)
    }
}

/// One row per source in `sources`, merged over `prior`, sorted by `idx`.
pub fn merge_index(sources: &[ExportRow], prior: Option<&IndexTable>) -> IndexTable {
    let mut headers: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut prior_rows: HashMap<String, &IndexRow> = HashMap::new();

    if let Some(prior) = prior {
        for header in &prior.headers {
            if !header.is_empty() && !headers.contains(header) {
                headers.push(header.clone());
            }
        }
        for row in &prior.rows {
            if let Some(uri) = row.uri().map(|u| u.trim().to_ascii_lowercase()) {
                if !uri.is_empty() {
                    prior_rows.entry(uri).or_insert(row);
                }
            }
        }
    }

    // Numbers already claimed by carried-forward rows.
    let mut used: HashSet<u64> = sources
        .iter()
        .filter_map(|s| prior_rows.get(&s.hash).and_then(|r| r.idx()))
        .collect();
    let mut max_used = used.iter().copied().max().unwrap_or(0);

    let mut rows = Vec::with_capacity(sources.len());
    for source in sources {
        let prior_row = prior_rows.get(&source.hash).copied();
        let prior_idx = prior_row
            .and_then(|r| r.get(IDX))
            .filter(|v| !v.trim().is_empty());

        let idx = match prior_idx {
            Some(cell) => cell.to_string(),
            None => {
                let id = u64::try_from(source.id).unwrap_or(0);
                let next = if id > 0 && !used.contains(&id) {
                    id
                } else {
                    max_used + 1
                };
                used.insert(next);
                max_used = max_used.max(next);
                next.to_string()
            }
        };

        let mut row = fresh_row(source, &idx);
        if let Some(prior_row) = prior_row {
            for (column, value) in &prior_row.cells {
                let is_base = BASE_COLUMNS.contains(&column.as_str());
                if !is_base || !value.is_empty() {
                    row.set(column, value.clone());
                }
            }
        } else {
            debug!(id = source.id, idx = %idx, "new index row: {}", source.path);
        }
        rows.push(row);
    }

    rows.sort_by(compare_rows);
    IndexTable { headers, rows }
}

fn fresh_row(source: &ExportRow, idx: &str) -> IndexRow {
    let mut row = IndexRow::default();
    row.set(IDX, idx);
    row.set(URI, source.hash.clone());
    row.set(SOURCE, source.path.clone());
    row.set(DEST, dest_path(&source.path, idx));
    row.set(XREF, if source.xref { "true" } else { "false" });
    row
}

/// `dir/NNN - name` for a `/`-separated relative path.
pub fn dest_path(relative: &str, idx: &str) -> String {
    let prefix = match idx.trim().parse::<u64>() {
        Ok(n) => format!("{:03}", n),
        Err(_) => idx.to_string(),
    };
    match relative.rsplit_once('/') {
        Some((dir, name)) => format!("{}/{} - {}", dir, prefix, name),
        None => format!("{} - {}", prefix, relative),
    }
}

/// Numeric `idx` ascending; rows without a numeric `idx` last; then by uri.
fn compare_rows(a: &IndexRow, b: &IndexRow) -> Ordering {
    let by_idx = match (a.idx(), b.idx()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_idx.then_with(|| a.uri().cmp(&b.uri()))
}

fn normalize_header(header: &str) -> String {
    let trimmed = header.trim();
    BASE_COLUMNS
        .iter()
        .find(|base| base.eq_ignore_ascii_case(trimmed))
        .map(|base| base.to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

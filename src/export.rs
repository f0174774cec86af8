//! Export of the index, the numbered sources tree and the rendered notes.
//!
//! Layout under `[output].dir`:
//!
//! ```text
//! index.csv            merged numbered index
//! sources/<dest>       each source copied to its `dest` cell
//! notes/<path>         rendered or verbatim notes
//! ```
//!
//! The sources and notes trees are always derived from the *merged* index,
//! so the numbers in rendered notes and copied file names agree with
//! `index.csv`, including any values edited by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::index::{dest_path, IndexExporter};
use crate::models::{ExportRow, NOTES_ROOT_KEY};
use crate::render::{safe_join, CrossReferenceRenderer, RenderReport};
use crate::store::ContentStore;

const SOURCES_DIR: &str = "sources";
const NOTES_DIR: &str = "notes";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportTarget {
    Index,
    /// The sources tree; `xref_only` keeps only referenced sources.
    Sources { xref_only: bool },
    Notes,
    /// Index, referenced sources and notes.
    All,
}

#[derive(Debug, Default)]
pub struct CopyReport {
    pub copied: usize,
    /// Left out by the `xref` filter.
    pub filtered: usize,
    /// Recorded in the store but no longer on disk.
    pub missing: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ExportSummary {
    /// Set when the index file was written.
    pub index: Option<(PathBuf, usize)>,
    pub sources: Option<CopyReport>,
    pub notes: Option<RenderReport>,
}

pub async fn run_export(
    store: Arc<ContentStore>,
    config: &Config,
    target: ExportTarget,
) -> Result<ExportSummary> {
    let index_path = config.index_path();
    let out_dir = &config.output.dir;
    let exporter = IndexExporter::new(store.clone());

    let writes_index = matches!(target, ExportTarget::Index | ExportTarget::All);
    let table = if writes_index {
        exporter.export(&index_path).await?
    } else {
        exporter.build(&index_path).await?
    };

    let mut summary = ExportSummary {
        index: writes_index.then(|| (index_path.clone(), table.rows.len())),
        ..ExportSummary::default()
    };

    let xref_only = match target {
        ExportTarget::Sources { xref_only } => Some(xref_only),
        ExportTarget::All => Some(true),
        _ => None,
    };
    if let Some(xref_only) = xref_only {
        let rows = store.export_rows().await?;
        let dests = table.dest_by_uri();
        let dir = out_dir.join(SOURCES_DIR);
        let report = tokio::task::spawn_blocking(move || copy_sources(&rows, &dests, &dir, xref_only))
            .await??;
        info!(copied = report.copied, filtered = report.filtered, "sources exported");
        summary.sources = Some(report);
    }

    if matches!(target, ExportTarget::Notes | ExportTarget::All) {
        let notes_root = store
            .get_config(NOTES_ROOT_KEY)
            .await?
            .ok_or(SyncError::RootNotConfigured(NOTES_ROOT_KEY))?;
        let report = CrossReferenceRenderer::new(store.clone())
            .render_root(
                Path::new(&notes_root),
                table.idx_by_uri(),
                &out_dir.join(NOTES_DIR),
            )
            .await?;
        summary.notes = Some(report);
    }

    Ok(summary)
}

/// Copy each source to `out_dir/<dest>`. The `xref` filter uses the live
/// flag in `rows`, not the index cell.
fn copy_sources(
    rows: &[ExportRow],
    dests: &HashMap<String, String>,
    out_dir: &Path,
    xref_only: bool,
) -> Result<CopyReport> {
    let mut report = CopyReport::default();

    for row in rows {
        if xref_only && !row.xref {
            report.filtered += 1;
            continue;
        }

        let input = Path::new(&row.root).join(&row.path);
        if !input.is_file() {
            warn!(path = %input.display(), "source vanished since the last scan, skipping");
            report.missing.push(row.path.clone());
            continue;
        }

        let dest = dests
            .get(&row.hash)
            .cloned()
            .unwrap_or_else(|| dest_path(&row.path, &row.id.to_string()));
        let Some(output) = safe_join(out_dir, &dest) else {
            warn!(dest = %dest, "dest escapes the output directory, skipping");
            report.missing.push(row.path.clone());
            continue;
        };

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::copy(&input, &output).with_context(|| {
            format!("Failed to copy {} to {}", input.display(), output.display())
        })?;
        report.copied += 1;
    }

    Ok(report)
}

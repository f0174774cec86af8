//! Rendering of the notes tree for export.
//!
//! A note with at least one cross-reference is rewritten so that each link
//! to a known source shows that source's `idx` instead of its original text.
//! Every other note (no references, not a document, or failing to render)
//! is copied byte for byte.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::models::{root_key, Note};
use crate::odt;
use crate::store::ContentStore;

#[derive(Debug, Default)]
pub struct RenderReport {
    pub rendered: usize,
    pub copied: usize,
    /// Notes that could not be rendered and were copied instead.
    pub failed: Vec<String>,
}

pub struct CrossReferenceRenderer {
    store: Arc<ContentStore>,
}

impl CrossReferenceRenderer {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }

    /// Render every note recorded under `notes_root` into `out_dir`.
    ///
    /// `idx_by_uri` maps lowercase source hashes to the `idx` text to show.
    pub async fn render_root(
        &self,
        notes_root: &Path,
        idx_by_uri: HashMap<String, String>,
        out_dir: &Path,
    ) -> Result<RenderReport> {
        let notes = self.store.notes_for_root(&root_key(notes_root)).await?;
        let root = notes_root.to_path_buf();
        let out = out_dir.to_path_buf();

        let report = tokio::task::spawn_blocking(move || -> Result<RenderReport> {
            let mut report = RenderReport::default();
            for note in &notes {
                render_note(note, &root, &idx_by_uri, &out, &mut report)?;
            }
            Ok(report)
        })
        .await??;

        info!(
            rendered = report.rendered,
            copied = report.copied,
            failed = report.failed.len(),
            "notes exported"
        );
        Ok(report)
    }
}

fn render_note(
    note: &Note,
    root: &Path,
    idx_by_uri: &HashMap<String, String>,
    out_dir: &Path,
    report: &mut RenderReport,
) -> Result<()> {
    let input = root.join(&note.path);
    let Some(output) = safe_join(out_dir, &note.path) else {
        warn!(path = %note.path, "note path escapes the output directory, skipping");
        return Ok(());
    };
    if !input.is_file() {
        warn!(path = %input.display(), "note vanished since the last scan, skipping");
        return Ok(());
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    if note.xref_count > 0 && odt::is_note_document(&input) {
        match render_document(&input, idx_by_uri) {
            Ok(bytes) => {
                std::fs::write(&output, bytes)
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                report.rendered += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(path = %input.display(), error = %e, "cannot render note, copying it unchanged");
                report.failed.push(note.path.clone());
            }
        }
    }

    std::fs::copy(&input, &output)
        .with_context(|| format!("Failed to copy {} to {}", input.display(), output.display()))?;
    report.copied += 1;
    Ok(())
}

fn render_document(input: &Path, idx_by_uri: &HashMap<String, String>) -> Result<Vec<u8>> {
    let bytes = std::fs::read(input)?;
    let rendered = odt::rewrite_links(&bytes, |href| {
        let hash = odt::parse_src_target(href)?;
        idx_by_uri.get(&hash).cloned()
    })?;
    Ok(rendered)
}

/// `base` joined with a `/`-separated relative path, or `None` if the path
/// is absolute or climbs out of `base`.
pub fn safe_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let mut out = base.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    (depth > 0).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odt::tests::build_odt;
    use crate::store::tests::test_store;
    use crate::models::AnalyzedNote;
    use std::io::{Cursor, Read};
    use tempfile::TempDir;

    fn content_xml(document: &[u8]) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(document)).unwrap();
        let mut out = String::new();
        archive
            .by_name("content.xml")
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let base = Path::new("/out");
        assert_eq!(safe_join(base, "a/b.odt"), Some(PathBuf::from("/out/a/b.odt")));
        assert_eq!(safe_join(base, "../b.odt"), None);
        assert_eq!(safe_join(base, "/etc/passwd"), None);
        assert_eq!(safe_join(base, ""), None);
    }

    #[tokio::test]
    async fn referenced_notes_are_rendered_and_others_copied() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(test_store(&tmp).await);
        let notes_root = tmp.path().join("notes");
        let out = tmp.path().join("out/notes");
        std::fs::create_dir_all(notes_root.join("sub")).unwrap();

        let h1 = "a1".repeat(32);
        let h3 = "c3".repeat(32);
        let linked = build_odt(&format!(
            r#"<text:p><text:a xlink:href="src:{}">Exhibit</text:a> <text:a xlink:href="src:{}">Gone</text:a></text:p>"#,
            h1, h3
        ));
        let plain = build_odt("<text:p>nothing here</text:p>");
        std::fs::write(notes_root.join("sub/linked.odt"), &linked).unwrap();
        std::fs::write(notes_root.join("plain.odt"), &plain).unwrap();
        std::fs::write(notes_root.join("readme.txt"), b"hello").unwrap();

        let mut txn = store.begin_write().await.unwrap();
        txn.upsert_source(&crate::models::SourceRecord {
            id: None,
            hash: h1.clone(),
            root: "/sources".to_string(),
            path: "a.pdf".to_string(),
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();
        store
            .replace_notes_for_root(
                &root_key(&notes_root),
                &[
                    AnalyzedNote {
                        path: "plain.odt".to_string(),
                        targets: vec![],
                    },
                    AnalyzedNote {
                        path: "readme.txt".to_string(),
                        targets: vec![],
                    },
                    AnalyzedNote {
                        path: "sub/linked.odt".to_string(),
                        targets: vec![h1.clone(), h3.clone()],
                    },
                ],
            )
            .await
            .unwrap();

        let idx = HashMap::from([(h1.clone(), "7".to_string())]);
        let report = CrossReferenceRenderer::new(store)
            .render_root(&notes_root, idx, &out)
            .await
            .unwrap();

        assert_eq!(report.rendered, 1);
        assert_eq!(report.copied, 2);
        assert!(report.failed.is_empty());

        let rendered = content_xml(&std::fs::read(out.join("sub/linked.odt")).unwrap());
        assert!(rendered.contains(&format!(r#"<text:a xlink:href="src:{}">7</text:a>"#, h1)));
        assert!(rendered.contains(&format!(r#"<text:a xlink:href="src:{}">Gone</text:a>"#, h3)));
        assert_eq!(std::fs::read(out.join("plain.odt")).unwrap(), plain);
        assert_eq!(std::fs::read(out.join("readme.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn unrenderable_note_is_copied_verbatim() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(test_store(&tmp).await);
        let notes_root = tmp.path().join("notes");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&notes_root).unwrap();

        let h1 = "a1".repeat(32);
        let mut txn = store.begin_write().await.unwrap();
        txn.upsert_source(&crate::models::SourceRecord {
            id: None,
            hash: h1.clone(),
            root: "/sources".to_string(),
            path: "a.pdf".to_string(),
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();
        store
            .replace_notes_for_root(
                &root_key(&notes_root),
                &[AnalyzedNote {
                    path: "note.odt".to_string(),
                    targets: vec![h1.clone()],
                }],
            )
            .await
            .unwrap();
        // Replaced on disk by something that is no longer a valid package.
        std::fs::write(notes_root.join("note.odt"), b"corrupted").unwrap();

        let report = CrossReferenceRenderer::new(store)
            .render_root(&notes_root, HashMap::from([(h1, "1".to_string())]), &out)
            .await
            .unwrap();

        assert_eq!(report.rendered, 0);
        assert_eq!(report.failed, vec!["note.odt"]);
        assert_eq!(std::fs::read(out.join("note.odt")).unwrap(), b"corrupted");
    }
}

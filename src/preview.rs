//! Background text previews for sources.
//!
//! [`PreviewWorker`] listens to the [`ChangeNotifier`](crate::events::ChangeNotifier)
//! and, for every new or edited source, extracts the first few thousand
//! characters of text. Extraction runs outside the write lock; the result
//! is stored only if the row still carries the hash the text was computed
//! from, so a preview can never be attached to newer content.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PreviewConfig;
use crate::events::ChangeEvent;
use crate::models::Source;
use crate::odt;
use crate::store::ContentStore;
use crate::walk::bytes_hash;

pub struct PreviewWorker {
    store: Arc<ContentStore>,
    max_chars: usize,
}

impl PreviewWorker {
    pub fn new(store: Arc<ContentStore>, config: &PreviewConfig) -> Self {
        Self {
            store,
            max_chars: config.max_chars,
        }
    }

    /// Consume change events until the notifier goes away.
    pub fn spawn(self, mut events: broadcast::Receiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChangeEvent::Added { source }) | Ok(ChangeEvent::HashChanged { source, .. }) => {
                        if let Err(e) = self.refresh(&source).await {
                            warn!(id = source.id, error = %e, "preview generation failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "preview worker lagged; filling missing previews");
                        if let Err(e) = self.fill_missing().await {
                            warn!(error = %e, "preview backfill failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Compute and store the preview of one source. Returns whether a
    /// preview was written.
    pub async fn refresh(&self, source: &Source) -> Result<bool> {
        let path = source.absolute_path();
        let hash = source.hash.clone();
        let max_chars = self.max_chars;

        let text = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let bytes = std::fs::read(&path)?;
            if bytes_hash(&bytes) != hash {
                // The file moved on; a newer event will follow.
                return Ok(None);
            }
            Ok(extract_preview(&path, &bytes, max_chars))
        })
        .await??;

        let Some(text) = text else {
            return Ok(false);
        };
        let written = self
            .store
            .set_preview(source.id, &source.hash, text.as_bytes())
            .await?;
        debug!(id = source.id, written, "preview");
        Ok(written)
    }

    /// Generate previews for every source that has none.
    pub async fn fill_missing(&self) -> Result<usize> {
        let mut written = 0;
        for source in self.store.sources().await? {
            if source.has_preview {
                continue;
            }
            match self.refresh(&source).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %source.path, error = %e, "preview generation failed"),
            }
        }
        Ok(written)
    }
}

/// Best-effort text of a document, truncated to `max_chars` characters.
/// `None` when the format is not understood or holds no text.
pub fn extract_preview(path: &Path, bytes: &[u8], max_chars: usize) -> Option<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let text = match extension.as_str() {
        "pdf" => pdf_extract::extract_text_from_mem(bytes).ok()?,
        "odt" => odt::extract_text(bytes).ok()?,
        _ => String::from_utf8(bytes.to_vec()).ok()?,
    };

    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(max_chars).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeNotifier;
    use crate::odt::tests::build_odt;
    use crate::source_sync::SourceSync;
    use crate::store::tests::test_store;
    use crate::walk::WalkOptions;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    fn config(max_chars: usize) -> PreviewConfig {
        PreviewConfig {
            enabled: true,
            max_chars,
        }
    }

    #[test]
    fn text_is_trimmed_and_truncated_by_characters() {
        let preview = extract_preview(Path::new("a.txt"), "  héllo wörld \n".as_bytes(), 4);
        assert_eq!(preview.as_deref(), Some("héll"));
    }

    #[test]
    fn odt_text_is_extracted() {
        let doc = build_odt("<text:p>Statement of claim</text:p>");
        let preview = extract_preview(Path::new("n.ODT"), &doc, 100);
        assert_eq!(preview.as_deref(), Some("Statement of claim"));
    }

    #[test]
    fn binary_and_empty_files_have_no_preview() {
        assert_eq!(extract_preview(Path::new("x.bin"), &[0xff, 0xfe, 0x00], 10), None);
        assert_eq!(extract_preview(Path::new("x.txt"), b"   ", 10), None);
        assert_eq!(extract_preview(Path::new("x.pdf"), b"not a pdf", 10), None);
    }

    #[tokio::test]
    async fn worker_fills_preview_for_added_sources() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("sources");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"first source").unwrap();

        let store = Arc::new(test_store(&tmp).await);
        let notifier = ChangeNotifier::default();
        let handle = PreviewWorker::new(store.clone(), &config(100)).spawn(notifier.subscribe());

        SourceSync::new(store.clone(), notifier.clone(), WalkOptions::default())
            .reconcile_root(&root)
            .await
            .unwrap();
        let id = store.sources().await.unwrap()[0].id;

        let mut preview = None;
        for _ in 0..50 {
            preview = store.get_preview(id).await.unwrap();
            if preview.is_some() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(preview.as_deref(), Some(b"first source".as_slice()));

        drop(notifier);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn changed_file_is_not_previewed_under_old_hash() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("sources");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"original").unwrap();

        let store = Arc::new(test_store(&tmp).await);
        SourceSync::new(store.clone(), ChangeNotifier::default(), WalkOptions::default())
            .reconcile_root(&root)
            .await
            .unwrap();
        let source = store.sources().await.unwrap().remove(0);

        std::fs::write(root.join("a.txt"), b"edited meanwhile").unwrap();
        let worker = PreviewWorker::new(store.clone(), &config(100));
        assert!(!worker.refresh(&source).await.unwrap());
        assert_eq!(store.get_preview(source.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fill_missing_covers_every_source() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("sources");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("b.txt"), b"bravo").unwrap();

        let store = Arc::new(test_store(&tmp).await);
        SourceSync::new(store.clone(), ChangeNotifier::default(), WalkOptions::default())
            .reconcile_root(&root)
            .await
            .unwrap();

        let worker = PreviewWorker::new(store.clone(), &config(3));
        assert_eq!(worker.fill_missing().await.unwrap(), 2);
        assert_eq!(worker.fill_missing().await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().previews, 2);
    }
}

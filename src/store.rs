//! SQLite-backed content store.
//!
//! [`ContentStore`] is the single handle every component is constructed
//! with. Reads go straight to the pool; every mutation goes through one
//! async mutex so that at most one reconciliation, notes rebuild or config
//! write is in flight at a time, regardless of how SQLite would arbitrate.
//!
//! Multi-statement reconciliations use [`WriteTxn`], which owns both the
//! mutex guard and the SQL transaction. Dropping it without calling
//! [`WriteTxn::commit`] rolls everything back.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`WriteTxn::upsert_source`] | Insert a new identity or update one in place |
//! | [`WriteTxn::delete_sources_not_in`] | Remove rows of a root that a scan did not claim |
//! | [`ContentStore::lookup_source_by_hash`] | Content identity lookup (global) |
//! | [`ContentStore::lookup_source_by_path`] | Location lookup within a root |
//! | [`ContentStore::replace_notes_for_root`] | Rebuild notes + cross-references of a root |
//! | [`ContentStore::xref_flag`] | Derived "is referenced" flag for a hash |
//! | [`ContentStore::export_rows`] | Snapshot of all sources for the index |
//! | [`ContentStore::get_config`] / [`ContentStore::set_config`] | Persisted settings |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::Config;
use crate::db;
use crate::events::ChangeEvent;
use crate::migrate;
use crate::models::{AnalyzedNote, ExportRow, Note, Source, SourceRecord, NOTES_SCANNED_AT_KEY};

const SOURCE_SELECT: &str = "SELECT s.id, s.hash, s.root, s.path, \
     (s.preview IS NOT NULL) AS has_preview, \
     EXISTS(SELECT 1 FROM xref x WHERE x.source_hash = s.hash) AS xref \
     FROM source s";

/// A persisted configuration write, broadcast to the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub key: String,
    pub value: String,
}

/// Result of [`ContentStore::replace_notes_for_root`].
#[derive(Debug, Default)]
pub struct NotesReplaced {
    pub notes: usize,
    pub xrefs: usize,
    /// One `XrefChanged` per source whose derived flag flipped.
    pub events: Vec<ChangeEvent>,
}

/// Row counts for `juridoc status`.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub sources: i64,
    pub referenced_sources: i64,
    pub previews: i64,
    pub notes: i64,
    pub xrefs: i64,
}

pub struct ContentStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    config_tx: broadcast::Sender<ConfigChange>,
}

impl ContentStore {
    /// Connect to the configured database, creating the schema if needed.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        let (config_tx, _) = broadcast::channel(64);
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            config_tx,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start the single write transaction. Waits for any other writer.
    pub async fn begin_write(&self) -> Result<WriteTxn> {
        let guard = self.write_lock.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTxn { tx, _guard: guard })
    }

    pub async fn lookup_source_by_hash(&self, hash: &str) -> Result<Option<Source>> {
        let mut conn = self.pool.acquire().await?;
        fetch_source_by_hash(&mut conn, hash).await
    }

    pub async fn lookup_source_by_path(&self, root: &str, path: &str) -> Result<Option<Source>> {
        let mut conn = self.pool.acquire().await?;
        fetch_source_by_path(&mut conn, root, path).await
    }

    pub async fn sources_under_root(&self, root: &str) -> Result<Vec<Source>> {
        let mut conn = self.pool.acquire().await?;
        fetch_sources_under_root(&mut conn, root).await
    }

    pub async fn sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!("{} ORDER BY s.id", SOURCE_SELECT))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(source_from_row).collect())
    }

    /// Every known content hash, for resolving note hyperlinks.
    pub async fn source_hashes(&self) -> Result<HashSet<String>> {
        let hashes: Vec<String> = sqlx::query_scalar("SELECT hash FROM source")
            .fetch_all(&self.pool)
            .await?;
        Ok(hashes.into_iter().collect())
    }

    /// True iff at least one cross-reference points at `hash`.
    pub async fn xref_flag(&self, hash: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        fetch_xref_flag(&mut conn, hash).await
    }

    pub async fn notes_for_root(&self, root: &str) -> Result<Vec<Note>> {
        let rows = sqlx::query(
            "SELECT n.id, n.root, n.path, \
             (SELECT COUNT(*) FROM xref x WHERE x.note_id = n.id) AS xref_count \
             FROM note n WHERE n.root = ? ORDER BY n.path",
        )
        .bind(root)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Note {
                id: row.get("id"),
                root: row.get("root"),
                path: row.get("path"),
                xref_count: row.get("xref_count"),
            })
            .collect())
    }

    /// Hashes cross-referenced by one note.
    pub async fn note_targets(&self, note_id: i64) -> Result<Vec<String>> {
        let hashes: Vec<String> =
            sqlx::query_scalar("SELECT source_hash FROM xref WHERE note_id = ? ORDER BY source_hash")
                .bind(note_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(hashes)
    }

    /// All sources in id order with their derived flag, from one statement
    /// (and therefore one consistent snapshot).
    pub async fn export_rows(&self) -> Result<Vec<ExportRow>> {
        let rows = sqlx::query(
            "SELECT s.id, s.hash, s.root, s.path, \
             EXISTS(SELECT 1 FROM xref x WHERE x.source_hash = s.hash) AS xref \
             FROM source s ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ExportRow {
                id: row.get("id"),
                hash: row.get("hash"),
                root: row.get("root"),
                path: row.get("path"),
                xref: row.get::<i64, _>("xref") != 0,
            })
            .collect())
    }

    /// Delete and rebuild every note and cross-reference under `root` in
    /// one transaction.
    ///
    /// Targets that do not name a known source are dropped here, inside the
    /// transaction, so a dangling reference can never be recorded even if
    /// the caller resolved against an older snapshot.
    pub async fn replace_notes_for_root(
        &self,
        root: &str,
        notes: &[AnalyzedNote],
    ) -> Result<NotesReplaced> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let before = fetch_xref_flags(&mut tx).await?;

        sqlx::query("DELETE FROM xref WHERE note_id IN (SELECT id FROM note WHERE root = ?)")
            .bind(root)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM note WHERE root = ?")
            .bind(root)
            .execute(&mut *tx)
            .await?;

        let mut xrefs = 0usize;
        for note in notes {
            let note_id = sqlx::query("INSERT INTO note (root, path) VALUES (?, ?)")
                .bind(root)
                .bind(&note.path)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

            for target in &note.targets {
                let inserted = sqlx::query(
                    "INSERT OR IGNORE INTO xref (source_hash, note_id) \
                     SELECT ?, ? WHERE EXISTS(SELECT 1 FROM source WHERE hash = ?)",
                )
                .bind(target)
                .bind(note_id)
                .bind(target)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                xrefs += inserted as usize;
            }
        }

        let mut events = Vec::new();
        let after = fetch_xref_flags(&mut tx).await?;
        for (id, flag) in &after {
            if before.get(id).copied().unwrap_or(false) != *flag {
                if let Some(source) = fetch_source_by_id(&mut tx, *id).await? {
                    events.push(ChangeEvent::XrefChanged { source });
                }
            }
        }
        events.sort_by_key(|e| e.source().id);

        put_config(&mut tx, NOTES_SCANNED_AT_KEY, &chrono::Utc::now().to_rfc3339()).await?;
        tx.commit().await?;

        debug!(root, notes = notes.len(), xrefs, "replaced notes");
        Ok(NotesReplaced {
            notes: notes.len(),
            xrefs,
            events,
        })
    }

    /// Store a preview for source `id`, but only if the row still has
    /// `hash`. Returns whether the row was updated.
    pub async fn set_preview(&self, id: i64, hash: &str, preview: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE source SET preview = ? WHERE id = ? AND hash = ?")
            .bind(preview)
            .bind(id)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_preview(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let preview: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT preview FROM source WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(preview.flatten())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Persist `key = value` and notify config subscribers after commit.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        {
            let _guard = self.write_lock.lock().await;
            let mut conn = self.pool.acquire().await?;
            put_config(&mut conn, key, value).await?;
        }

        let _ = self.config_tx.send(ConfigChange {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub async fn config_entries(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    pub fn subscribe_config(&self) -> broadcast::Receiver<ConfigChange> {
        self.config_tx.subscribe()
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            "SELECT \
               (SELECT COUNT(*) FROM source) AS sources, \
               (SELECT COUNT(DISTINCT source_hash) FROM xref) AS referenced, \
               (SELECT COUNT(*) FROM source WHERE preview IS NOT NULL) AS previews, \
               (SELECT COUNT(*) FROM note) AS notes, \
               (SELECT COUNT(*) FROM xref) AS xrefs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            sources: row.get("sources"),
            referenced_sources: row.get("referenced"),
            previews: row.get("previews"),
            notes: row.get("notes"),
            xrefs: row.get("xrefs"),
        })
    }
}

/// The store's exclusive write transaction.
pub struct WriteTxn {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteTxn {
    pub async fn lookup_source_by_hash(&mut self, hash: &str) -> Result<Option<Source>> {
        fetch_source_by_hash(&mut self.tx, hash).await
    }

    pub async fn lookup_source_by_path(&mut self, root: &str, path: &str) -> Result<Option<Source>> {
        fetch_source_by_path(&mut self.tx, root, path).await
    }

    pub async fn sources_under_root(&mut self, root: &str) -> Result<Vec<Source>> {
        fetch_sources_under_root(&mut self.tx, root).await
    }

    pub async fn xref_flag(&mut self, hash: &str) -> Result<bool> {
        fetch_xref_flag(&mut self.tx, hash).await
    }

    /// Insert (`id: None`) or update a source and return the stored row.
    ///
    /// On update, a hash change clears the cached preview and drops the
    /// cross-references of the old hash; a pure move keeps both.
    pub async fn upsert_source(&mut self, record: &SourceRecord) -> Result<Source> {
        let id = match record.id {
            Some(id) => {
                let previous = fetch_source_by_id(&mut self.tx, id)
                    .await?
                    .ok_or_else(|| anyhow!("source {} vanished during reconcile", id))?;

                if previous.hash != record.hash {
                    sqlx::query("DELETE FROM xref WHERE source_hash = ?")
                        .bind(&previous.hash)
                        .execute(&mut *self.tx)
                        .await?;
                }

                // The CASE sees the pre-update hash.
                sqlx::query(
                    "UPDATE source SET \
                       preview = CASE WHEN hash = ? THEN preview ELSE NULL END, \
                       hash = ?, root = ?, path = ? \
                     WHERE id = ?",
                )
                .bind(&record.hash)
                .bind(&record.hash)
                .bind(&record.root)
                .bind(&record.path)
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
                id
            }
            None => sqlx::query("INSERT INTO source (hash, root, path) VALUES (?, ?, ?)")
                .bind(&record.hash)
                .bind(&record.root)
                .bind(&record.path)
                .execute(&mut *self.tx)
                .await?
                .last_insert_rowid(),
        };

        fetch_source_by_id(&mut self.tx, id)
            .await?
            .ok_or_else(|| anyhow!("source {} missing after upsert", id))
    }

    /// Move a row out of the way so another row can take its path within
    /// the same transaction (swaps, rotations).
    pub async fn park_source(&mut self, id: i64) -> Result<()> {
        sqlx::query("UPDATE source SET path = ? WHERE id = ?")
            .bind(format!("/.parked/{}", id))
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Delete every row recorded under `root` whose id is not in `keep_ids`,
    /// returning the deleted rows as they were.
    pub async fn delete_sources_not_in(
        &mut self,
        root: &str,
        keep_ids: &HashSet<i64>,
    ) -> Result<Vec<Source>> {
        let mut removed = Vec::new();
        for source in fetch_sources_under_root(&mut self.tx, root).await? {
            if keep_ids.contains(&source.id) {
                continue;
            }
            delete_source_row(&mut self.tx, source.id).await?;
            removed.push(source);
        }
        Ok(removed)
    }

    /// Delete every row recorded under any root other than `root`.
    pub async fn delete_sources_outside_root(&mut self, root: &str) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!("{} WHERE s.root <> ? ORDER BY s.id", SOURCE_SELECT))
            .bind(root)
            .fetch_all(&mut *self.tx)
            .await?;

        let mut removed = Vec::with_capacity(rows.len());
        for source in rows.iter().map(source_from_row) {
            delete_source_row(&mut self.tx, source.id).await?;
            removed.push(source);
        }
        Ok(removed)
    }

    pub async fn delete_source(&mut self, id: i64) -> Result<Option<Source>> {
        let source = fetch_source_by_id(&mut self.tx, id).await?;
        if source.is_some() {
            delete_source_row(&mut self.tx, id).await?;
        }
        Ok(source)
    }

    /// Config write that is part of this transaction. Not broadcast.
    pub async fn put_config(&mut self, key: &str, value: &str) -> Result<()> {
        put_config(&mut self.tx, key, value).await
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn source_from_row(row: &SqliteRow) -> Source {
    Source {
        id: row.get("id"),
        hash: row.get("hash"),
        root: row.get("root"),
        path: row.get("path"),
        xref: row.get::<i64, _>("xref") != 0,
        has_preview: row.get::<i64, _>("has_preview") != 0,
    }
}

async fn fetch_source_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<Source>> {
    let row = sqlx::query(&format!("{} WHERE s.id = ?", SOURCE_SELECT))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

async fn fetch_source_by_hash(conn: &mut SqliteConnection, hash: &str) -> Result<Option<Source>> {
    let row = sqlx::query(&format!("{} WHERE s.hash = ?", SOURCE_SELECT))
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

async fn fetch_source_by_path(
    conn: &mut SqliteConnection,
    root: &str,
    path: &str,
) -> Result<Option<Source>> {
    let row = sqlx::query(&format!("{} WHERE s.root = ? AND s.path = ?", SOURCE_SELECT))
        .bind(root)
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

async fn fetch_sources_under_root(conn: &mut SqliteConnection, root: &str) -> Result<Vec<Source>> {
    let rows = sqlx::query(&format!("{} WHERE s.root = ? ORDER BY s.id", SOURCE_SELECT))
        .bind(root)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.iter().map(source_from_row).collect())
}

async fn fetch_xref_flag(conn: &mut SqliteConnection, hash: &str) -> Result<bool> {
    let flag: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM xref WHERE source_hash = ?)")
        .bind(hash)
        .fetch_one(&mut *conn)
        .await?;
    Ok(flag != 0)
}

async fn fetch_xref_flags(conn: &mut SqliteConnection) -> Result<HashMap<i64, bool>> {
    let rows = sqlx::query(
        "SELECT s.id, EXISTS(SELECT 1 FROM xref x WHERE x.source_hash = s.hash) AS xref \
         FROM source s",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<i64, _>("id"), row.get::<i64, _>("xref") != 0))
        .collect())
}

async fn delete_source_row(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM xref WHERE source_hash = (SELECT hash FROM source WHERE id = ?)")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM source WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn put_config(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO config (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

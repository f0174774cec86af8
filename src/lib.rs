//! # juridoc
//!
//! A local-first tracker for a corpus of source documents and the notes that
//! cite them.
//!
//! Sources are identified by the SHA-256 of their bytes, so renames and moves
//! keep their sequence number. Notes are ODF text documents whose hyperlinks
//! point at a source with a `src:<hash>` target. juridoc records which
//! sources are cited, exports a numbered `index.csv` that preserves manual
//! edits, and renders notes with each resolved link replaced by the cited
//! source's number.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  SourceSync  │──▶│ ContentStore │◀──│ NoteAnalyzer │
//! │ hash, rename │   │    SQLite    │   │  src: links  │
//! └──────┬───────┘   └──────┬───────┘   └──────────────┘
//!        │                  │
//!        ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ChangeNotifier│   │IndexExporter │──▶ index.csv, numbered trees
//! └──────────────┘   └──────────────┘
//! ```
//!
//! All mutations triggered by the watcher or by a root change run through
//! one [`worker::SyncWorker`].
//!
//! ## Quick Start
//!
//! ```bash
//! juridoc init
//! juridoc roots --sources ./exhibits --notes ./notes
//! juridoc sync all
//! juridoc export all
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`models`] | Core data types and config keys |
//! | [`error`] | Typed sync and document errors |
//! | [`store`] | Content store and its write transaction |
//! | [`walk`] | Tree listing and content hashing |
//! | [`source_sync`] | Hash-first reconciliation of the sources root |
//! | [`odt`] | ODF package link extraction and rewriting |
//! | [`notes`] | Note analysis and cross-reference rebuild |
//! | [`events`] | Change events and their broadcaster |
//! | [`index`] | `index.csv` merge and export |
//! | [`render`] | Numbered rendering of notes |
//! | [`export`] | Export command orchestration |
//! | [`preview`] | Cached text previews |
//! | [`worker`] | Serialized mutation queue |
//! | [`watch`] | Filesystem watching |
//! | [`progress`] | Scan progress reporting |
//! | [`stats`] | Status overview |

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod export;
pub mod index;
pub mod migrate;
pub mod models;
pub mod notes;
pub mod odt;
pub mod preview;
pub mod progress;
pub mod render;
pub mod source_sync;
pub mod stats;
pub mod store;
pub mod walk;
pub mod watch;
pub mod worker;

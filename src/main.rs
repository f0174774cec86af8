//! # juridoc CLI
//!
//! The `juridoc` binary keeps a content-addressed record of a sources
//! corpus and of the notes that cite it, and exports a numbered index.
//!
//! ## Usage
//!
//! ```bash
//! juridoc --config ./config/juridoc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `juridoc init` | Create the SQLite store |
//! | `juridoc roots --sources DIR --notes DIR` | Select the corpora |
//! | `juridoc sync sources\|notes\|all` | Reconcile the store with disk |
//! | `juridoc export index\|sources\|notes\|all` | Write the index and numbered trees |
//! | `juridoc status` | Roots, last scans and counts |
//! | `juridoc watch` | Follow both roots until Ctrl-C |
//! | `juridoc config get\|set\|list` | Persisted settings |
//!
//! ## Examples
//!
//! ```bash
//! juridoc init
//! juridoc roots --sources ~/case/exhibits --notes ~/case/notes
//! juridoc sync all
//! juridoc export all
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use juridoc::config::{self, Config};
use juridoc::events::ChangeNotifier;
use juridoc::export::{run_export, ExportTarget};
use juridoc::migrate;
use juridoc::models::{root_key, NOTES_ROOT_KEY, SOURCES_ROOT_KEY};
use juridoc::notes::{NoteAnalyzer, NotesReport};
use juridoc::preview::PreviewWorker;
use juridoc::progress::ProgressMode;
use juridoc::source_sync::{ScanReport, SourceSync};
use juridoc::stats;
use juridoc::store::ContentStore;
use juridoc::walk::WalkOptions;
use juridoc::watch::{run_watch, WatchRoots};
use juridoc::worker::{SyncHandle, SyncWorker};

/// juridoc: numbered index of a sources corpus and the notes that cite it.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. The active roots live in the store, not in the file.
#[derive(Parser)]
#[command(
    name = "juridoc",
    about = "Content-addressed index of a sources corpus and the notes that cite it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/juridoc.toml")]
    config: PathBuf,

    /// Scan progress on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and its schema. Safe to run repeatedly.
    Init,

    /// Select the sources and/or notes root.
    ///
    /// Paths are canonicalised before being stored. Run `juridoc sync all`
    /// afterwards to bring the store in line.
    Roots {
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        notes: Option<PathBuf>,
    },

    /// Reconcile the store with the files on disk.
    Sync {
        #[command(subcommand)]
        corpus: SyncCorpus,
    },

    /// Export the index and the numbered trees under `[output].dir`.
    Export {
        #[command(subcommand)]
        target: ExportCommand,
    },

    /// Show roots, last scan times and counts.
    Status,

    /// Watch both roots and keep the store current until Ctrl-C.
    Watch,

    /// Read or write persisted settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SyncCorpus {
    /// Reconcile the sources root (and re-link notes if identities changed).
    Sources,
    /// Rebuild notes and cross-references.
    Notes,
    /// Sources, then notes.
    All,
}

#[derive(Subcommand)]
enum ExportCommand {
    /// Write the merged `index.csv`.
    Index,
    /// Copy sources to their numbered `dest`.
    Sources {
        /// Only sources cited by at least one note.
        #[arg(long)]
        xref_only: bool,
    },
    /// Render notes, replacing resolved link text with `idx`.
    Notes,
    /// Index, cited sources and rendered notes.
    All,
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("juridoc=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Store initialized at {}.", cfg.db.path.display());
        return Ok(());
    }

    let store = Arc::new(ContentStore::open(&cfg).await?);
    let result = run_command(cli.command, &cfg, store.clone(), progress).await;
    store.close().await;
    result
}

async fn run_command(
    command: Commands,
    cfg: &Config,
    store: Arc<ContentStore>,
    progress: ProgressMode,
) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Roots { sources, notes } => {
            if sources.is_none() && notes.is_none() {
                anyhow::bail!("nothing to set: pass --sources and/or --notes");
            }
            if let Some(dir) = sources {
                let root = canonical_root(&dir)?;
                store.set_config(SOURCES_ROOT_KEY, &root).await?;
                println!("sources root: {}", root);
            }
            if let Some(dir) = notes {
                let root = canonical_root(&dir)?;
                store.set_config(NOTES_ROOT_KEY, &root).await?;
                println!("notes root: {}", root);
            }
        }
        Commands::Sync { corpus } => {
            let notifier = ChangeNotifier::default();
            let (handle, task) = start_worker(cfg, store.clone(), &notifier, progress).await?;

            if matches!(corpus, SyncCorpus::Sources | SyncCorpus::All) {
                let report = handle.scan_sources().await?;
                print_scan(&report);
            }
            if matches!(corpus, SyncCorpus::Notes | SyncCorpus::All) {
                let report = handle.scan_notes().await?;
                print_notes(&report);
            }

            drop(handle);
            task.await?;

            if cfg.preview.enabled {
                let written = PreviewWorker::new(store.clone(), &cfg.preview)
                    .fill_missing()
                    .await?;
                if written > 0 {
                    println!("previews: {}", written);
                }
            }
        }
        Commands::Export { target } => {
            let (label, target) = match target {
                ExportCommand::Index => ("index", ExportTarget::Index),
                ExportCommand::Sources { xref_only } => {
                    ("sources", ExportTarget::Sources { xref_only })
                }
                ExportCommand::Notes => ("notes", ExportTarget::Notes),
                ExportCommand::All => ("all", ExportTarget::All),
            };
            let summary = run_export(store.clone(), cfg, target).await?;

            println!("export {}", label);
            if let Some((path, rows)) = &summary.index {
                println!("  index: {} ({} rows)", path.display(), rows);
            }
            if let Some(sources) = &summary.sources {
                println!("  sources copied: {}", sources.copied);
                println!("  sources filtered: {}", sources.filtered);
                if !sources.missing.is_empty() {
                    println!("  sources missing: {}", sources.missing.len());
                }
            }
            if let Some(notes) = &summary.notes {
                println!("  notes rendered: {}", notes.rendered);
                println!("  notes copied: {}", notes.copied);
                if !notes.failed.is_empty() {
                    println!("  notes failed to render: {}", notes.failed.len());
                }
            }
            println!("ok");
        }
        Commands::Status => {
            stats::run_status(cfg, &store).await?;
        }
        Commands::Watch => {
            let notifier = ChangeNotifier::default();
            let preview = cfg.preview.enabled.then(|| {
                PreviewWorker::new(store.clone(), &cfg.preview).spawn(notifier.subscribe())
            });

            let roots = WatchRoots::load(&store).await?;
            if roots.sources.is_none() && roots.notes.is_none() {
                anyhow::bail!("no roots configured (run `juridoc roots`)");
            }

            let (handle, task) = start_worker(cfg, store.clone(), &notifier, progress).await?;
            if roots.sources.is_some() {
                print_scan(&handle.scan_sources().await?);
            }
            if roots.notes.is_some() {
                print_notes(&handle.scan_notes().await?);
            }
            if cfg.preview.enabled {
                PreviewWorker::new(store.clone(), &cfg.preview)
                    .fill_missing()
                    .await?;
            }

            run_watch(handle, store.clone(), roots, &cfg.watch).await?;
            task.await?;
            drop(notifier);
            if let Some(preview) = preview {
                preview.await?;
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => match store.get_config(&key).await? {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("config key '{}' is not set", key),
            },
            ConfigAction::Set { key, value } => {
                // Root keys are compared as strings; store them the way `roots` does.
                let value = if key == SOURCES_ROOT_KEY || key == NOTES_ROOT_KEY {
                    canonical_root(Path::new(&value))?
                } else {
                    value
                };
                store.set_config(&key, &value).await?;
                println!("{} = {}", key, value);
            }
            ConfigAction::List => {
                for (key, value) in store.config_entries().await? {
                    println!("{} = {}", key, value);
                }
            }
        },
    }
    Ok(())
}

async fn start_worker(
    cfg: &Config,
    store: Arc<ContentStore>,
    notifier: &ChangeNotifier,
    progress: ProgressMode,
) -> Result<(SyncHandle, tokio::task::JoinHandle<()>)> {
    let walk = WalkOptions::from_config(&cfg.scan)?;
    let sources = SourceSync::new(store.clone(), notifier.clone(), walk.clone())
        .with_progress(progress.reporter());
    let notes =
        NoteAnalyzer::new(store.clone(), notifier.clone(), walk).with_progress(progress.reporter());
    let worker = SyncWorker::new(store, sources, notes).await?;
    Ok(worker.spawn(cfg.watch.queue_capacity))
}

fn canonical_root(dir: &Path) -> Result<String> {
    let root = dir
        .canonicalize()
        .with_context(|| format!("Cannot resolve {}", dir.display()))?;
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }
    Ok(root_key(&root))
}

fn print_scan(report: &ScanReport) {
    println!("sync sources");
    println!("  scanned: {}", report.scanned);
    println!("  added: {}", report.added());
    println!("  content changed: {}", report.hash_changed());
    println!("  renamed: {}", report.path_changed());
    println!("  removed: {}", report.removed());
    println!("  xref changed: {}", report.xref_changed());
    if !report.skipped.is_empty() {
        println!("  unreadable: {}", report.skipped.len());
    }
    println!("ok");
}

fn print_notes(report: &NotesReport) {
    println!("sync notes");
    println!("  notes: {}", report.notes);
    println!("  documents: {}", report.documents);
    println!("  cross-references: {}", report.xrefs);
    println!("  unresolved links: {}", report.dangling);
    if !report.malformed.is_empty() {
        println!("  malformed: {}", report.malformed.len());
    }
    if !report.skipped.is_empty() {
        println!("  unreadable: {}", report.skipped.len());
    }
    println!("ok");
}

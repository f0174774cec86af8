//! Store statistics and health overview.
//!
//! Used by `juridoc status` to show which roots are active, when they were
//! last scanned and how much of the sources corpus the notes cite.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::config::Config;
use crate::models::{NOTES_ROOT_KEY, NOTES_SCANNED_AT_KEY, SOURCES_ROOT_KEY, SOURCES_SCANNED_AT_KEY};
use crate::store::ContentStore;

/// Per-root breakdown of sources.
struct RootStats {
    sources: usize,
    referenced: usize,
    previews: usize,
}

/// Run the status command: query the store and print a summary.
pub async fn run_status(config: &Config, store: &ContentStore) -> Result<()> {
    let stats = store.stats().await?;
    let sources_root = store.get_config(SOURCES_ROOT_KEY).await?;
    let notes_root = store.get_config(NOTES_ROOT_KEY).await?;
    let sources_scanned = store.get_config(SOURCES_SCANNED_AT_KEY).await?;
    let notes_scanned = store.get_config(NOTES_SCANNED_AT_KEY).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("juridoc status");
    println!("==============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!(
        "  Sources:     {}  (scanned {})",
        sources_root.as_deref().unwrap_or("not configured"),
        format_scanned(sources_scanned.as_deref())
    );
    println!(
        "  Notes:       {}  (scanned {})",
        notes_root.as_deref().unwrap_or("not configured"),
        format_scanned(notes_scanned.as_deref())
    );
    println!();
    println!("  Sources:     {}", stats.sources);
    println!(
        "  Referenced:  {} / {} ({}%)",
        stats.referenced_sources,
        stats.sources,
        if stats.sources > 0 {
            (stats.referenced_sources * 100) / stats.sources
        } else {
            0
        }
    );
    println!("  Previews:    {}", stats.previews);
    println!("  Notes:       {}", stats.notes);
    println!("  Xrefs:       {}", stats.xrefs);

    // Rows left under a previous root show up here until the next rescan.
    let mut by_root: BTreeMap<String, RootStats> = BTreeMap::new();
    for source in store.sources().await? {
        let entry = by_root.entry(source.root.clone()).or_insert(RootStats {
            sources: 0,
            referenced: 0,
            previews: 0,
        });
        entry.sources += 1;
        entry.referenced += usize::from(source.xref);
        entry.previews += usize::from(source.has_preview);
    }

    if by_root.len() > 1 {
        println!();
        println!("  By root:");
        println!("  {:<40} {:>8} {:>10} {:>8}", "ROOT", "SOURCES", "REFERENCED", "PREVIEWS");
        println!("  {}", "-".repeat(70));
        for (root, s) in &by_root {
            println!(
                "  {:<40} {:>8} {:>10} {:>8}",
                root, s.sources, s.referenced, s.previews
            );
        }
    }

    println!();
    Ok(())
}

/// Size of the database file, e.g. `512 B` or `3.4 MB`.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

/// Age of a stored scan timestamp. Scans older than a month, or stamped in
/// the future by a skewed clock, show the date instead.
fn format_scanned(value: Option<&str>) -> String {
    let Some(raw) = value else {
        return "never".to_string();
    };
    let Ok(scanned) = chrono::DateTime::parse_from_rfc3339(raw) else {
        return raw.to_string();
    };
    let scanned = scanned.with_timezone(&chrono::Utc);
    let age = chrono::Utc::now() - scanned;

    let plural = |n: i64, unit: &str| format!("{n} {unit}{} ago", if n == 1 { "" } else { "s" });
    if age < chrono::TimeDelta::zero() || age.num_days() >= 30 {
        scanned.format("%Y-%m-%d %H:%M").to_string()
    } else if age.num_minutes() < 1 {
        "just now".to_string()
    } else if age.num_hours() < 1 {
        plural(age.num_minutes(), "min")
    } else if age.num_days() < 1 {
        plural(age.num_hours(), "hour")
    } else {
        plural(age.num_days(), "day")
    }
}

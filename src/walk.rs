//! Directory walking and content hashing.
//!
//! Both corpora are plain directory trees. Every regular file is a
//! candidate; `scan.exclude_globs` (matched against the `/`-separated
//! relative path) can hide editor lock files and the like.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::models::relative_path;

/// Walk settings shared by the sources and notes scanners.
#[derive(Clone)]
pub struct WalkOptions {
    pub follow_symlinks: bool,
    exclude: GlobSet,
}

impl WalkOptions {
    pub fn from_config(config: &ScanConfig) -> Result<Self> {
        Ok(Self {
            follow_symlinks: config.follow_symlinks,
            exclude: build_globset(&config.exclude_globs)?,
        })
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        self.exclude.is_match(relative)
    }
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            exclude: GlobSet::empty(),
        }
    }
}

/// A regular file found under a root.
#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub absolute: PathBuf,
    /// Relative to the root, `/`-separated.
    pub relative: String,
}

/// A source file together with its content hash.
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub relative: String,
    pub hash: String,
}

/// What a walk found: readable entries, plus the relative paths of entries
/// the walk could not get through (broken symlinks, unreadable
/// directories). Callers keep the rows of the latter instead of treating
/// them as deleted.
#[derive(Debug, Default)]
pub struct TreeListing {
    pub files: Vec<WalkedFile>,
    pub unreadable: Vec<String>,
}

/// List the regular files under `root`, sorted by relative path.
///
/// A missing root is the caller's business; here it simply yields nothing.
pub fn list_files(root: &Path, options: &WalkOptions) -> TreeListing {
    let mut listing = TreeListing::default();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    continue;
                }
                let relative = e.path().and_then(|p| relative_path(root, p));
                match relative {
                    Some(relative) if !relative.is_empty() && !options.is_excluded(&relative) => {
                        warn!(path = %relative, error = %e, "skipping unreadable entry");
                        listing.unreadable.push(relative);
                    }
                    _ => warn!(root = %root.display(), error = %e, "skipping unreadable entry"),
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        if options.is_excluded(&relative) {
            continue;
        }

        listing.files.push(WalkedFile {
            absolute: entry.path().to_path_buf(),
            relative,
        });
    }

    listing.files.sort_by(|a, b| a.relative.cmp(&b.relative));
    listing.unreadable.sort();
    listing
}

/// Whether `path` is `entry` itself or lies beneath it.
pub fn is_at_or_under(path: &str, entry: &str) -> bool {
    path == entry
        || path
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// SHA-256 of the file's bytes as lowercase hex.
pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, same format as [`file_hash`].
pub fn bytes_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

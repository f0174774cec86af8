//! TOML configuration for the `juridoc` binary.
//!
//! The file configures where the store lives and how scans, watches, exports
//! and previews behave. The active sources and notes roots are *not* read
//! from here: they are user selections persisted in the store's `config`
//! table (see [`crate::store::ContentStore::set_config`]).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            index_file: default_index_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./out")
}
fn default_index_file() -> String {
    "index.csv".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScanConfig {
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often `watch` re-reads the persisted roots.
    #[serde(default = "default_roots_poll_ms")]
    pub roots_poll_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            queue_capacity: default_queue_capacity(),
            roots_poll_ms: default_roots_poll_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    300
}
fn default_queue_capacity() -> usize {
    256
}
fn default_roots_poll_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    #[serde(default = "default_preview_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: default_preview_enabled(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_preview_enabled() -> bool {
    true
}
fn default_max_chars() -> usize {
    2000
}

impl Config {
    /// Configuration with every section at its default and the database
    /// stored at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            output: OutputConfig::default(),
            scan: ScanConfig::default(),
            watch: WatchConfig::default(),
            preview: PreviewConfig::default(),
        }
    }

    /// Full path of the exported (and previously exported) index file.
    pub fn index_path(&self) -> PathBuf {
        self.output.dir.join(&self.output.index_file)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.output.index_file.trim().is_empty() {
        anyhow::bail!("output.index_file must not be empty");
    }

    if config.watch.debounce_ms == 0 {
        anyhow::bail!("watch.debounce_ms must be > 0");
    }
    if config.watch.roots_poll_ms == 0 {
        anyhow::bail!("watch.roots_poll_ms must be > 0");
    }

    if config.watch.queue_capacity == 0 {
        anyhow::bail!("watch.queue_capacity must be > 0");
    }

    if config.preview.max_chars == 0 {
        anyhow::bail!("preview.max_chars must be > 0");
    }

    for pattern in &config.scan.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("scan.exclude_globs: invalid pattern '{}'", pattern))?;
    }

    Ok(())
}

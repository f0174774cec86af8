//! Scan progress on stderr.
//!
//! A full scan of a large sources tree spends most of its time hashing, so
//! it reports how far it got and how many entries it had to leave alone.
//! Nothing here touches stdout.

use std::fmt;
use std::io::Write;

/// Which tree a scan is walking.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Corpus {
    Sources,
    Notes,
}

impl Corpus {
    pub fn as_str(self) -> &'static str {
        match self {
            Corpus::Sources => "sources",
            Corpus::Notes => "notes",
        }
    }

    /// What a scan does to each file of this corpus.
    fn verb(self) -> &'static str {
        match self {
            Corpus::Sources => "hashed",
            Corpus::Notes => "analyzed",
        }
    }
}

impl fmt::Display for Corpus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScanProgressEvent {
    /// Walking the tree; nothing counted yet.
    Discovering { corpus: Corpus },
    /// `n` of `total` listed files done. `unreadable` counts the entries
    /// skipped so far, including those the walk itself could not open.
    Processing {
        corpus: Corpus,
        n: u64,
        total: u64,
        unreadable: u64,
    },
}

impl ScanProgressEvent {
    /// One line for a terminal, e.g. `scan sources  1,234 / 5,000 hashed  (2 unreadable)`.
    pub fn human_line(&self) -> String {
        match self {
            ScanProgressEvent::Discovering { corpus } => format!("scan {corpus}  walking tree..."),
            ScanProgressEvent::Processing {
                corpus,
                n,
                total,
                unreadable,
            } => {
                let mut line = format!(
                    "scan {corpus}  {} / {} {}",
                    group_digits(*n),
                    group_digits(*total),
                    corpus.verb()
                );
                if *unreadable > 0 {
                    line.push_str(&format!("  ({} unreadable)", group_digits(*unreadable)));
                }
                line
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScanProgressEvent::Discovering { corpus } => serde_json::json!({
                "event": "scan",
                "corpus": corpus.as_str(),
                "phase": "discovering",
            }),
            ScanProgressEvent::Processing {
                corpus,
                n,
                total,
                unreadable,
            } => serde_json::json!({
                "event": "scan",
                "corpus": corpus.as_str(),
                "phase": "processing",
                "n": n,
                "total": total,
                "unreadable": unreadable,
            }),
        }
    }
}

pub trait ScanProgressReporter: Send + Sync {
    fn report(&self, event: ScanProgressEvent);
}

pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, event: ScanProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.human_line());
        let _ = err.flush();
    }
}

/// One JSON object per line.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, event: ScanProgressEvent) {
        let _ = writeln!(std::io::stderr().lock(), "{}", event.to_json());
    }
}

pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _event: ScanProgressEvent) {}
}

/// Emit a `Processing` event every this many files, and on the last one.
pub const REPORT_EVERY: u64 = 100;

pub fn should_report(n: u64, total: u64) -> bool {
    n == total || n % REPORT_EVERY == 0
}

/// `1234567` as `1,234,567`.
fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.char_indices() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

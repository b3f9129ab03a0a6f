//! Sync counters and progress reporting.
//!
//! [`SyncStats`] accumulates the aggregate counters (inserted, updated,
//! deleted, kept, skipped), globally and per entity type. They are reported
//! even when a run fails, so partial progress stays visible.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Aggregate counters for one sync run or one entity type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub kept: u64,
    pub skipped: u64,
}

impl SyncCounters {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted + self.kept + self.skipped
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Inserted,
    Updated,
    Deleted,
    Kept,
    Skipped,
}

/// Thread-safe counters shared by the pipeline, dispatcher and sweeper.
#[derive(Debug, Default)]
pub struct SyncStats {
    inserted: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    kept: AtomicU64,
    skipped: AtomicU64,
    by_type: Mutex<BTreeMap<String, SyncCounters>>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `n` entities of `entity_type` under `action`.
    pub fn record(&self, action: Action, entity_type: &str, n: u64) {
        if n == 0 {
            return;
        }
        self.counter(action).fetch_add(n, Ordering::Relaxed);

        let mut by_type = self.by_type.lock().unwrap_or_else(|e| e.into_inner());
        let counters = by_type.entry(entity_type.to_string()).or_default();
        match action {
            Action::Inserted => counters.inserted += n,
            Action::Updated => counters.updated += n,
            Action::Deleted => counters.deleted += n,
            Action::Kept => counters.kept += n,
            Action::Skipped => counters.skipped += n,
        }
    }

    pub fn snapshot(&self) -> SyncCounters {
        SyncCounters {
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    pub fn by_type(&self) -> BTreeMap<String, SyncCounters> {
        self.by_type
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn counter(&self, action: Action) -> &AtomicU64 {
        match action {
            Action::Inserted => &self.inserted,
            Action::Updated => &self.updated,
            Action::Deleted => &self.deleted,
            Action::Kept => &self.kept,
            Action::Skipped => &self.skipped,
        }
    }
}

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Source is scanning. Total unknown.
    Discovering { source: String },
    /// `n` of `total` entities have gone through the pipeline.
    Processing { source: String, n: u64, total: u64 },
    /// Orphan sweep removed `orphans` entities.
    Swept { source: String, orphans: u64 },
    /// Run ended; `error` is the terminal failure, if any.
    Finished {
        source: String,
        counters: SyncCounters,
        error: Option<String>,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync docs  processing  1,234 / 5,000 entities".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { source } => {
                format!("sync {}  discovering...\n", source)
            }
            SyncProgressEvent::Processing { source, n, total } => format!(
                "sync {}  processing  {} / {} entities\n",
                source,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Swept { source, orphans } => {
                format!("sync {}  removed {} orphans\n", source, format_number(*orphans))
            }
            SyncProgressEvent::Finished {
                source,
                counters,
                error,
            } => {
                let status = match error {
                    Some(e) => format!("failed: {}", e),
                    None => "done".to_string(),
                };
                format!(
                    "sync {}  {}  inserted {}  updated {}  deleted {}  kept {}  skipped {}\n",
                    source,
                    status,
                    format_number(counters.inserted),
                    format_number(counters.updated),
                    format_number(counters.deleted),
                    format_number(counters.kept),
                    format_number(counters.skipped)
                )
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &SyncProgressEvent) -> serde_json::Value {
        match event {
            SyncProgressEvent::Discovering { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "discovering"
            }),
            SyncProgressEvent::Processing { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "processing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Swept { source, orphans } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "sweeping",
                "orphans": orphans
            }),
            SyncProgressEvent::Finished {
                source,
                counters,
                error,
            } => serde_json::json!({
                "event": "finished",
                "source": source,
                "counters": counters,
                "error": error
            }),
        }
    }
}

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

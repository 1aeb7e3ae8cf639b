//! Scrape progress reporting.
//!
//! Reports each action entered, each record outcome, and the final
//! counters, so a long browser run shows where it is. Progress is emitted
//! on **stderr**; stdout stays reserved for export and dry-run output.

use std::io::Write;

use playscrape_core::models::{RecordStatus, ScrapeCounters, ScrapeStatus};

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ScrapeProgressEvent {
    /// The traversal entered an action.
    Action { name: String },
    /// One candidate finished processing.
    Record {
        action: String,
        id: String,
        status: RecordStatus,
        counters: ScrapeCounters,
    },
    /// The run ended.
    Finished {
        source: String,
        status: ScrapeStatus,
        counters: ScrapeCounters,
    },
}

/// Reports scrape progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ScrapeProgressEvent);
}

/// Human-friendly progress on stderr: "record artwork  3f2a…  created  (12 done, 1 failed)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ScrapeProgressEvent) {
        let line = match &event {
            ScrapeProgressEvent::Action { name } => format!("action {}\n", name),
            ScrapeProgressEvent::Record {
                action,
                id,
                status,
                counters,
            } => format!(
                "record {}  {}  {}  ({} done, {} failed)\n",
                action,
                id,
                status,
                format_number(counters.total() as u64),
                format_number(counters.failed as u64)
            ),
            ScrapeProgressEvent::Finished {
                source,
                status,
                counters,
            } => format!(
                "scrape {}  {}  created {}  unchanged {}  updated {}  failed {}\n",
                source,
                status,
                format_number(counters.created as u64),
                format_number(counters.no_changes as u64),
                format_number(counters.updated as u64),
                format_number(counters.failed as u64)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ScrapeProgressEvent) {
        let obj = match &event {
            ScrapeProgressEvent::Action { name } => serde_json::json!({
                "event": "action",
                "action": name,
            }),
            ScrapeProgressEvent::Record {
                action,
                id,
                status,
                counters,
            } => serde_json::json!({
                "event": "record",
                "action": action,
                "id": id,
                "status": status,
                "total": counters.total(),
                "failed": counters.failed,
            }),
            ScrapeProgressEvent::Finished {
                source,
                status,
                counters,
            } => serde_json::json!({
                "event": "finished",
                "source": source,
                "status": status,
                "created": counters.created,
                "noChanges": counters.no_changes,
                "updated": counters.updated,
                "failed": counters.failed,
                "total": counters.total(),
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ScrapeProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("--progress must be off, human, or json (got '{}')", other),
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

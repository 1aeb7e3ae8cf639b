//! Data models persisted by playscrape.
//!
//! These types mirror the four relational tables (`records`, `downloads`,
//! `scrapes`, `scrape_records`). Timestamps are Unix epoch seconds.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// One extracted record, keyed by its content-hash identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Logical site / action-set name.
    pub source: String,
    pub url: String,
    /// Name of the action that produced the record.
    pub action: String,
    /// Raw page or file HTML at capture time.
    pub content: String,
    /// Serialized session cookies at capture time.
    pub cookies: String,
    /// Opaque structured payload returned by the extractor.
    pub extracted: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub scraped_at: i64,
}

/// A downloaded image attached to a record.
///
/// Keyed by the hash of the source image URL; at most one row exists per
/// distinct URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub record_id: String,
    /// Width after orientation correction.
    pub width: u32,
    /// Height after orientation correction.
    pub height: u32,
    pub file_size: Option<u64>,
    pub file_name: String,
    pub orig_format: Option<String>,
    pub orig_url: String,
    pub orig_cookies: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Lifecycle of a top-level scrape run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScrapeStatus {
    Running,
    Completed,
    Failed,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Running => "running",
            ScrapeStatus::Completed => "completed",
            ScrapeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "running" => Ok(ScrapeStatus::Running),
            "completed" => Ok(ScrapeStatus::Completed),
            "failed" => Ok(ScrapeStatus::Failed),
            other => bail!("unknown scrape status: '{}'", other),
        }
    }
}

/// Outcome of processing one candidate within a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    Running,
    Created,
    NoChanges,
    Updated,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Running => "running",
            RecordStatus::Created => "created",
            RecordStatus::NoChanges => "noChanges",
            RecordStatus::Updated => "updated",
            RecordStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "running" => Ok(RecordStatus::Running),
            "created" => Ok(RecordStatus::Created),
            "noChanges" => Ok(RecordStatus::NoChanges),
            "updated" => Ok(RecordStatus::Updated),
            "failed" => Ok(RecordStatus::Failed),
            other => bail!("unknown record status: '{}'", other),
        }
    }
}

/// Outcome counters rolled up over one scrape.
///
/// `total` excludes failed records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeCounters {
    pub created: u32,
    pub no_changes: u32,
    pub updated: u32,
    pub failed: u32,
}

impl ScrapeCounters {
    pub fn total(&self) -> u32 {
        self.created + self.no_changes + self.updated
    }

    /// Count one finished record. `Running` is not an outcome and is ignored.
    pub fn record(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Created => self.created += 1,
            RecordStatus::NoChanges => self.no_changes += 1,
            RecordStatus::Updated => self.updated += 1,
            RecordStatus::Failed => self.failed += 1,
            RecordStatus::Running => {}
        }
    }
}

/// One top-level scrape run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scrape {
    pub id: i64,
    pub source: String,
    pub status: ScrapeStatus,
    pub counters: ScrapeCounters,
    pub status_text: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl Scrape {
    pub fn total_records(&self) -> u32 {
        self.counters.total()
    }
}

/// Audit row for one record processed within a scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRecord {
    pub id: i64,
    pub scrape_id: i64,
    pub record_id: Option<String>,
    pub status: RecordStatus,
    pub status_text: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

/// Everything written for one candidate, committed as a single unit.
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub record: Record,
    /// When false an existing row keeps its `updated_at`.
    pub content_changed: bool,
    /// Newly downloaded images for this record.
    pub downloads: Vec<Download>,
    /// Old identity this record replaces (re-extraction rename).
    pub replaces: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_exclude_failed_from_total() {
        let mut counters = ScrapeCounters::default();
        for status in [
            RecordStatus::Created,
            RecordStatus::Created,
            RecordStatus::NoChanges,
            RecordStatus::Updated,
            RecordStatus::Failed,
        ] {
            counters.record(status);
        }
        assert_eq!(counters.total(), 4);
        assert_eq!(counters.created, 2);
        assert_eq!(counters.no_changes, 1);
        assert_eq!(counters.updated, 1);
        assert_eq!(counters.failed, 1);
    }

    #[test]
    fn running_is_not_counted() {
        let mut counters = ScrapeCounters::default();
        counters.record(RecordStatus::Running);
        assert_eq!(counters, ScrapeCounters::default());
    }

    #[test]
    fn status_strings_match_schema() {
        assert_eq!(RecordStatus::NoChanges.as_str(), "noChanges");
        assert_eq!(
            "noChanges".parse::<RecordStatus>().unwrap(),
            RecordStatus::NoChanges
        );
        assert_eq!(
            "completed".parse::<ScrapeStatus>().unwrap(),
            ScrapeStatus::Completed
        );
        assert!("done".parse::<ScrapeStatus>().is_err());
    }
}

//! Storage abstraction for playscrape.
//!
//! The [`Store`] trait covers every read and write the scraping engine
//! performs, so the engine runs unchanged against SQLite or the
//! [`memory::InMemoryStore`] used in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Download, Record, RecordStatus, RecordWrite, Scrape, ScrapeCounters, ScrapeRecord,
    ScrapeStatus,
};

/// Abstract storage backend for scraped data and run bookkeeping.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_record`](Store::get_record) | Fetch a record by id |
/// | [`records_for_source`](Store::records_for_source) | All records of one source |
/// | [`all_records`](Store::all_records) | Every record (export) |
/// | [`get_download`](Store::get_download) | Fetch a download by image id |
/// | [`downloads_for_record`](Store::downloads_for_record) | Images attached to a record |
/// | [`commit_record`](Store::commit_record) | Atomic record + downloads write |
/// | [`start_scrape`](Store::start_scrape) / [`finish_scrape`](Store::finish_scrape) | Scrape run rows |
/// | [`start_record_scrape`](Store::start_record_scrape) / [`finish_record_scrape`](Store::finish_record_scrape) | Per-record audit rows |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_record(&self, id: &str) -> Result<Option<Record>>;

    /// Records of one source, ordered by id.
    async fn records_for_source(&self, source: &str) -> Result<Vec<Record>>;

    /// Every record, ordered by id.
    async fn all_records(&self) -> Result<Vec<Record>>;

    async fn get_download(&self, id: &str) -> Result<Option<Download>>;

    async fn downloads_for_record(&self, record_id: &str) -> Result<Vec<Download>>;

    /// Persist one candidate atomically.
    ///
    /// Upserts the record (an existing row keeps `created_at`, and keeps
    /// `updated_at` unless `content_changed`), moves the downloads of
    /// `replaces` onto the new id and deletes the replaced row, then upserts
    /// every download. Either all of it is visible afterwards or none of it.
    async fn commit_record(&self, write: &RecordWrite) -> Result<()>;

    /// Insert a `running` scrape and return its id.
    async fn start_scrape(&self, source: &str, started_at: i64) -> Result<i64>;

    /// Finalize a scrape. Returns false when no such scrape exists.
    async fn finish_scrape(
        &self,
        id: i64,
        status: ScrapeStatus,
        counters: &ScrapeCounters,
        status_text: Option<&str>,
        ended_at: i64,
    ) -> Result<bool>;

    /// Insert a `running` scrape-record and return its id.
    async fn start_record_scrape(
        &self,
        scrape_id: i64,
        record_id: Option<&str>,
        started_at: i64,
    ) -> Result<i64>;

    /// Finalize a scrape-record. Returns false when no such row exists.
    async fn finish_record_scrape(
        &self,
        id: i64,
        record_id: Option<&str>,
        status: RecordStatus,
        status_text: Option<&str>,
        ended_at: i64,
    ) -> Result<bool>;

    async fn get_scrape(&self, id: i64) -> Result<Option<Scrape>>;

    /// Most recent scrapes first.
    async fn recent_scrapes(&self, limit: i64) -> Result<Vec<Scrape>>;

    /// Scrape-records of one scrape, in insertion order.
    async fn record_scrapes(&self, scrape_id: i64) -> Result<Vec<ScrapeRecord>>;
}

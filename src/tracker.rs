//! Scrape run tracker.
//!
//! Brackets one run with a `scrapes` row and each candidate with a
//! `scrape_records` row, and keeps the outcome counters. Test mode skips
//! all of it; dry-run mode fakes ids and only logs.
//!
//! Calling the bracket operations out of order is a bug in the traversal,
//! so those violations are [`FatalError`]s and end the process.

use anyhow::Result;
use std::sync::Arc;

use playscrape_core::models::{RecordStatus, ScrapeCounters, ScrapeStatus};
use playscrape_core::store::Store;

use crate::config::RunMode;
use crate::error::FatalError;

/// Placeholder id used in dry-run mode.
const DRY_RUN_ID: i64 = 1;

struct OpenRecord {
    id: i64,
    record_id: Option<String>,
}

pub struct RunTracker {
    store: Arc<dyn Store>,
    mode: RunMode,
    source: String,
    scrape_id: Option<i64>,
    record: Option<OpenRecord>,
    counters: ScrapeCounters,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl RunTracker {
    pub fn new(store: Arc<dyn Store>, mode: RunMode, source: impl Into<String>) -> Self {
        Self {
            store,
            mode,
            source: source.into(),
            scrape_id: None,
            record: None,
            counters: ScrapeCounters::default(),
        }
    }

    pub fn counters(&self) -> ScrapeCounters {
        self.counters
    }

    pub fn scrape_id(&self) -> Option<i64> {
        self.scrape_id
    }

    pub fn is_record_open(&self) -> bool {
        self.record.is_some()
    }

    pub async fn start_scrape(&mut self) -> Result<()> {
        if self.mode == RunMode::Test {
            return Ok(());
        }
        if self.scrape_id.is_some() {
            return Err(FatalError::ScrapeAlreadyRunning.into());
        }
        self.counters = ScrapeCounters::default();

        let id = if self.mode == RunMode::DryRun {
            tracing::info!(source = %self.source, "DRY RUN: Scrape started");
            DRY_RUN_ID
        } else {
            self.store.start_scrape(&self.source, now()).await?
        };
        tracing::debug!(scrape_id = id, source = %self.source, "Scrape started");
        self.scrape_id = Some(id);
        Ok(())
    }

    /// Finalize the run with the accumulated counters.
    pub async fn end_scrape(
        &mut self,
        status: ScrapeStatus,
        status_text: Option<&str>,
    ) -> Result<ScrapeCounters> {
        if self.mode == RunMode::Test {
            return Ok(self.counters);
        }
        let Some(id) = self.scrape_id.take() else {
            return Err(FatalError::NoScrapeRunning.into());
        };
        self.record = None;

        let c = self.counters;
        if self.mode == RunMode::DryRun {
            tracing::info!(
                status = %status,
                created = c.created,
                no_changes = c.no_changes,
                updated = c.updated,
                failed = c.failed,
                total = c.total(),
                "DRY RUN: Scrape ended"
            );
        } else {
            let updated = self
                .store
                .finish_scrape(id, status, &c, status_text, now())
                .await?;
            if !updated {
                return Err(FatalError::NoScrapeRunning.into());
            }
            tracing::info!(
                scrape_id = id,
                status = %status,
                created = c.created,
                no_changes = c.no_changes,
                updated = c.updated,
                failed = c.failed,
                "Scrape ended"
            );
        }
        Ok(c)
    }

    /// Open the audit row for one candidate.
    pub async fn start_record_scrape(&mut self, record_id: Option<&str>) -> Result<()> {
        if self.mode == RunMode::Test {
            return Ok(());
        }
        let Some(scrape_id) = self.scrape_id else {
            return Err(FatalError::ScrapeNotStarted.into());
        };
        if let Some(open) = &self.record {
            tracing::warn!(id = open.id, "Record scrape replaced before it ended");
        }

        let id = if self.mode == RunMode::DryRun {
            DRY_RUN_ID
        } else {
            self.store
                .start_record_scrape(scrape_id, record_id, now())
                .await?
        };
        self.record = Some(OpenRecord {
            id,
            record_id: record_id.map(str::to_string),
        });
        Ok(())
    }

    /// Attach the resolved identity to the open row.
    pub fn set_record_id(&mut self, record_id: &str) {
        if let Some(open) = &mut self.record {
            open.record_id = Some(record_id.to_string());
        }
    }

    /// Close the open audit row and count its outcome.
    pub async fn end_record_scrape(
        &mut self,
        status: RecordStatus,
        status_text: Option<&str>,
    ) -> Result<()> {
        if self.mode == RunMode::Test {
            return Ok(());
        }
        let Some(open) = self.record.take() else {
            return Err(FatalError::NoRecordScrapeOpen.into());
        };

        if self.mode == RunMode::DryRun {
            tracing::info!(
                "DRY RUN: Record scrape ended: {} {}",
                status,
                status_text.unwrap_or("")
            );
        } else {
            let updated = self
                .store
                .finish_record_scrape(
                    open.id,
                    open.record_id.as_deref(),
                    status,
                    status_text,
                    now(),
                )
                .await?;
            if !updated {
                return Err(FatalError::NoRecordScrapeOpen.into());
            }
        }
        self.counters.record(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_fatal;
    use playscrape_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn brackets_and_counts() {
        let store = Arc::new(InMemoryStore::new());
        let mut t = RunTracker::new(store.clone(), RunMode::Scrape, "site");
        t.start_scrape().await.unwrap();
        for status in [
            RecordStatus::Created,
            RecordStatus::Created,
            RecordStatus::NoChanges,
            RecordStatus::Updated,
            RecordStatus::Failed,
        ] {
            t.start_record_scrape(None).await.unwrap();
            t.end_record_scrape(status, None).await.unwrap();
        }
        let id = t.scrape_id().unwrap();
        let counters = t.end_scrape(ScrapeStatus::Completed, None).await.unwrap();
        assert_eq!(counters.total(), 4);

        let scrape = store.get_scrape(id).await.unwrap().unwrap();
        assert_eq!(scrape.status, ScrapeStatus::Completed);
        assert_eq!(scrape.counters.created, 2);
        assert_eq!(scrape.counters.failed, 1);
        assert_eq!(scrape.total_records(), 4);

        let rows = store.record_scrapes(id).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.status != RecordStatus::Running));
    }

    #[tokio::test]
    async fn precondition_violations_are_fatal() {
        let store = Arc::new(InMemoryStore::new());
        let mut t = RunTracker::new(store, RunMode::Scrape, "site");

        let err = t.start_record_scrape(None).await.unwrap_err();
        assert!(is_fatal(&err));
        let err = t.end_scrape(ScrapeStatus::Completed, None).await.unwrap_err();
        assert!(is_fatal(&err));

        t.start_scrape().await.unwrap();
        assert!(is_fatal(&t.start_scrape().await.unwrap_err()));
        let err = t
            .end_record_scrape(RecordStatus::Created, None)
            .await
            .unwrap_err();
        assert!(is_fatal(&err));
    }

    #[tokio::test]
    async fn ending_a_missing_row_is_fatal() {
        let store = Arc::new(InMemoryStore::new());
        let mut t = RunTracker::new(store, RunMode::Scrape, "site");
        t.start_scrape().await.unwrap();

        t.start_record_scrape(None).await.unwrap();
        if let Some(open) = t.record.as_mut() {
            open.id = 9999;
        }
        let err = t
            .end_record_scrape(RecordStatus::Created, None)
            .await
            .unwrap_err();
        assert!(is_fatal(&err));
        assert_eq!(t.counters().created, 0);

        t.scrape_id = Some(9999);
        let err = t.end_scrape(ScrapeStatus::Completed, None).await.unwrap_err();
        assert!(is_fatal(&err));
    }

    #[tokio::test]
    async fn dry_run_and_test_mode_write_nothing() {
        for mode in [RunMode::DryRun, RunMode::Test] {
            let store = Arc::new(InMemoryStore::new());
            let mut t = RunTracker::new(store.clone(), mode, "site");
            t.start_scrape().await.unwrap();
            t.start_record_scrape(Some("abc")).await.unwrap();
            t.end_record_scrape(RecordStatus::Created, None).await.unwrap();
            t.end_scrape(ScrapeStatus::Completed, None).await.unwrap();
            assert!(store.recent_scrapes(10).await.unwrap().is_empty());
        }
    }
}

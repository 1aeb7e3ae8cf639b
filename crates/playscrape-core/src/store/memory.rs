//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All tables live in one struct behind a `std::sync::RwLock`, so
//! [`Store::commit_record`] is atomic by holding the write lock for the whole
//! unit.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{
    Download, Record, RecordStatus, RecordWrite, Scrape, ScrapeCounters, ScrapeRecord,
    ScrapeStatus,
};

use super::Store;

#[derive(Default)]
struct Tables {
    records: BTreeMap<String, Record>,
    downloads: BTreeMap<String, Download>,
    scrapes: Vec<Scrape>,
    scrape_records: Vec<ScrapeRecord>,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Row counts as `(records, downloads, scrapes, scrape_records)`.
    pub fn row_counts(&self) -> (usize, usize, usize, usize) {
        let t = self.tables.read().unwrap();
        (
            t.records.len(),
            t.downloads.len(),
            t.scrapes.len(),
            t.scrape_records.len(),
        )
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.tables.read().unwrap().records.get(id).cloned())
    }

    async fn records_for_source(&self, source: &str) -> Result<Vec<Record>> {
        let t = self.tables.read().unwrap();
        Ok(t.records
            .values()
            .filter(|r| r.source == source)
            .cloned()
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<Record>> {
        Ok(self.tables.read().unwrap().records.values().cloned().collect())
    }

    async fn get_download(&self, id: &str) -> Result<Option<Download>> {
        Ok(self.tables.read().unwrap().downloads.get(id).cloned())
    }

    async fn downloads_for_record(&self, record_id: &str) -> Result<Vec<Download>> {
        let t = self.tables.read().unwrap();
        Ok(t.downloads
            .values()
            .filter(|d| d.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn commit_record(&self, write: &RecordWrite) -> Result<()> {
        let mut guard = self.tables.write().unwrap();
        let t = &mut *guard;
        let new = &write.record;

        // Validate before mutating anything.
        for d in &write.downloads {
            if d.record_id != new.id {
                bail!(
                    "download {} references record {} but is committed with {}",
                    d.id,
                    d.record_id,
                    new.id
                );
            }
        }

        match t.records.get_mut(&new.id) {
            Some(existing) => {
                existing.action = new.action.clone();
                existing.url = new.url.clone();
                existing.content = new.content.clone();
                existing.cookies = new.cookies.clone();
                existing.extracted = new.extracted.clone();
                existing.scraped_at = new.scraped_at;
                if write.content_changed {
                    existing.updated_at = new.updated_at;
                }
            }
            None => {
                t.records.insert(new.id.clone(), new.clone());
            }
        }

        if let Some(old_id) = write.replaces.as_deref().filter(|old| *old != new.id) {
            for d in t.downloads.values_mut() {
                if d.record_id == old_id {
                    d.record_id = new.id.clone();
                }
            }
            for sr in t.scrape_records.iter_mut() {
                if sr.record_id.as_deref() == Some(old_id) {
                    sr.record_id = None;
                }
            }
            t.records.remove(old_id);
        }

        for d in &write.downloads {
            match t.downloads.get_mut(&d.id) {
                Some(existing) => {
                    let created_at = existing.created_at;
                    *existing = d.clone();
                    existing.created_at = created_at;
                }
                None => {
                    t.downloads.insert(d.id.clone(), d.clone());
                }
            }
        }

        Ok(())
    }

    async fn start_scrape(&self, source: &str, started_at: i64) -> Result<i64> {
        let mut t = self.tables.write().unwrap();
        let id = t.scrapes.len() as i64 + 1;
        t.scrapes.push(Scrape {
            id,
            source: source.to_string(),
            status: ScrapeStatus::Running,
            counters: ScrapeCounters::default(),
            status_text: None,
            started_at,
            ended_at: None,
        });
        Ok(id)
    }

    async fn finish_scrape(
        &self,
        id: i64,
        status: ScrapeStatus,
        counters: &ScrapeCounters,
        status_text: Option<&str>,
        ended_at: i64,
    ) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        match t.scrapes.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                s.status = status;
                s.counters = *counters;
                s.status_text = status_text.map(str::to_string);
                s.ended_at = Some(ended_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn start_record_scrape(
        &self,
        scrape_id: i64,
        record_id: Option<&str>,
        started_at: i64,
    ) -> Result<i64> {
        let mut t = self.tables.write().unwrap();
        if !t.scrapes.iter().any(|s| s.id == scrape_id) {
            bail!("scrape {} does not exist", scrape_id);
        }
        // Dangling record references are stored as NULL, like the FK would.
        let record_id = record_id
            .filter(|id| t.records.contains_key(*id))
            .map(str::to_string);
        let id = t.scrape_records.len() as i64 + 1;
        t.scrape_records.push(ScrapeRecord {
            id,
            scrape_id,
            record_id,
            status: RecordStatus::Running,
            status_text: None,
            started_at,
            ended_at: None,
        });
        Ok(id)
    }

    async fn finish_record_scrape(
        &self,
        id: i64,
        record_id: Option<&str>,
        status: RecordStatus,
        status_text: Option<&str>,
        ended_at: i64,
    ) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        let record_id = record_id
            .filter(|rid| t.records.contains_key(*rid))
            .map(str::to_string);
        match t.scrape_records.iter_mut().find(|sr| sr.id == id) {
            Some(sr) => {
                sr.record_id = record_id;
                sr.status = status;
                sr.status_text = status_text.map(str::to_string);
                sr.ended_at = Some(ended_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_scrape(&self, id: i64) -> Result<Option<Scrape>> {
        let t = self.tables.read().unwrap();
        Ok(t.scrapes.iter().find(|s| s.id == id).cloned())
    }

    async fn recent_scrapes(&self, limit: i64) -> Result<Vec<Scrape>> {
        let t = self.tables.read().unwrap();
        Ok(t.scrapes
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_scrapes(&self, scrape_id: i64) -> Result<Vec<ScrapeRecord>> {
        let t = self.tables.read().unwrap();
        Ok(t.scrape_records
            .iter()
            .filter(|sr| sr.scrape_id == scrape_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, title: &str, ts: i64) -> Record {
        Record {
            id: id.to_string(),
            source: "test".to_string(),
            url: format!("https://example.com/{}", id),
            action: "item".to_string(),
            content: "<html></html>".to_string(),
            cookies: String::new(),
            extracted: json!({ "title": title }),
            created_at: ts,
            updated_at: ts,
            scraped_at: ts,
        }
    }

    fn download(id: &str, record_id: &str) -> Download {
        Download {
            id: id.to_string(),
            record_id: record_id.to_string(),
            width: 10,
            height: 20,
            file_size: Some(100),
            file_name: format!("{}.jpg", id),
            orig_format: Some("png".to_string()),
            orig_url: format!("https://example.com/{}.png", id),
            orig_cookies: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn unchanged_upsert_keeps_updated_at() {
        let store = InMemoryStore::new();
        let write = RecordWrite {
            record: record("a", "one", 100),
            content_changed: false,
            downloads: vec![],
            replaces: None,
        };
        store.commit_record(&write).await.unwrap();

        let again = RecordWrite {
            record: record("a", "one", 200),
            content_changed: false,
            downloads: vec![],
            replaces: None,
        };
        store.commit_record(&again).await.unwrap();

        let stored = store.get_record("a").await.unwrap().unwrap();
        assert_eq!(stored.updated_at, 100);
        assert_eq!(stored.scraped_at, 200);
        assert_eq!(stored.created_at, 100);
    }

    #[tokio::test]
    async fn rename_moves_downloads_and_drops_old_row() {
        let store = InMemoryStore::new();
        store
            .commit_record(&RecordWrite {
                record: record("old", "x", 1),
                content_changed: false,
                downloads: vec![download("img", "old")],
                replaces: None,
            })
            .await
            .unwrap();

        store
            .commit_record(&RecordWrite {
                record: record("new", "x", 2),
                content_changed: true,
                downloads: vec![],
                replaces: Some("old".to_string()),
            })
            .await
            .unwrap();

        assert!(store.get_record("old").await.unwrap().is_none());
        assert!(store.get_record("new").await.unwrap().is_some());
        let moved = store.get_download("img").await.unwrap().unwrap();
        assert_eq!(moved.record_id, "new");
        assert_eq!(store.row_counts().0, 1);
    }

    #[tokio::test]
    async fn mismatched_download_rejects_whole_write() {
        let store = InMemoryStore::new();
        let err = store
            .commit_record(&RecordWrite {
                record: record("a", "x", 1),
                content_changed: false,
                downloads: vec![download("img", "other")],
                replaces: None,
            })
            .await;
        assert!(err.is_err());
        assert_eq!(store.row_counts(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn scrape_lifecycle_roundtrip() {
        let store = InMemoryStore::new();
        let scrape_id = store.start_scrape("test", 10).await.unwrap();
        let sr = store
            .start_record_scrape(scrape_id, None, 11)
            .await
            .unwrap();
        assert!(store
            .finish_record_scrape(sr, None, RecordStatus::Failed, Some("boom"), 12)
            .await
            .unwrap());
        let counters = ScrapeCounters {
            failed: 1,
            ..Default::default()
        };
        assert!(store
            .finish_scrape(scrape_id, ScrapeStatus::Completed, &counters, None, 13)
            .await
            .unwrap());
        assert!(!store
            .finish_scrape(99, ScrapeStatus::Completed, &counters, None, 13)
            .await
            .unwrap());

        let scrape = store.get_scrape(scrape_id).await.unwrap().unwrap();
        assert_eq!(scrape.status, ScrapeStatus::Completed);
        assert_eq!(scrape.total_records(), 0);
        let rows = store.record_scrapes(scrape_id).await.unwrap();
        assert_eq!(rows[0].status_text.as_deref(), Some("boom"));
    }
}

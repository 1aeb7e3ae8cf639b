//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation to SQL against the schema created by
//! [`crate::migrate`]. [`Store::commit_record`] runs in one transaction.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use playscrape_core::models::{
    Download, Record, RecordStatus, RecordWrite, Scrape, ScrapeCounters, ScrapeRecord,
    ScrapeStatus,
};
use playscrape_core::store::Store;

use crate::migrate;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = connect(db_path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// WAL pool with foreign keys on; creates the file and its parent directory.
async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(10))
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}

const RECORD_COLUMNS: &str =
    "id, source, url, action, content, cookies, extracted, created_at, updated_at, scraped_at";
const DOWNLOAD_COLUMNS: &str = "id, recordId, width, height, file_size, file_name, orig_format, \
     orig_url, orig_cookies, created_at, updated_at";
const SCRAPE_COLUMNS: &str = "id, source, status, created_records, no_changes_records, \
     updated_records, failed_records, statusText, started_at, ended_at";

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let id: String = row.get("id");
    let extracted: String = row.get("extracted");
    Ok(Record {
        extracted: serde_json::from_str(&extracted)
            .with_context(|| format!("Record {} has invalid extracted JSON", id))?,
        id,
        source: row.get("source"),
        url: row.get("url"),
        action: row.get("action"),
        content: row.get("content"),
        cookies: row.get("cookies"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        scraped_at: row.get("scraped_at"),
    })
}

fn download_from_row(row: &SqliteRow) -> Download {
    Download {
        id: row.get("id"),
        record_id: row.get("recordId"),
        width: row.get::<i64, _>("width") as u32,
        height: row.get::<i64, _>("height") as u32,
        file_size: row.get::<Option<i64>, _>("file_size").map(|s| s as u64),
        file_name: row.get("file_name"),
        orig_format: row.get("orig_format"),
        orig_url: row.get("orig_url"),
        orig_cookies: row.get("orig_cookies"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn scrape_from_row(row: &SqliteRow) -> Result<Scrape> {
    let status: String = row.get("status");
    Ok(Scrape {
        id: row.get("id"),
        source: row.get("source"),
        status: status.parse()?,
        counters: ScrapeCounters {
            created: row.get::<i64, _>("created_records") as u32,
            no_changes: row.get::<i64, _>("no_changes_records") as u32,
            updated: row.get::<i64, _>("updated_records") as u32,
            failed: row.get::<i64, _>("failed_records") as u32,
        },
        status_text: row.get("statusText"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query(&format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn records_for_source(&self, source: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM records WHERE source = ? ORDER BY id",
            RECORD_COLUMNS
        ))
        .bind(source)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn all_records(&self) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!("SELECT {} FROM records ORDER BY id", RECORD_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_download(&self, id: &str) -> Result<Option<Download>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM downloads WHERE id = ?",
            DOWNLOAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(download_from_row))
    }

    async fn downloads_for_record(&self, record_id: &str) -> Result<Vec<Download>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM downloads WHERE recordId = ? ORDER BY id",
            DOWNLOAD_COLUMNS
        ))
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(download_from_row).collect())
    }

    async fn commit_record(&self, write: &RecordWrite) -> Result<()> {
        let new = &write.record;
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
        let extracted = serde_json::to_string(&new.extracted)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO records (id, source, url, action, content, cookies, extracted,
                                 created_at, updated_at, scraped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                action = excluded.action,
                url = excluded.url,
                content = excluded.content,
                cookies = excluded.cookies,
                extracted = excluded.extracted,
                scraped_at = excluded.scraped_at,
                updated_at = CASE WHEN ? THEN excluded.updated_at ELSE records.updated_at END
            "#,
        )
        .bind(&new.id)
        .bind(&new.source)
        .bind(&new.url)
        .bind(&new.action)
        .bind(&new.content)
        .bind(&new.cookies)
        .bind(&extracted)
        .bind(new.created_at)
        .bind(new.updated_at)
        .bind(new.scraped_at)
        .bind(write.content_changed)
        .execute(&mut *tx)
        .await?;

        if let Some(old_id) = write.replaces.as_deref().filter(|old| *old != new.id) {
            sqlx::query("UPDATE downloads SET recordId = ? WHERE recordId = ?")
                .bind(&new.id)
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM records WHERE id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        for d in &write.downloads {
            sqlx::query(
                r#"
                INSERT INTO downloads (id, recordId, width, height, file_size, file_name,
                                       orig_format, orig_url, orig_cookies, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    recordId = excluded.recordId,
                    width = excluded.width,
                    height = excluded.height,
                    file_size = excluded.file_size,
                    file_name = excluded.file_name,
                    orig_format = excluded.orig_format,
                    orig_url = excluded.orig_url,
                    orig_cookies = excluded.orig_cookies,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&d.id)
            .bind(&d.record_id)
            .bind(d.width as i64)
            .bind(d.height as i64)
            .bind(d.file_size.map(|s| s as i64))
            .bind(&d.file_name)
            .bind(&d.orig_format)
            .bind(&d.orig_url)
            .bind(&d.orig_cookies)
            .bind(d.created_at)
            .bind(d.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn start_scrape(&self, source: &str, started_at: i64) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scrapes (source, status, started_at) VALUES (?, ?, ?)",
        )
        .bind(source)
        .bind(ScrapeStatus::Running.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn finish_scrape(
        &self,
        id: i64,
        status: ScrapeStatus,
        counters: &ScrapeCounters,
        status_text: Option<&str>,
        ended_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scrapes SET
                status = ?,
                created_records = ?,
                no_changes_records = ?,
                updated_records = ?,
                failed_records = ?,
                total_records = ?,
                statusText = ?,
                ended_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(counters.created as i64)
        .bind(counters.no_changes as i64)
        .bind(counters.updated as i64)
        .bind(counters.failed as i64)
        .bind(counters.total() as i64)
        .bind(status_text)
        .bind(ended_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn start_record_scrape(
        &self,
        scrape_id: i64,
        record_id: Option<&str>,
        started_at: i64,
    ) -> Result<i64> {
        // A record id that is not stored (yet) is kept as NULL.
        let result = sqlx::query(
            r#"
            INSERT INTO scrape_records (scrapeId, recordId, status, started_at)
            VALUES (?, (SELECT id FROM records WHERE id = ?), ?, ?)
            "#,
        )
        .bind(scrape_id)
        .bind(record_id)
        .bind(RecordStatus::Running.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn finish_record_scrape(
        &self,
        id: i64,
        record_id: Option<&str>,
        status: RecordStatus,
        status_text: Option<&str>,
        ended_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_records SET
                recordId = (SELECT id FROM records WHERE id = ?),
                status = ?,
                statusText = ?,
                ended_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record_id)
        .bind(status.as_str())
        .bind(status_text)
        .bind(ended_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_scrape(&self, id: i64) -> Result<Option<Scrape>> {
        let row = sqlx::query(&format!("SELECT {} FROM scrapes WHERE id = ?", SCRAPE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scrape_from_row).transpose()
    }

    async fn recent_scrapes(&self, limit: i64) -> Result<Vec<Scrape>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scrapes ORDER BY id DESC LIMIT ?",
            SCRAPE_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scrape_from_row).collect()
    }

    async fn record_scrapes(&self, scrape_id: i64) -> Result<Vec<ScrapeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scrapeId, recordId, status, statusText, started_at, ended_at
            FROM scrape_records WHERE scrapeId = ? ORDER BY id
            "#,
        )
        .bind(scrape_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(ScrapeRecord {
                    id: row.get("id"),
                    scrape_id: row.get("scrapeId"),
                    record_id: row.get("recordId"),
                    status: status.parse()?,
                    status_text: row.get("statusText"),
                    started_at: row.get("started_at"),
                    ended_at: row.get("ended_at"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, extracted: serde_json::Value, ts: i64) -> Record {
        Record {
            id: id.to_string(),
            source: "site".to_string(),
            url: format!("https://example.com/{}", id),
            action: "item".to_string(),
            content: "<html></html>".to_string(),
            cookies: String::new(),
            extracted,
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
            file_size: Some(123),
            file_name: format!("{}.jpg", id),
            orig_format: Some("png".to_string()),
            orig_url: format!("https://example.com/{}.png", id),
            orig_cookies: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    async fn open() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("test.db")).await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn upsert_keeps_updated_at_unless_changed() {
        let (_tmp, store) = open().await;
        let write = |r: Record, changed: bool| RecordWrite {
            record: r,
            content_changed: changed,
            downloads: vec![],
            replaces: None,
        };

        store.commit_record(&write(record("a", json!({"t": 1}), 100), false)).await.unwrap();
        store.commit_record(&write(record("a", json!({"t": 1}), 200), false)).await.unwrap();
        let r = store.get_record("a").await.unwrap().unwrap();
        assert_eq!((r.created_at, r.updated_at, r.scraped_at), (100, 100, 200));

        store.commit_record(&write(record("a", json!({"t": 2}), 300), true)).await.unwrap();
        let r = store.get_record("a").await.unwrap().unwrap();
        assert_eq!((r.updated_at, r.extracted.clone()), (300, json!({"t": 2})));
    }

    #[tokio::test]
    async fn rename_moves_downloads_and_nulls_audit_rows() {
        let (_tmp, store) = open().await;
        store
            .commit_record(&RecordWrite {
                record: record("old", json!({}), 1),
                content_changed: false,
                downloads: vec![download("img", "old")],
                replaces: None,
            })
            .await
            .unwrap();

        let scrape = store.start_scrape("site", 1).await.unwrap();
        let sr = store.start_record_scrape(scrape, Some("old"), 1).await.unwrap();
        store
            .finish_record_scrape(sr, Some("old"), RecordStatus::Created, None, 2)
            .await
            .unwrap();

        store
            .commit_record(&RecordWrite {
                record: record("new", json!({}), 3),
                content_changed: false,
                downloads: vec![],
                replaces: Some("old".to_string()),
            })
            .await
            .unwrap();

        assert!(store.get_record("old").await.unwrap().is_none());
        assert!(store.get_record("new").await.unwrap().is_some());
        assert_eq!(store.get_download("img").await.unwrap().unwrap().record_id, "new");
        assert_eq!(store.record_scrapes(scrape).await.unwrap()[0].record_id, None);
    }

    #[tokio::test]
    async fn scrape_rows_round_trip() {
        let (_tmp, store) = open().await;
        let id = store.start_scrape("site", 10).await.unwrap();
        let sr = store.start_record_scrape(id, Some("missing"), 10).await.unwrap();
        assert!(store
            .finish_record_scrape(sr, Some("missing"), RecordStatus::Failed, Some("boom"), 11)
            .await
            .unwrap());

        let counters = ScrapeCounters {
            created: 2,
            no_changes: 1,
            updated: 1,
            failed: 1,
        };
        assert!(store
            .finish_scrape(id, ScrapeStatus::Completed, &counters, None, 12)
            .await
            .unwrap());
        assert!(!store
            .finish_scrape(999, ScrapeStatus::Failed, &counters, None, 12)
            .await
            .unwrap());

        let scrape = store.get_scrape(id).await.unwrap().unwrap();
        assert_eq!(scrape.status, ScrapeStatus::Completed);
        assert_eq!(scrape.counters, counters);
        assert_eq!(scrape.total_records(), 4);

        let rows = store.record_scrapes(id).await.unwrap();
        assert_eq!(rows[0].record_id, None);
        assert_eq!(rows[0].status, RecordStatus::Failed);
        assert_eq!(rows[0].status_text.as_deref(), Some("boom"));
    }
}

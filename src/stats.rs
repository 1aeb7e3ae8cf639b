//! Database statistics: recent scrape runs and per-source totals.
//!
//! Used by `playscrape stats` to check that runs complete and records
//! accumulate where expected.

use anyhow::Result;
use sqlx::Row;
use std::path::Path;

use playscrape_core::models::Scrape;
use playscrape_core::store::Store;

use crate::sqlite_store::SqliteStore;

/// Per-source record and download counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStats {
    pub source: String,
    pub records: i64,
    pub downloads: i64,
    pub last_scraped: Option<i64>,
}

pub async fn source_stats(store: &SqliteStore) -> Result<Vec<SourceStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            r.source,
            COUNT(DISTINCT r.id) AS record_count,
            COUNT(DISTINCT d.id) AS download_count,
            MAX(r.scraped_at) AS last_scraped
        FROM records r
        LEFT JOIN downloads d ON d.recordId = r.id
        GROUP BY r.source
        ORDER BY r.source
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    Ok(rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            records: row.get("record_count"),
            downloads: row.get("download_count"),
            last_scraped: row.get("last_scraped"),
        })
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(store: &SqliteStore, db_path: &Path, limit: i64) -> Result<()> {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let sources = source_stats(store).await?;
    let scrapes = store.recent_scrapes(limit).await?;

    println!("playscrape: database stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Records:     {}",
        sources.iter().map(|s| s.records).sum::<i64>()
    );
    println!(
        "  Downloads:   {}",
        sources.iter().map(|s| s.downloads).sum::<i64>()
    );

    if !sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:>8} {:>10}   {}",
            "SOURCE", "RECORDS", "DOWNLOADS", "LAST SCRAPED"
        );
        println!("  {}", "-".repeat(64));
        for s in &sources {
            let last = match s.last_scraped {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>10}   {}",
                s.source, s.records, s.downloads, last
            );
        }
    }

    if !scrapes.is_empty() {
        println!();
        println!("  Recent scrapes:");
        println!(
            "  {:>5} {:<16} {:<10} {:>7} {:>7} {:>7} {:>6} {:>9}   {}",
            "ID", "SOURCE", "STATUS", "CREATED", "SAME", "UPDATED", "FAILED", "DURATION", "STARTED"
        );
        println!("  {}", "-".repeat(96));
        for s in &scrapes {
            println!(
                "  {:>5} {:<16} {:<10} {:>7} {:>7} {:>7} {:>6} {:>9}   {}",
                s.id,
                s.source,
                s.status,
                s.counters.created,
                s.counters.no_changes,
                s.counters.updated,
                s.counters.failed,
                duration(s),
                format_ts_relative(s.started_at)
            );
        }
    }

    println!();
    Ok(())
}

fn duration(scrape: &Scrape) -> String {
    match scrape.ended_at {
        Some(end) => {
            let secs = (end - scrape.started_at).max(0);
            if secs < 60 {
                format!("{}s", secs)
            } else if secs < 3600 {
                format!("{}m{:02}s", secs / 60, secs % 60)
            } else {
                format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
            }
        }
        None => "-".to_string(),
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use playscrape_core::models::{Download, Record, RecordWrite, ScrapeCounters, ScrapeStatus};

    #[test]
    fn durations_and_sizes() {
        let mut scrape = Scrape {
            id: 1,
            source: "s".to_string(),
            status: ScrapeStatus::Completed,
            counters: ScrapeCounters::default(),
            status_text: None,
            started_at: 100,
            ended_at: Some(225),
        };
        assert_eq!(duration(&scrape), "2m05s");
        scrape.ended_at = None;
        assert_eq!(duration(&scrape), "-");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }

    #[tokio::test]
    async fn counts_records_and_downloads_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("stats.db")).await.unwrap();

        let record = |id: &str, source: &str| Record {
            id: id.to_string(),
            source: source.to_string(),
            url: "u".to_string(),
            action: "start".to_string(),
            content: String::new(),
            cookies: String::new(),
            extracted: serde_json::json!({}),
            created_at: 10,
            updated_at: 10,
            scraped_at: 10,
        };
        let download = Download {
            id: "img1".to_string(),
            record_id: "r1".to_string(),
            width: 1,
            height: 1,
            file_size: Some(1),
            file_name: "img1.jpg".to_string(),
            orig_format: None,
            orig_url: "https://example.com/1.jpg".to_string(),
            orig_cookies: None,
            created_at: 10,
            updated_at: 10,
        };
        store
            .commit_record(&RecordWrite {
                record: record("r1", "a"),
                content_changed: true,
                downloads: vec![download],
                replaces: None,
            })
            .await
            .unwrap();
        store
            .commit_record(&RecordWrite {
                record: record("r2", "b"),
                content_changed: true,
                downloads: vec![],
                replaces: None,
            })
            .await
            .unwrap();

        let stats = source_stats(&store).await.unwrap();
        assert_eq!(
            stats,
            vec![
                SourceStats {
                    source: "a".to_string(),
                    records: 1,
                    downloads: 1,
                    last_scraped: Some(10)
                },
                SourceStats {
                    source: "b".to_string(),
                    records: 1,
                    downloads: 0,
                    last_scraped: Some(10)
                },
            ]
        );
    }
}

use anyhow::Result;
use sqlx::SqlitePool;

/// Create the four tables and their indexes. Safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            url TEXT NOT NULL,
            action TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            cookies TEXT NOT NULL DEFAULT '',
            extracted TEXT NOT NULL DEFAULT 'null',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            scraped_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            recordId TEXT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            file_size INTEGER,
            file_name TEXT NOT NULL,
            orig_format TEXT,
            orig_url TEXT NOT NULL,
            orig_cookies TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (recordId) REFERENCES records(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrapes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            created_records INTEGER NOT NULL DEFAULT 0,
            no_changes_records INTEGER NOT NULL DEFAULT 0,
            updated_records INTEGER NOT NULL DEFAULT 0,
            failed_records INTEGER NOT NULL DEFAULT 0,
            total_records INTEGER NOT NULL DEFAULT 0,
            statusText TEXT,
            started_at INTEGER NOT NULL,
            ended_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scrapeId INTEGER NOT NULL,
            recordId TEXT,
            status TEXT NOT NULL,
            statusText TEXT,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            FOREIGN KEY (scrapeId) REFERENCES scrapes(id),
            FOREIGN KEY (recordId) REFERENCES records(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_source ON records(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_record_id ON downloads(recordId)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scrapes_source ON scrapes(source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scrape_records_scrape_id ON scrape_records(scrapeId)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

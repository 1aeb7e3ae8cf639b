use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use playscrape::core::models::RecordStatus;
use playscrape::core::store::Store;
use playscrape::sqlite_store::SqliteStore;

fn playscrape_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_playscrape"))
}

fn page(title: &str, image: &Path) -> String {
    format!(
        r#"<html><body><h1>{}</h1><img class="main" src="file://{}"></body></html>"#,
        title,
        image.display()
    )
}

/// Mirror of two pages sharing one local image.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let mirror = root.join("mirror");
    fs::create_dir_all(mirror.join("art")).unwrap();
    let image = root.join("cover.png");
    image::RgbImage::new(4, 2).save(&image).unwrap();

    fs::write(mirror.join("art/a.html"), page("Starry Night", &image)).unwrap();
    fs::write(mirror.join("art/b.html"), page("Irises", &image)).unwrap();

    let action_file = root.join("gallery.toml");
    fs::write(
        &action_file,
        r#"[options]
source = "gallery"
delay_ms = 0

[mirror]
root = "mirror"
html_files = "art/*.html"
base_url = "https://example.com/"
extract = { fields = { title = "h1" } }
images = { selector = "img.main@src" }
"#,
    )
    .unwrap();

    (tmp, action_file)
}

fn run(args: &[&str], action_file: &Path) -> (String, String, bool) {
    let binary = playscrape_binary();
    let output = Command::new(&binary)
        .args(args)
        .arg(action_file)
        .env("RUST_LOG", "playscrape=warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run playscrape binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn open_store(root: &Path) -> SqliteStore {
    SqliteStore::open(&root.join("playscrape.db")).await.unwrap()
}

#[tokio::test]
async fn test_scrape_stores_records_and_images() {
    let (tmp, action_file) = setup_test_env();
    let (_, stderr, ok) = run(&["scrape"], &action_file);
    assert!(ok, "scrape failed: {}", stderr);

    let store = open_store(tmp.path()).await;
    let records = store.records_for_source("gallery").await.unwrap();
    assert_eq!(records.len(), 2);
    let urls: Vec<&str> = records.iter().map(|r| r.url.as_str()).collect();
    assert!(urls.contains(&"https://example.com/art/a.html"));

    // Both pages point at the same image: one download row, one file.
    let mut downloads = Vec::new();
    for r in &records {
        downloads.extend(store.downloads_for_record(&r.id).await.unwrap());
    }
    assert_eq!(downloads.len(), 1);
    assert_eq!((downloads[0].width, downloads[0].height), (4, 2));
    assert!(tmp.path().join("images").join(&downloads[0].file_name).exists());

    let scrapes = store.recent_scrapes(1).await.unwrap();
    assert_eq!(scrapes[0].counters.created, 2);
}

#[tokio::test]
async fn test_rescrape_is_idempotent() {
    let (tmp, action_file) = setup_test_env();
    assert!(run(&["scrape"], &action_file).2);
    let before = open_store(tmp.path()).await.all_records().await.unwrap();

    let (_, stderr, ok) = run(&["scrape"], &action_file);
    assert!(ok, "second scrape failed: {}", stderr);

    let store = open_store(tmp.path()).await;
    let after = store.all_records().await.unwrap();
    assert_eq!(after.len(), 2);
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.id, a.id);
        assert_eq!(b.updated_at, a.updated_at);
    }

    let latest = &store.recent_scrapes(1).await.unwrap()[0];
    assert_eq!(latest.counters.no_changes, 2);
    assert_eq!(latest.counters.created, 0);
    let rows = store.record_scrapes(latest.id).await.unwrap();
    assert!(rows.iter().all(|r| r.status == RecordStatus::NoChanges));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let (tmp, action_file) = setup_test_env();
    let (stdout, stderr, ok) = run(&["scrape", "--dry-run"], &action_file);
    assert!(ok, "dry run failed: {}", stderr);
    assert!(stdout.contains("DRY RUN: Record would be saved here."));

    let store = open_store(tmp.path()).await;
    assert!(store.all_records().await.unwrap().is_empty());
    assert!(store.recent_scrapes(10).await.unwrap().is_empty());
    let images = tmp.path().join("images");
    assert!(!images.exists() || fs::read_dir(&images).unwrap().next().is_none());
}

#[test]
fn test_export_flattens_records() {
    let (_tmp, action_file) = setup_test_env();
    assert!(run(&["scrape"], &action_file).2);

    let (stdout, stderr, ok) = run(&["export", "--stdout"], &action_file);
    assert!(ok, "export failed: {}", stderr);
    let items: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().any(|i| i["title"] == "Irises"));
    assert!(items.iter().all(|i| i["id"].is_string() && i["url"].is_string()));
}

#[test]
fn test_snapshot_mismatch_fails_until_updated() {
    let (tmp, action_file) = setup_test_env();

    let (stdout, stderr, ok) = run(&["test"], &action_file);
    assert!(ok, "first test run failed: {}", stderr);
    assert!(stdout.contains("Snapshot file not found, creating."));
    assert!(run(&["test"], &action_file).2);

    let image = tmp.path().join("cover.png");
    fs::write(
        tmp.path().join("mirror/art/a.html"),
        page("The Starry Night", &image),
    )
    .unwrap();

    let (stdout, _, ok) = run(&["test"], &action_file);
    assert!(!ok, "mismatch should exit non-zero");
    assert!(stdout.contains("Data mismatch for:"));

    let (_, stderr, ok) = run(&["test", "-u"], &action_file);
    assert!(ok, "update run failed: {}", stderr);
    assert!(run(&["test"], &action_file).2);
}

#[test]
fn test_missing_action_file_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run(&["scrape"], &tmp.path().join("nope.toml"));
    assert!(!ok);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn test_init_scaffolds_files() {
    let tmp = TempDir::new().unwrap();
    let status = Command::new(playscrape_binary())
        .args(["init", "gallery"])
        .current_dir(tmp.path())
        .output()
        .unwrap();
    assert!(status.status.success());
    assert!(tmp.path().join("gallery.toml").exists());
    assert!(tmp.path().join("gallery.lua").exists());

    let again = Command::new(playscrape_binary())
        .args(["init", "gallery"])
        .current_dir(tmp.path())
        .output()
        .unwrap();
    assert!(!again.status.success());
}

//! Mirror mode: extract records from HTML files on disk.
//!
//! Files under the mirror root are matched against glob patterns (relative
//! to the root) and fed to the extraction engine one by one, in path order.

use anyhow::{bail, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::actions::{MirrorAction, MIRROR_ACTION};
use crate::config::RunMode;
use crate::extract::{handle_extract, Capture};
use crate::progress::ScrapeProgressEvent;
use crate::session::Session;

/// Files under `root` matching any of `patterns`, as `(absolute, relative)`
/// pairs sorted by relative path.
pub fn matching_files(root: &Path, patterns: &[String]) -> Result<Vec<(PathBuf, PathBuf)>> {
    if !root.is_dir() {
        bail!("Mirror root does not exist: {}", root.display());
    }
    let set = build_globset(patterns)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if set.is_match(relative) {
            files.push((path.to_path_buf(), relative.to_path_buf()));
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("Invalid glob: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Record URL for a mirrored file.
pub fn file_url(mirror: &MirrorAction, relative: &Path) -> Result<String> {
    match &mirror.url_from_file {
        Some(hook) => hook.url_for(relative),
        None => Ok(relative.display().to_string()),
    }
}

/// Extract every matching file. Test mode uses `test_files`.
pub async fn run_mirror(session: &mut Session, mirror: &MirrorAction) -> Result<()> {
    let patterns = match session.mode() {
        RunMode::Test => &mirror.test_files,
        _ => &mirror.html_files,
    };
    let files = matching_files(&mirror.root, patterns)?;
    if files.is_empty() {
        bail!("No files found to extract from.");
    }
    tracing::info!(count = files.len(), root = %mirror.root.display(), "Extracting mirrored files");
    session.report(ScrapeProgressEvent::Action {
        name: MIRROR_ACTION.to_string(),
    });

    for (path, relative) in files {
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Failed to read file, skipping");
                continue;
            }
        };
        if content.is_empty() {
            tracing::debug!(file = %relative.display(), "Empty file, skipping");
            continue;
        }
        let url = match file_url(mirror, &relative) {
            Ok(u) => u,
            Err(e) => {
                tracing::error!(file = %relative.display(), error = %format!("{:#}", e), "No URL for file, skipping");
                continue;
            }
        };
        tracing::debug!(file = %relative.display(), url = %url, "Extracting");
        let capture = Capture {
            url,
            content,
            cookies: String::new(),
        };
        handle_extract(session, MIRROR_ACTION, &mirror.extract, &capture, None).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn matches_relative_to_root_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("pages/sub")).unwrap();
        fs::write(root.join("pages/b.html"), "b").unwrap();
        fs::write(root.join("pages/sub/a.html"), "a").unwrap();
        fs::write(root.join("pages/notes.txt"), "x").unwrap();
        fs::write(root.join("top.html"), "t").unwrap();

        let all = matching_files(root, &["**/*.html".to_string()]).unwrap();
        let rel: Vec<_> = all.iter().map(|(_, r)| r.to_string_lossy().to_string()).collect();
        assert_eq!(rel, vec!["pages/b.html", "pages/sub/a.html", "top.html"]);

        let some = matching_files(root, &["pages/*.html".to_string()]).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].1, PathBuf::from("pages/b.html"));
    }

    #[tokio::test]
    async fn empty_files_are_skipped() {
        use crate::actions::{ExtractHooks, FieldExtractor, FieldSpec};
        use crate::config::Settings;
        use playscrape_core::store::memory::InMemoryStore;
        use playscrape_core::store::Store;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mirror");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("blank.html"), "").unwrap();
        fs::write(root.join("full.html"), "<h1>Irises</h1>").unwrap();

        let extract = Arc::new(FieldExtractor {
            records: None,
            fields: vec![(
                "title".to_string(),
                FieldSpec {
                    expr: "h1".to_string(),
                    all: false,
                },
            )],
        });
        let mirror = MirrorAction::new(
            root.clone(),
            ExtractHooks {
                extract,
                images: None,
            },
        );

        let store = Arc::new(InMemoryStore::new());
        let mut settings = Settings::for_dir(dir.path(), RunMode::Scrape);
        settings.delay = std::time::Duration::ZERO;
        let mut session = Session::local(settings, store.clone());
        session.tracker.start_scrape().await.unwrap();
        run_mirror(&mut session, &mirror).await.unwrap();

        let counters = session.tracker.counters();
        assert_eq!(counters.created, 1);
        assert_eq!(counters.failed, 0);
        let scrape_id = session.tracker.scrape_id().unwrap();
        assert_eq!(store.record_scrapes(scrape_id).await.unwrap().len(), 1);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = matching_files(&dir.path().join("nope"), &["*.html".to_string()]).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}

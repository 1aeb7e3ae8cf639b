//! Extraction and reconciliation.
//!
//! [`handle_extract`] turns one captured page into stored records:
//!
//! 1. Run the action's extract hook over the page DOM and normalize the
//!    result into candidates (an object becomes a one-element list).
//! 2. Resolve each candidate's identity and URL, and list its images.
//! 3. Compare against the stored record to pick `created`, `noChanges`,
//!    or `updated`, with a rendered diff as status text.
//! 4. Download new images, then commit record and download rows together.
//!
//! Each candidate is bracketed by a scrape-record row. Failures stay local
//! to the candidate unless they are [`FatalError`](crate::error::FatalError)s.
//!
//! Dry-run and test mode replace step 4 with printing and snapshot
//! comparison respectively.

use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashSet;

use playscrape_core::diff::diff_string;
use playscrape_core::identity::{record_id, record_url};
use playscrape_core::models::{Download, Record, RecordStatus, RecordWrite};

use crate::actions::{ExtractHooks, PageData, Plan, MIRROR_ACTION};
use crate::config::RunMode;
use crate::dom::DomQuery;
use crate::error::is_fatal;
use crate::progress::ScrapeProgressEvent;
use crate::session::Session;
use crate::snapshot::{check_snapshot, SnapshotOutcome};

const NO_DATA: &str = "No data extracted.";

/// Page state captured for extraction.
#[derive(Debug, Clone)]
pub struct Capture {
    pub url: String,
    pub content: String,
    /// `Cookie` header form of the session cookies.
    pub cookies: String,
}

struct Candidate {
    id: String,
    url: String,
    extracted: Value,
    images: Result<Vec<String>>,
}

/// Run the synchronous hooks. The parsed DOM never leaves this function.
fn evaluate(hooks: &ExtractHooks, capture: &Capture) -> Result<Vec<Candidate>> {
    let dom = DomQuery::parse(&capture.content);
    let page = PageData {
        url: &capture.url,
        content: &capture.content,
        dom: &dom,
    };

    let items = match hooks.extract.extract(&page)? {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Vec::new(),
        Some(Value::Array(items)) => items.into_iter().filter(|v| !v.is_null()).collect(),
        Some(other) => vec![other],
    };

    items
        .into_iter()
        .map(|extracted| {
            if !extracted.is_object() {
                bail!("Extract returned {} where an object was expected", extracted);
            }
            let images = match &hooks.images {
                Some(h) => h.image_urls(&page, &extracted),
                None => Ok(Vec::new()),
            };
            Ok(Candidate {
                id: record_id(&extracted, &capture.url),
                url: record_url(&extracted, &capture.url),
                extracted,
                images,
            })
        })
        .collect()
}

/// Extract and reconcile one captured page.
///
/// `previous` is the stored record being re-extracted, if any. Returns
/// whether every candidate succeeded; `Err` only for fatal errors.
pub async fn handle_extract(
    session: &mut Session,
    action: &str,
    hooks: &ExtractHooks,
    capture: &Capture,
    previous: Option<&Record>,
) -> Result<bool> {
    session
        .tracker
        .start_record_scrape(previous.map(|r| r.id.as_str()))
        .await?;

    let candidates = match evaluate(hooks, capture) {
        Ok(c) if c.is_empty() => {
            tracing::warn!(action, url = %capture.url, "{}", NO_DATA);
            finish(session, action, "", RecordStatus::Failed, Some(NO_DATA)).await?;
            return Ok(false);
        }
        Ok(c) => c,
        Err(e) => {
            let text = format!("{:#}", e);
            tracing::error!(action, url = %capture.url, error = %text, "Extraction failed");
            finish(session, action, "", RecordStatus::Failed, Some(&text)).await?;
            return Ok(false);
        }
    };

    let single = candidates.len() == 1;
    let mut all_ok = true;
    for candidate in candidates {
        if !session.tracker.is_record_open() {
            session.tracker.start_record_scrape(Some(&candidate.id)).await?;
        }
        session.tracker.set_record_id(&candidate.id);

        // A stored record only stands in for a differently-keyed candidate
        // when the page yields exactly one.
        let renamed_from = previous.filter(|p| single && p.id != candidate.id);

        let outcome = match session.mode() {
            RunMode::DryRun => dry_run(session, capture, &candidate, renamed_from).await,
            RunMode::Test => snapshot(session, &candidate),
            RunMode::Scrape => persist(session, action, capture, &candidate, renamed_from).await,
        };

        let (status, text) = match outcome {
            Ok(o) => o,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                let text = format!("{:#}", e);
                tracing::error!(id = %candidate.id, error = %text, "Record failed");
                (RecordStatus::Failed, Some(text))
            }
        };
        if status == RecordStatus::Failed {
            all_ok = false;
        }
        finish(session, action, &candidate.id, status, text.as_deref()).await?;
    }
    Ok(all_ok)
}

async fn finish(
    session: &mut Session,
    action: &str,
    id: &str,
    status: RecordStatus,
    text: Option<&str>,
) -> Result<()> {
    session.tracker.end_record_scrape(status, text).await?;
    tracing::debug!(action, id, status = %status, "Record scrape ended");
    session.report(ScrapeProgressEvent::Record {
        action: action.to_string(),
        id: id.to_string(),
        status,
        counters: session.tracker.counters(),
    });
    Ok(())
}

/// Stored record to compare a candidate against.
async fn prior_record(
    session: &Session,
    candidate: &Candidate,
    renamed_from: Option<&Record>,
) -> Result<Option<Record>> {
    match renamed_from {
        Some(r) => Ok(Some(r.clone())),
        None => session.store.get_record(&candidate.id).await,
    }
}

fn status_against(prior: Option<&Record>, extracted: &Value) -> (RecordStatus, Option<String>) {
    match prior {
        None => (RecordStatus::Created, None),
        Some(p) => match diff_string(&p.extracted, extracted) {
            None => (RecordStatus::NoChanges, None),
            Some(diff) => (RecordStatus::Updated, Some(diff)),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Modes
// ═══════════════════════════════════════════════════════════════════════

async fn persist(
    session: &Session,
    action: &str,
    capture: &Capture,
    candidate: &Candidate,
    renamed_from: Option<&Record>,
) -> Result<(RecordStatus, Option<String>)> {
    let prior = prior_record(session, candidate, renamed_from).await?;
    let (status, text) = status_against(prior.as_ref(), &candidate.extracted);

    let urls = match &candidate.images {
        Ok(urls) => urls.clone(),
        Err(e) => bail!("Image hook failed: {:#}", e),
    };
    let downloads = resolve_downloads(session, &candidate.id, &urls, &capture.cookies).await?;

    let now = chrono::Utc::now().timestamp();
    let record = Record {
        id: candidate.id.clone(),
        source: session.settings.source.clone(),
        url: candidate.url.clone(),
        action: action.to_string(),
        content: capture.content.clone(),
        cookies: capture.cookies.clone(),
        extracted: candidate.extracted.clone(),
        created_at: prior.as_ref().map(|p| p.created_at).unwrap_or(now),
        updated_at: match (&prior, status) {
            (Some(p), RecordStatus::NoChanges) => p.updated_at,
            _ => now,
        },
        scraped_at: now,
    };

    session
        .store
        .commit_record(&RecordWrite {
            record,
            content_changed: status == RecordStatus::Updated,
            downloads,
            replaces: renamed_from.map(|r| r.id.clone()),
        })
        .await?;

    if let Some(old) = renamed_from {
        tracing::info!(old = %old.id, new = %candidate.id, "Record id changed");
    }
    tracing::info!(id = %candidate.id, status = %status, "Record saved");
    Ok((status, text))
}

/// Download every image that has no `downloads` row yet.
///
/// Existing rows are trusted unless overwriting. Duplicates within the
/// batch are fetched once. Any failure fails the whole batch.
async fn resolve_downloads(
    session: &Session,
    record_id: &str,
    urls: &[String],
    cookies: &str,
) -> Result<Vec<Download>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        let target = session.images.target(url)?;
        if !seen.insert(target.id.clone()) {
            continue;
        }
        if !session.settings.overwrite {
            if let Some(existing) = session.store.get_download(&target.id).await? {
                tracing::debug!(url = %url, file = %existing.file_name, "Image already downloaded");
                continue;
            }
        }
        session.pause().await;
        tracing::info!(url = %url, "Downloading image");
        out.push(session.images.download(record_id, url, cookies).await?);
    }
    Ok(out)
}

fn truncated(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

async fn dry_run(
    session: &Session,
    capture: &Capture,
    candidate: &Candidate,
    renamed_from: Option<&Record>,
) -> Result<(RecordStatus, Option<String>)> {
    let prior = prior_record(session, candidate, renamed_from).await?;
    let (status, text) = status_against(prior.as_ref(), &candidate.extracted);

    match &prior {
        Some(p) => {
            if p.id != candidate.id {
                println!(
                    "DRY RUN: Record ID changed. (old: {}, new: {})",
                    p.id, candidate.id
                );
            }
            if let Some(diff) = &text {
                println!("DRY RUN: Data updated for {}", candidate.id);
                println!("{}", diff);
            }
        }
        None => {
            let shown = serde_json::json!({
                "id": candidate.id,
                "source": session.settings.source,
                "url": candidate.url,
                "content": truncated(&capture.content, 50),
                "cookies": truncated(&capture.cookies, 50),
                "extracted": candidate.extracted,
                "images": candidate.images.as_ref().ok(),
            });
            println!("DRY RUN: Record would be saved here.");
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
    }
    Ok((status, text))
}

fn snapshot(session: &Session, candidate: &Candidate) -> Result<(RecordStatus, Option<String>)> {
    let dir = &session.settings.test_dir;
    let overwrite = session.settings.overwrite;
    let outcome = check_snapshot(dir, &candidate.id, &candidate.extracted, overwrite)?;

    match &candidate.images {
        Ok(urls) if !urls.is_empty() => {
            check_snapshot(
                dir,
                &format!("{}.images", candidate.id),
                &serde_json::json!(urls),
                overwrite,
            )?;
        }
        Ok(_) => {}
        Err(e) => bail!("Image hook failed: {:#}", e),
    }

    Ok(match outcome {
        SnapshotOutcome::Created => (RecordStatus::Created, None),
        SnapshotOutcome::Matched => (RecordStatus::NoChanges, None),
        SnapshotOutcome::Overwritten { diff } => (RecordStatus::Updated, Some(diff)),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Re-extraction
// ═══════════════════════════════════════════════════════════════════════

/// Re-run extraction over every stored record of the session's source,
/// using the stored content instead of fetching.
pub async fn re_extract(session: &mut Session, plan: &Plan) -> Result<()> {
    let records = session
        .store
        .records_for_source(&session.settings.source)
        .await?;
    tracing::info!(count = records.len(), "Re-extracting stored records");

    for record in records {
        let hooks = match plan {
            Plan::Browser(set) => set.get(&record.action).ok().and_then(|a| a.extract.clone()),
            Plan::Mirror(m) if record.action == MIRROR_ACTION => Some(m.extract.clone()),
            Plan::Mirror(_) => None,
        };
        let Some(hooks) = hooks else {
            tracing::warn!(id = %record.id, action = %record.action, "No extract for action, skipping");
            continue;
        };
        if record.content.is_empty() {
            tracing::warn!(id = %record.id, "Record has no stored content, skipping");
            continue;
        }

        let capture = Capture {
            url: record.url.clone(),
            content: record.content.clone(),
            cookies: record.cookies.clone(),
        };
        handle_extract(session, &record.action, &hooks, &capture, Some(&record)).await?;
    }
    Ok(())
}

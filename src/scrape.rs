//! Run orchestration.
//!
//! Each entry point brackets its work in one scrape row: the row is opened
//! first, and whatever escapes the run decides whether it closes as
//! `completed` or `failed` (with the error text) before the error is passed
//! on to the caller.

use anyhow::Result;
use std::sync::Arc;

use playscrape_core::models::{ScrapeCounters, ScrapeStatus};

use crate::actions::{ActionSet, Plan};
use crate::error::{is_fatal, FatalError};
use crate::extract::re_extract;
use crate::mirror::run_mirror;
use crate::page::Page;
use crate::progress::ScrapeProgressEvent;
use crate::session::Session;
use crate::traverse::Engine;

/// Close the scrape row for `result` and hand `result` back.
async fn finalize(session: &mut Session, result: Result<()>) -> Result<ScrapeCounters> {
    let (status, text) = match &result {
        Ok(()) => (ScrapeStatus::Completed, None),
        Err(e) => (ScrapeStatus::Failed, Some(format!("{:#}", e))),
    };
    let counters = match session.tracker.end_scrape(status, text.as_deref()).await {
        Ok(c) => c,
        Err(end_err) => {
            // Keep the run's own error when both fail.
            return Err(result.err().unwrap_or(end_err));
        }
    };
    session.report(ScrapeProgressEvent::Finished {
        source: session.settings.source.clone(),
        status,
        counters,
    });
    result.map(|()| counters)
}

/// Full scrape of `plan`. Browser plans launch Chromium.
pub async fn run_scrape(session: &mut Session, plan: &Plan) -> Result<ScrapeCounters> {
    match plan {
        Plan::Mirror(mirror) => {
            session.tracker.start_scrape().await?;
            let result = run_mirror(session, mirror).await;
            finalize(session, result).await
        }
        Plan::Browser(actions) => browser_scrape(session, actions).await,
    }
}

/// Browser scrape over a caller-supplied page.
pub async fn scrape_with_page(
    session: &mut Session,
    actions: &ActionSet,
    page: Arc<dyn Page>,
) -> Result<ScrapeCounters> {
    session.tracker.start_scrape().await?;
    let result = Engine::new(session, actions, page).run().await;
    finalize(session, result).await
}

/// Re-run extraction over stored content inside its own scrape row.
pub async fn run_re_extract(session: &mut Session, plan: &Plan) -> Result<ScrapeCounters> {
    session.tracker.start_scrape().await?;
    let result = re_extract(session, plan).await;
    finalize(session, result).await
}

/// Snapshot test run: browser `test_urls` or mirror `test_files`.
pub async fn run_test(session: &mut Session, plan: &Plan) -> Result<ScrapeCounters> {
    if !session.settings.test_dir.is_dir() {
        return Err(FatalError::NoTestDir.into());
    }
    match plan {
        Plan::Mirror(mirror) => {
            run_mirror(session, mirror).await?;
        }
        Plan::Browser(actions) => browser_test(session, actions).await?,
    }
    Ok(session.tracker.counters())
}

/// Visit every extracting action's test URLs on `page`.
pub async fn test_with_page(
    session: &mut Session,
    actions: &ActionSet,
    page: Arc<dyn Page>,
) -> Result<()> {
    let mut engine = Engine::new(session, actions, page);
    for (name, action) in actions.iter() {
        let Some(hooks) = &action.extract else {
            continue;
        };
        if action.test_urls.is_empty() {
            tracing::error!(action = name, "No test URLs defined, skipping");
            continue;
        }
        for url in &action.test_urls {
            tracing::info!(action = name, url = %url, "Testing");
            match engine.extract_url(name, hooks, url).await {
                Ok(_) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    tracing::error!(action = name, url = %url, error = %format!("{:#}", e), "Test URL failed")
                }
            }
        }
    }
    Ok(())
}

#[cfg(feature = "browser")]
async fn launch(session: &Session) -> Result<Arc<crate::browser::ChromiumPage>> {
    let page = crate::browser::ChromiumPage::launch(
        session.settings.timeout,
        session.settings.debug,
    )
    .await?;
    Ok(Arc::new(page))
}

/// Shut the browser down once the engine has let go of it.
#[cfg(feature = "browser")]
async fn close(page: Arc<crate::browser::ChromiumPage>) {
    match Arc::try_unwrap(page) {
        Ok(page) => {
            if let Err(e) = page.close().await {
                tracing::warn!(error = %e, "Failed to close browser");
            }
        }
        Err(_) => tracing::warn!("Browser still in use, leaving it to exit with the process"),
    }
}

#[cfg(feature = "browser")]
async fn browser_scrape(session: &mut Session, actions: &ActionSet) -> Result<ScrapeCounters> {
    let page = launch(session).await?;
    let result = scrape_with_page(session, actions, page.clone()).await;
    close(page).await;
    result
}

#[cfg(feature = "browser")]
async fn browser_test(session: &mut Session, actions: &ActionSet) -> Result<()> {
    let page = launch(session).await?;
    let result = test_with_page(session, actions, page.clone()).await;
    close(page).await;
    result
}

#[cfg(not(feature = "browser"))]
async fn browser_scrape(_session: &mut Session, _actions: &ActionSet) -> Result<ScrapeCounters> {
    anyhow::bail!(NO_BROWSER)
}

#[cfg(not(feature = "browser"))]
async fn browser_test(_session: &mut Session, _actions: &ActionSet) -> Result<()> {
    anyhow::bail!(NO_BROWSER)
}

#[cfg(not(feature = "browser"))]
const NO_BROWSER: &str = "Browser actions need the `browser` feature; this build only runs [mirror] files.";

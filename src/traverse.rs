//! Browser traversal engine.
//!
//! Walks the action graph from `start` over a single [`Page`]:
//!
//! ```text
//! run_action(name):
//!     init            once per action name, retried
//!     extract         capture page, hand to handle_extract
//!       or wait       for the document to load
//!     visit           ClickVisit or custom; descend() recurses + undoes
//!       or visit_all  click each link, recurse, undo, re-query the list
//!     next            loop on the same action while more pages exist
//! ```
//!
//! Navigation steps get [`ATTEMPTS`] tries separated by the configured
//! delay. A failing branch is logged and skipped; a failure of `start` or a
//! [`FatalError`] ends the run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use playscrape_core::identity::content_hash;

use crate::actions::{
    ActionSet, ExtractHooks, Init, LinkSource, NextPage, Paginate, PageRoutine, ShouldRevisit,
    Traversal, VisitContext, START_ACTION,
};
use crate::error::{is_fatal, FatalError};
use crate::extract::{handle_extract, Capture};
use crate::page::{cookie_header, Page};
use crate::progress::ScrapeProgressEvent;
use crate::session::Session;

/// Total tries for one navigation step.
pub const ATTEMPTS: usize = 3;

/// Run `op` up to [`ATTEMPTS`] times, sleeping `delay` between tries.
/// Fatal errors are returned immediately.
pub async fn retry<T, F, Fut>(delay: Duration, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) if attempt >= ATTEMPTS => {
                return Err(e.context(format!("{} failed after {} attempts", what, attempt)))
            }
            Err(e) => {
                tracing::warn!(attempt, error = %format!("{:#}", e), "{} failed, retrying", what);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Read everything extraction needs from the current document.
pub async fn capture(page: &dyn Page) -> Result<Capture> {
    page.wait_for_load().await?;
    Ok(Capture {
        url: page.url().await?,
        content: page.content().await?,
        cookies: cookie_header(&page.cookies().await?),
    })
}

/// Absolute form of a link as the browser would follow it.
fn resolve_href(base: &str, href: &str) -> String {
    url::Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

pub struct Engine<'s> {
    session: &'s mut Session,
    actions: &'s ActionSet,
    page: Arc<dyn Page>,
    initialized: HashSet<String>,
}

impl<'s> Engine<'s> {
    pub fn new(session: &'s mut Session, actions: &'s ActionSet, page: Arc<dyn Page>) -> Self {
        Self {
            session,
            actions,
            page,
            initialized: HashSet::new(),
        }
    }

    fn delay(&self) -> Duration {
        self.session.settings.delay
    }

    /// Walk the graph from `start`.
    pub async fn run(&mut self) -> Result<()> {
        self.run_action(START_ACTION).await
    }

    /// Open `url` and extract it with `action`'s hooks, without traversing.
    pub async fn extract_url(&mut self, action: &str, hooks: &ExtractHooks, url: &str) -> Result<bool> {
        let page = self.page.clone();
        let p: &dyn Page = &*page;
        self.session.pause().await;
        retry(self.delay(), "goto", || p.goto(url))
            .await
            .with_context(|| format!("Failed to open {}", url))?;
        let captured = retry(self.delay(), "read page", || capture(p)).await?;
        handle_extract(self.session, action, hooks, &captured, None).await
    }

    /// Run one action. Errors below the root are logged and swallowed
    /// unless fatal.
    pub fn run_action<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.execute(name).await {
                Ok(()) => Ok(()),
                Err(e) if is_fatal(&e) || name == START_ACTION => Err(e),
                Err(e) => {
                    tracing::error!(action = name, error = %format!("{:#}", e), "Action failed, skipping branch");
                    Ok(())
                }
            }
        })
    }

    async fn execute(&mut self, name: &str) -> Result<()> {
        let actions = self.actions;
        let action = actions.get(name)?;
        tracing::info!(action = name, "Running action");
        self.session.report(ScrapeProgressEvent::Action {
            name: name.to_string(),
        });

        self.init(name, action.init.as_ref()).await?;

        loop {
            let page = self.page.clone();
            let p: &dyn Page = &*page;

            match &action.extract {
                Some(hooks) => {
                    let captured = retry(self.delay(), "read page", || capture(p)).await?;
                    handle_extract(self.session, name, hooks, &captured, None).await?;
                }
                None => p.wait_for_load().await?,
            }

            match &action.traversal {
                Traversal::None => {}
                Traversal::Visit { visit, undo } => {
                    let mut ctx = Descent {
                        engine: self,
                        parent: name,
                        undo: undo.clone(),
                        page: page.clone(),
                    };
                    if let Err(e) = visit.visit(&mut ctx).await {
                        if is_fatal(&e) {
                            return Err(e);
                        }
                        tracing::warn!(action = name, error = %format!("{:#}", e), "Visit failed, skipping");
                    }
                }
                Traversal::VisitAll {
                    links,
                    should_revisit,
                    undo,
                } => {
                    self.visit_all(name, links.as_ref(), should_revisit.as_deref(), undo.as_ref())
                        .await?;
                }
            }

            match &action.next {
                Some(next) if self.advance(name, next.as_ref()).await? => continue,
                _ => break,
            }
        }
        Ok(())
    }

    async fn init(&mut self, name: &str, init: Option<&Init>) -> Result<()> {
        let Some(init) = init else {
            return Ok(());
        };
        if !self.initialized.insert(name.to_string()) {
            return Ok(());
        }
        let page = self.page.clone();
        let p: &dyn Page = &*page;
        self.session.pause().await;
        match init {
            Init::Url(url) => retry(self.delay(), "init", || p.goto(url))
                .await
                .with_context(|| format!("Failed to open {}", url)),
            Init::Routine(routine) => retry(self.delay(), "init", || routine.run(p)).await,
        }
    }

    async fn visit_all(
        &mut self,
        parent: &str,
        links: &dyn LinkSource,
        should_revisit: Option<&dyn ShouldRevisit>,
        undo: Option<&Arc<dyn PageRoutine>>,
    ) -> Result<()> {
        let page = self.page.clone();
        let p: &dyn Page = &*page;
        let delay = self.delay();

        let target = retry(delay, "list links", || links.links(p)).await?;
        if !self.actions.contains(&target.action) {
            return Err(FatalError::UnknownAction(target.action).into());
        }
        let sel = target.selector.as_str();

        let mut index = 0;
        loop {
            let count = retry(delay, "count links", || p.count(sel)).await?;
            if index >= count {
                break;
            }

            if let Some(check) = should_revisit {
                let href = retry(delay, "read link", || p.attribute(sel, index, "href")).await?;
                if let Some(href) = href {
                    let base = retry(delay, "read url", || p.url()).await?;
                    let href = resolve_href(&base, &href);
                    if let Some(stored) = self.session.store.get_record(&content_hash(&href)).await? {
                        if !check.should_revisit(&href, &stored.extracted)? {
                            tracing::debug!(href = %href, "Already stored, not revisiting");
                            index += 1;
                            continue;
                        }
                    }
                }
            }

            self.session.pause().await;
            if let Err(e) = retry(delay, "click link", || p.click(sel, index)).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                tracing::warn!(selector = sel, index, error = %format!("{:#}", e), "Skipping link");
                index += 1;
                continue;
            }

            self.run_action(&target.action).await?;
            self.undo(parent, undo).await?;

            let after = retry(delay, "count links", || p.count(sel)).await?;
            if after >= count {
                index += 1;
            }
        }
        Ok(())
    }

    /// Undo a descent from `parent`: the custom routine if any, otherwise
    /// history back unless `parent` is the root.
    async fn undo(&mut self, parent: &str, custom: Option<&Arc<dyn PageRoutine>>) -> Result<()> {
        let page = self.page.clone();
        let p: &dyn Page = &*page;
        match custom {
            Some(routine) => {
                self.session.pause().await;
                retry(self.delay(), "undo", || routine.run(p)).await
            }
            None if parent == START_ACTION => Ok(()),
            None => {
                self.session.pause().await;
                retry(self.delay(), "back", || p.back()).await
            }
        }
    }

    /// Move to the next page. Returns whether the action should run again.
    async fn advance(&mut self, name: &str, next: &dyn Paginate) -> Result<bool> {
        let page = self.page.clone();
        let p: &dyn Page = &*page;
        let delay = self.delay();

        let step = match retry(delay, "next", || next.next(p)).await {
            Ok(step) => step,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(action = name, error = %format!("{:#}", e), "Pagination failed, stopping");
                return Ok(false);
            }
        };

        match step {
            NextPage::Done => Ok(false),
            NextPage::More => {
                self.session.pause().await;
                Ok(true)
            }
            NextPage::Click(sel) => {
                match retry(delay, "count next", || p.count(&sel)).await {
                    Ok(0) => return Ok(false),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(action = name, error = %format!("{:#}", e), "Pagination failed, stopping");
                        return Ok(false);
                    }
                }
                self.session.pause().await;
                if let Err(e) = retry(delay, "click next", || p.click(&sel, 0)).await {
                    tracing::warn!(action = name, error = %format!("{:#}", e), "Pagination failed, stopping");
                    return Ok(false);
                }
                tracing::info!(action = name, "Next page");
                Ok(true)
            }
        }
    }
}

/// [`VisitContext`] handed to a `visit` hook.
struct Descent<'e, 's> {
    engine: &'e mut Engine<'s>,
    parent: &'e str,
    undo: Option<Arc<dyn PageRoutine>>,
    page: Arc<dyn Page>,
}

#[async_trait]
impl VisitContext for Descent<'_, '_> {
    fn page(&self) -> &dyn Page {
        &*self.page
    }

    async fn click(&mut self, selector: &str, index: usize) -> Result<()> {
        let page = self.page.clone();
        let p: &dyn Page = &*page;
        self.engine.session.pause().await;
        retry(self.engine.delay(), "click", || p.click(selector, index)).await
    }

    async fn descend(&mut self, action: &str) -> Result<()> {
        if !self.engine.actions.contains(action) {
            return Err(FatalError::UnknownAction(action.to_string()).into());
        }
        self.engine.session.pause().await;
        self.engine.run_action(action).await?;
        self.engine.undo(self.parent, self.undo.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hrefs_resolve_against_the_page() {
        let base = "https://site.test/list?page=2";
        assert_eq!(resolve_href(base, "/item/1"), "https://site.test/item/1");
        assert_eq!(resolve_href(base, "item/2"), "https://site.test/item/2");
        assert_eq!(
            resolve_href(base, "https://other.test/x"),
            "https://other.test/x"
        );
        assert_eq!(resolve_href("about:blank", "/item/1"), "/item/1");
    }

    #[tokio::test]
    async fn retry_gives_three_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(Duration::ZERO, "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("flaky")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_stops_on_success_and_on_fatal() {
        let calls = AtomicUsize::new(0);
        let value = retry(Duration::ZERO, "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first try fails")
            }
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicUsize::new(0);
        let err = retry(Duration::ZERO, "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(FatalError::NoScrapeRunning.into())
        })
        .await
        .unwrap_err();
        assert!(is_fatal(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

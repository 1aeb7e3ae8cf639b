//! Chromium implementation of [`Page`].
//!
//! One browser process and one tab per run. Every CDP call is bounded by
//! the run's timeout.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::page::{Cookie, Page};

/// Resolves once the document is interactive, or after 10s regardless.
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

pub struct ChromiumPage {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    page: chromiumoxide::Page,
    timeout: Duration,
}

impl ChromiumPage {
    /// Start Chromium and open a blank tab. `visible` shows the window.
    pub async fn launch(timeout: Duration, visible: bool) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .request_timeout(timeout);
        if visible {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser tab")?;

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            page,
            timeout,
        })
    }

    /// Close the browser and stop the event loop.
    pub async fn close(self) -> Result<()> {
        let mut browser = self.browser.into_inner();
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        self.handler.abort();
        Ok(())
    }

    async fn bounded<T, E, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Into::into).with_context(|| format!("{} failed", what)),
            Err(_) => Err(anyhow!("{} timed out after {:?}", what, self.timeout)),
        }
    }

    async fn wait_ready(&self) -> Result<()> {
        let result = self
            .bounded("wait for load", self.page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()))
            .await?;
        let state: String = result.into_value().unwrap_or_else(|_| "unknown".to_string());
        debug!("Page ready state: {}", state);
        Ok(())
    }

    async fn element(&self, selector: &str, index: usize) -> Result<chromiumoxide::Element> {
        let elements = self
            .bounded("find elements", self.page.find_elements(selector))
            .await?;
        elements
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow!("No element {} for selector '{}'", index, selector))
    }
}

#[async_trait]
impl Page for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<()> {
        debug!(url, "goto");
        self.bounded("goto", self.page.goto(url)).await?;
        self.wait_ready().await
    }

    async fn back(&self) -> Result<()> {
        self.bounded("back", self.page.evaluate("window.history.back()".to_string()))
            .await?;
        self.bounded("back", self.page.wait_for_navigation()).await?;
        self.wait_ready().await
    }

    async fn url(&self) -> Result<String> {
        Ok(self.bounded("url", self.page.url()).await?.unwrap_or_default())
    }

    async fn content(&self) -> Result<String> {
        self.bounded("content", self.page.content()).await
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let cookies = self.bounded("cookies", self.page.get_cookies()).await?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
            })
            .collect())
    }

    async fn wait_for_load(&self) -> Result<()> {
        self.wait_ready().await
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let script = format!(
            "document.querySelectorAll({}).length",
            serde_json::to_string(selector)?
        );
        let result = self.bounded("count", self.page.evaluate(script)).await?;
        result
            .into_value::<usize>()
            .map_err(|e| anyhow!("Bad element count for '{}': {}", selector, e))
    }

    async fn click(&self, selector: &str, index: usize) -> Result<()> {
        let element = self.element(selector, index).await?;
        self.bounded("click", element.click()).await?;
        self.wait_ready().await
    }

    async fn attribute(&self, selector: &str, index: usize, name: &str) -> Result<Option<String>> {
        let element = self.element(selector, index).await?;
        self.bounded("attribute", element.attribute(name)).await
    }
}

//! Per-run context.
//!
//! One [`Session`] is created per command and passed by `&mut` through the
//! traversal and extraction code. It owns everything a run mutates (the
//! tracker) and everything it shares (store, image pipeline, progress).

use anyhow::{Context, Result};
use std::sync::Arc;

use playscrape_core::store::Store;

use crate::config::{RunMode, Settings};
use crate::images::ImagePipeline;
use crate::object_store::Storage;
use crate::progress::{NoProgress, ProgressReporter, ScrapeProgressEvent};
use crate::tracker::RunTracker;

pub struct Session {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub tracker: RunTracker,
    pub images: ImagePipeline,
    progress: Box<dyn ProgressReporter>,
}

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("playscrape/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

impl Session {
    /// Session with the storage backend chosen by `settings`. Dry runs and
    /// test runs never store images, so they always get local storage.
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        progress: Box<dyn ProgressReporter>,
    ) -> Result<Self> {
        let client = http_client()?;
        let storage = if settings.mode == RunMode::Scrape {
            Storage::from_settings(&settings, client.clone())?
        } else {
            Storage::Local {
                dir: settings.image_dir.clone(),
            }
        };
        Ok(Self::with_storage(settings, store, storage, client, progress))
    }

    pub fn with_storage(
        settings: Settings,
        store: Arc<dyn Store>,
        storage: Storage,
        client: reqwest::Client,
        progress: Box<dyn ProgressReporter>,
    ) -> Self {
        let tracker = RunTracker::new(store.clone(), settings.mode, settings.source.clone());
        let images = ImagePipeline::new(
            client,
            storage,
            settings.format,
            settings.overwrite,
            settings.timeout,
        );
        Self {
            settings,
            store,
            tracker,
            images,
            progress,
        }
    }

    /// Local-storage session without progress output, for library use.
    pub fn local(settings: Settings, store: Arc<dyn Store>) -> Self {
        let storage = Storage::Local {
            dir: settings.image_dir.clone(),
        };
        Self::with_storage(
            settings,
            store,
            storage,
            reqwest::Client::new(),
            Box::new(NoProgress),
        )
    }

    pub fn mode(&self) -> RunMode {
        self.settings.mode
    }

    /// Wait the configured inter-step delay.
    pub async fn pause(&self) {
        if !self.settings.delay.is_zero() {
            tokio::time::sleep(self.settings.delay).await;
        }
    }

    pub fn report(&self, event: ScrapeProgressEvent) {
        self.progress.report(event);
    }
}

//! # playscrape
//!
//! A declarative scraper. An action file describes how to walk a site in a
//! headless browser (or a directory of mirrored HTML files), how to pull
//! structured records out of each page, and where the images are. Records
//! are reconciled against a SQLite store so re-running a scrape is
//! idempotent: unchanged pages are counted, changed ones are diffed and
//! updated, and images are fetched once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Action file │──▶│  Traversal  │──▶│  Extraction  │──▶│  SQLite  │
//! │ TOML + Lua  │   │ browser or  │   │ reconcile +  │   │ records  │
//! └─────────────┘   │   mirror    │   │   images     │   │ scrapes  │
//!                   └─────────────┘   └──────┬───────┘   └──────────┘
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │ local dir/S3 │
//!                                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! playscrape init gallery               # scaffold gallery.toml + gallery.lua
//! playscrape scrape gallery.toml --dry-run
//! playscrape scrape gallery.toml
//! playscrape test gallery.toml          # snapshot-compare test pages
//! playscrape export gallery.toml --stdout
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Action-file parsing and resolved settings |
//! | [`actions`] | Action model and declarative hooks |
//! | [`lua_runtime`] | Sandboxed Lua hooks |
//! | [`dom`] | CSS query facade |
//! | [`page`] | Navigable page abstraction |
//! | [`traverse`] | Browser traversal engine |
//! | [`mirror`] | Mirrored-file enumeration |
//! | [`extract`] | Extraction and reconciliation |
//! | [`images`] | Image identity, metadata, download |
//! | [`object_store`] | Local and S3 image storage |
//! | [`tracker`] | Scrape run bookkeeping |
//! | [`sqlite_store`] | SQLite [`Store`](playscrape_core::store::Store) |
//! | [`scrape`] | Run orchestration |

pub mod actions;
#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod dom;
pub mod error;
pub mod export;
pub mod extract;
pub mod images;
pub mod lua_runtime;
pub mod migrate;
pub mod mirror;
pub mod object_store;
pub mod page;
pub mod progress;
pub mod scaffold;
pub mod scrape;
pub mod session;
pub mod snapshot;
pub mod sqlite_store;
pub mod stats;
pub mod tracker;
pub mod traverse;

pub use playscrape_core as core;

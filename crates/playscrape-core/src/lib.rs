//! # playscrape core
//!
//! Runtime-agnostic pieces of playscrape: the persisted data models,
//! content-hash identity, structural payload diffing, and the [`store::Store`]
//! abstraction with an in-memory implementation.
//!
//! This crate has no tokio, sqlx, or filesystem dependencies; the SQLite
//! backend and the scraping engine live in the `playscrape` crate.

pub mod diff;
pub mod identity;
pub mod models;
pub mod store;

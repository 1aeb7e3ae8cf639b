//! Fatal error kinds.
//!
//! Most failures during a scrape are local: they become a failed
//! scrape-record or a skipped branch and the run continues. The variants
//! here are the exceptions that must reach `main` and end the process with
//! a non-zero status. They travel inside [`anyhow::Error`] and are detected
//! with [`is_fatal`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("scrape already in progress")]
    ScrapeAlreadyRunning,

    #[error("no current scrape to end")]
    NoScrapeRunning,

    #[error("scrape has not started yet")]
    ScrapeNotStarted,

    #[error("no current record scrape to end")]
    NoRecordScrapeOpen,

    #[error("snapshot mismatch for record {id}")]
    SnapshotMismatch { id: String },

    #[error("no test directory specified")]
    NoTestDir,
}

/// True when `err` (or anything in its context chain) is a [`FatalError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<FatalError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn fatal_survives_context() {
        let err: anyhow::Result<()> = Err(FatalError::NoRecordScrapeOpen.into());
        let wrapped = err.context("while finishing record").unwrap_err();
        assert!(is_fatal(&wrapped));
    }

    #[test]
    fn ordinary_errors_are_not_fatal() {
        let err = anyhow::anyhow!("timeout waiting for selector");
        assert!(!is_fatal(&err));
    }
}

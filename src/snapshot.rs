//! Test-mode snapshot fixtures.
//!
//! In `playscrape test`, every extracted record is compared against
//! `<test_dir>/<id>.json` and its image URL list against
//! `<test_dir>/<id>.images.json`. The fixture is always rewritten with the
//! fresh value. A mismatch prints the diff and, unless overwriting, is a
//! [`FatalError::SnapshotMismatch`].

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use playscrape_core::diff::diff_string;

use crate::error::FatalError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Created,
    Matched,
    Overwritten { diff: String },
}

/// Compare `value` against the fixture `<dir>/<name>.json`.
pub fn check_snapshot(
    dir: &Path,
    name: &str,
    value: &Value,
    overwrite: bool,
) -> Result<SnapshotOutcome> {
    let path = dir.join(format!("{}.json", name));

    let previous = if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        Some(
            serde_json::from_str::<Value>(&text)
                .with_context(|| format!("Snapshot {} is not valid JSON", path.display()))?,
        )
    } else {
        println!("Snapshot file not found, creating.");
        None
    };

    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    std::fs::write(&path, body)
        .with_context(|| format!("Failed to write snapshot {}", path.display()))?;

    let Some(previous) = previous else {
        return Ok(SnapshotOutcome::Created);
    };
    match diff_string(&previous, value) {
        None => Ok(SnapshotOutcome::Matched),
        Some(diff) => {
            println!("Data mismatch for: {}", name);
            println!("{}", diff);
            if overwrite {
                Ok(SnapshotOutcome::Overwritten { diff })
            } else {
                Err(FatalError::SnapshotMismatch {
                    id: name.to_string(),
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_fatal;
    use serde_json::json;

    #[test]
    fn create_match_and_mismatch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let v1 = json!({"title": "Starry Night"});
        let v2 = json!({"title": "Irises"});

        assert_eq!(
            check_snapshot(tmp.path(), "abc", &v1, false).unwrap(),
            SnapshotOutcome::Created
        );
        assert_eq!(
            check_snapshot(tmp.path(), "abc", &v1, false).unwrap(),
            SnapshotOutcome::Matched
        );

        let err = check_snapshot(tmp.path(), "abc", &v2, false).unwrap_err();
        assert!(is_fatal(&err));
        // The fixture now holds the fresh value.
        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(tmp.path().join("abc.json")).unwrap())
                .unwrap();
        assert_eq!(stored, v2);

        match check_snapshot(tmp.path(), "abc", &v1, true).unwrap() {
            SnapshotOutcome::Overwritten { diff } => assert!(diff.contains("title")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

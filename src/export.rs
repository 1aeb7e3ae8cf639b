//! Flattened JSON export of stored records.
//!
//! Each record becomes `{id, url, ...extracted}`: the extracted payload is
//! spread over the stored identity, so an extracted `id` or `url` wins.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;

use playscrape_core::models::Record;
use playscrape_core::store::Store;

pub fn flatten(record: &Record) -> Value {
    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(record.id.clone()));
    out.insert("url".to_string(), Value::String(record.url.clone()));
    if let Value::Object(fields) = &record.extracted {
        for (k, v) in fields {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// Export every stored record as a JSON array.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(store: &dyn Store, output: Option<&Path>) -> Result<usize> {
    let records = store.all_records().await?;
    let items: Vec<Value> = records.iter().map(flatten).collect();
    let json = serde_json::to_string_pretty(&items)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported {} records to {}", items.len(), path.display());
        }
        None => {
            println!("{}", json);
        }
    }
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use playscrape_core::models::RecordWrite;
    use playscrape_core::store::memory::InMemoryStore;
    use serde_json::json;

    fn record(id: &str, extracted: Value) -> Record {
        Record {
            id: id.to_string(),
            source: "s".to_string(),
            url: format!("https://example.com/{}", id),
            action: "start".to_string(),
            content: String::new(),
            cookies: String::new(),
            extracted,
            created_at: 1,
            updated_at: 1,
            scraped_at: 1,
        }
    }

    #[test]
    fn extracted_fields_override_identity() {
        let flat = flatten(&record("abc", json!({"title": "T", "url": "https://x"})));
        assert_eq!(flat, json!({"id": "abc", "url": "https://x", "title": "T"}));
    }

    #[tokio::test]
    async fn writes_array_to_file() {
        let store = InMemoryStore::new();
        for id in ["a", "b"] {
            store
                .commit_record(&RecordWrite {
                    record: record(id, json!({"n": id})),
                    content_changed: true,
                    downloads: vec![],
                    replaces: None,
                })
                .await
                .unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/export.json");
        assert_eq!(run_export(&store, Some(&path)).await.unwrap(), 2);

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.as_array().unwrap().len(), 2);
        assert_eq!(written[0]["n"], "a");
        assert_eq!(written[1]["url"], "https://example.com/b");
    }
}

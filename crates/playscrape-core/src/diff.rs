//! Structural diff between two extracted payloads.
//!
//! Objects are compared key by key and arrays index by index. The rendered
//! form is one line per change:
//!
//! ```text
//! ~ title: "Old" -> "New"
//! + tags[2]: "sale"
//! - price
//! ```

use std::fmt;

use serde_json::Value;

/// One difference at a JSON path.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added { path: String, value: Value },
    Removed { path: String, value: Value },
    Changed { path: String, old: Value, new: Value },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Added { path, value } => write!(f, "+ {}: {}", path, value),
            Change::Removed { path, value } => write!(f, "- {}: {}", path, value),
            Change::Changed { path, old, new } => write!(f, "~ {}: {} -> {}", path, old, new),
        }
    }
}

/// All changes needed to turn `old` into `new`. Empty when they are equal.
pub fn diff_values(old: &Value, new: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    walk("", old, new, &mut changes);
    changes
}

/// Render changes one per line; empty string when there are none.
pub fn render(changes: &[Change]) -> String {
    changes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convenience: rendered diff, or `None` when the values are equal.
pub fn diff_string(old: &Value, new: &Value) -> Option<String> {
    let changes = diff_values(old, new);
    if changes.is_empty() {
        None
    } else {
        Some(render(&changes))
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn walk(path: &str, old: &Value, new: &Value, out: &mut Vec<Change>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old_v) in a {
                let p = child_path(path, key);
                match b.get(key) {
                    Some(new_v) => walk(&p, old_v, new_v, out),
                    None => out.push(Change::Removed {
                        path: p,
                        value: old_v.clone(),
                    }),
                }
            }
            for (key, new_v) in b {
                if !a.contains_key(key) {
                    out.push(Change::Added {
                        path: child_path(path, key),
                        value: new_v.clone(),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let p = format!("{}[{}]", path, i);
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => walk(&p, x, y, out),
                    (Some(x), None) => out.push(Change::Removed {
                        path: p,
                        value: x.clone(),
                    }),
                    (None, Some(y)) => out.push(Change::Added {
                        path: p,
                        value: y.clone(),
                    }),
                    (None, None) => {}
                }
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(Change::Changed {
            path: display_path(path),
            old: a.clone(),
            new: b.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_values_have_no_diff() {
        let v = json!({"a": 1, "b": [1, 2, {"c": "x"}]});
        assert!(diff_values(&v, &v.clone()).is_empty());
        assert_eq!(diff_string(&v, &v), None);
    }

    #[test]
    fn key_order_is_ignored() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert!(diff_values(&a, &b).is_empty());
    }

    #[test]
    fn nested_changes_are_reported_with_paths() {
        let old = json!({"title": "Old", "tags": ["a"], "price": 3});
        let new = json!({"title": "New", "tags": ["a", "b"], "stock": true});
        let rendered = render(&diff_values(&old, &new));
        let mut lines: Vec<&str> = rendered.lines().collect();
        lines.sort();
        assert_eq!(
            lines,
            vec![
                "+ stock: true",
                "+ tags[1]: \"b\"",
                "- price: 3",
                "~ title: \"Old\" -> \"New\"",
            ]
        );
    }

    #[test]
    fn root_type_change_uses_dollar_path() {
        let changes = diff_values(&json!(1), &json!("1"));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to_string(), "~ $: 1 -> \"1\"");
    }
}

//! Navigable page abstraction.
//!
//! The traversal engine drives exactly one [`Page`] per run. Implementations
//! wrap a real browser tab ([`crate::browser::ChromiumPage`]) or, in tests, a
//! scripted fake. Every method takes `&self`; implementations synchronise
//! internally, which lets the engine hold a shared handle while a site
//! routine also uses it.
//!
//! Elements are addressed as `(selector, index)` pairs rather than handles,
//! so a list can be re-queried between clicks.

use anyhow::Result;
use async_trait::async_trait;

/// One browser cookie as captured from the page's context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate to `url` and wait for the load to settle.
    async fn goto(&self, url: &str) -> Result<()>;

    /// History back.
    async fn back(&self) -> Result<()>;

    /// Current document URL.
    async fn url(&self) -> Result<String>;

    /// Serialized HTML of the current document.
    async fn content(&self) -> Result<String>;

    async fn cookies(&self) -> Result<Vec<Cookie>>;

    /// Wait until the DOM content of the current document has loaded.
    async fn wait_for_load(&self) -> Result<()>;

    /// Number of elements currently matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize>;

    /// Click the `index`-th element matching `selector`.
    async fn click(&self, selector: &str, index: usize) -> Result<()>;

    /// Attribute of the `index`-th element matching `selector`.
    async fn attribute(&self, selector: &str, index: usize, name: &str) -> Result<Option<String>>;
}

/// `name=value` pairs, URI-component encoded and joined by `"; "`: the
/// form sent back as a `Cookie` header when fetching images.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", urlencoding::encode(&c.name), urlencoding::encode(&c.value)))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_encodes_components() {
        let cookies = vec![
            Cookie {
                name: "session".to_string(),
                value: "a b;c".to_string(),
            },
            Cookie {
                name: "lang".to_string(),
                value: "en".to_string(),
            },
        ];
        assert_eq!(cookie_header(&cookies), "session=a%20b%3Bc; lang=en");
        assert_eq!(cookie_header(&[]), "");
    }
}

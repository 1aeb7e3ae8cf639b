//! DOM query facade handed to extraction hooks.
//!
//! Wraps a parsed [`scraper::Html`] document with four lookups: `query`,
//! `query_all`, `query_text`, `query_all_text`. Expressions are CSS
//! selectors with an optional `@attr` suffix that reads an attribute
//! instead of the element text:
//!
//! | Expression | Yields |
//! |------------|--------|
//! | `h1.title` | trimmed text of the first `h1.title` |
//! | `img.main@src` | `src` attribute of the first `img.main` |
//! | `a.next@href` | `href` attribute |
//!
//! `scraper::Html` is not `Send`, so a `DomQuery` is built, used, and
//! dropped inside synchronous code; never hold one across an `.await`.

use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};

/// A parsed `selector@attr` expression.
#[derive(Debug, Clone)]
pub struct Selection {
    css: Selector,
    attr: Option<String>,
}

impl Selection {
    pub fn parse(expr: &str) -> Result<Self> {
        let (css, attr) = split_attr(expr);
        let selector = Selector::parse(css)
            .map_err(|e| anyhow!("invalid selector '{}': {:?}", css, e))?;
        Ok(Self {
            css: selector,
            attr: attr.map(str::to_string),
        })
    }

    /// Value of this selection for an already-matched element.
    pub fn value_of(&self, el: ElementRef<'_>) -> Option<String> {
        match &self.attr {
            Some(name) => el.value().attr(name).map(str::to_string),
            None => Some(element_text(el)),
        }
    }

    /// First value under `root`.
    pub fn first_in(&self, root: ElementRef<'_>) -> Option<String> {
        root.select(&self.css).next().and_then(|el| self.value_of(el))
    }

    /// Every value under `root`.
    pub fn all_in(&self, root: ElementRef<'_>) -> Vec<String> {
        root.select(&self.css)
            .filter_map(|el| self.value_of(el))
            .collect()
    }
}

/// Split a trailing `@attr` off an expression. `@` never appears in CSS
/// outside quoted strings, so only a bare identifier after the last `@`
/// counts.
fn split_attr(expr: &str) -> (&str, Option<&str>) {
    if let Some(pos) = expr.rfind('@') {
        let attr = &expr[pos + 1..];
        let is_ident = !attr.is_empty()
            && attr
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':');
        if is_ident && pos > 0 {
            return (expr[..pos].trim_end(), Some(attr));
        }
    }
    (expr, None)
}

/// Element text with surrounding whitespace trimmed and inner runs of
/// whitespace collapsed.
pub fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Query facade over one HTML document.
pub struct DomQuery {
    html: Html,
}

impl DomQuery {
    pub fn parse(content: &str) -> Self {
        Self {
            html: Html::parse_document(content),
        }
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }

    /// First element matching the CSS part of `expr`.
    pub fn query(&self, expr: &str) -> Result<Option<ElementRef<'_>>> {
        let sel = Selection::parse(expr)?;
        Ok(self.html.select(&sel.css).next())
    }

    /// Every element matching the CSS part of `expr`.
    pub fn query_all(&self, expr: &str) -> Result<Vec<ElementRef<'_>>> {
        let sel = Selection::parse(expr)?;
        Ok(self.html.select(&sel.css).collect())
    }

    pub fn query_text(&self, expr: &str) -> Result<Option<String>> {
        let sel = Selection::parse(expr)?;
        Ok(self
            .html
            .select(&sel.css)
            .next()
            .and_then(|el| sel.value_of(el)))
    }

    pub fn query_all_text(&self, expr: &str) -> Result<Vec<String>> {
        let sel = Selection::parse(expr)?;
        Ok(self
            .html
            .select(&sel.css)
            .filter_map(|el| sel.value_of(el))
            .collect())
    }

    pub fn count(&self, expr: &str) -> Result<usize> {
        Ok(self.query_all(expr)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <h1 class="title">  Starry
             Night </h1>
          <ul><li class="tag">oil</li><li class="tag">1889</li></ul>
          <img class="main" src="/img/starry.png">
          <a class="mail" href="mailto:a@b.c">mail</a>
        </body></html>"#;

    #[test]
    fn text_is_trimmed_and_collapsed() {
        let dom = DomQuery::parse(PAGE);
        assert_eq!(dom.query_text("h1.title").unwrap().as_deref(), Some("Starry Night"));
        assert_eq!(dom.query_all_text("li.tag").unwrap(), vec!["oil", "1889"]);
    }

    #[test]
    fn attr_suffix_reads_attribute() {
        let dom = DomQuery::parse(PAGE);
        assert_eq!(
            dom.query_text("img.main@src").unwrap().as_deref(),
            Some("/img/starry.png")
        );
        assert_eq!(dom.query_text("img.main@alt").unwrap(), None);
    }

    #[test]
    fn missing_and_invalid_selectors() {
        let dom = DomQuery::parse(PAGE);
        assert!(dom.query("table").unwrap().is_none());
        assert!(dom.query_all_text("table td").unwrap().is_empty());
        assert!(dom.query_text("h1[").is_err());
        assert_eq!(dom.count("li.tag").unwrap(), 2);
    }

    #[test]
    fn at_inside_attribute_value_is_not_a_suffix() {
        assert_eq!(split_attr("a[href='x@y.z']"), ("a[href='x@y.z']", None));
        assert_eq!(split_attr("a.mail@href"), ("a.mail", Some("href")));
    }
}

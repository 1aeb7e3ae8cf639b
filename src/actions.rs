//! Action model.
//!
//! A site is described as a set of named actions rooted at `start` (browser
//! mode) or as a single mirror action over local HTML files. Each action is
//! resolved once, at load time, into the tagged types below; the traversal
//! engine never probes an action for capabilities at run time.
//!
//! Capabilities are trait objects so that the same engine runs declarative
//! TOML definitions, Lua hooks, and hand-written Rust:
//!
//! | Trait | Sync | Used for |
//! |-------|------|----------|
//! | [`Extract`] | yes | turning page HTML into candidate payloads |
//! | [`ImageUrls`] | yes | listing image URLs for one candidate |
//! | [`ShouldRevisit`] | yes | skipping `visit_all` links already stored |
//! | [`UrlFromFile`] | yes | mapping a mirrored file to its canonical URL |
//! | [`PageRoutine`] | async | custom `init` and undo navigation |
//! | [`Visit`] | async | single-branch descent |
//! | [`LinkSource`] | async | multi-branch descent target |
//! | [`Paginate`] | async | `next` pagination |
//!
//! The synchronous hooks receive a parsed [`DomQuery`], which must not
//! cross an `.await`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::{ActionFileToml, BrowserActionToml, ExtractToml, FieldToml, ImagesToml};
use crate::dom::{DomQuery, Selection};
use crate::error::FatalError;
use crate::lua_runtime::{LuaExtract, LuaHooks, LuaImages, LuaShouldRevisit, LuaUrlFromFile};
use crate::page::Page;

/// Root action of a browser action set. Never undone.
pub const START_ACTION: &str = "start";

/// Action name recorded for records produced in mirror mode.
pub const MIRROR_ACTION: &str = "mirror";

const DEFAULT_HTML_FILES: &str = "**/*.html";

/// Captured page handed to the synchronous hooks.
pub struct PageData<'a> {
    pub url: &'a str,
    pub content: &'a str,
    pub dom: &'a DomQuery,
}

// ═══════════════════════════════════════════════════════════════════════
// Hook traits
// ═══════════════════════════════════════════════════════════════════════

pub trait Extract: Send + Sync {
    /// `None`, `false`, or an empty array mean "no data".
    fn extract(&self, page: &PageData<'_>) -> Result<Option<Value>>;
}

pub trait ImageUrls: Send + Sync {
    fn image_urls(&self, page: &PageData<'_>, record: &Value) -> Result<Vec<String>>;
}

pub trait ShouldRevisit: Send + Sync {
    /// Called with a link's `href` and the payload stored under its hash.
    fn should_revisit(&self, href: &str, record: &Value) -> Result<bool>;
}

pub trait UrlFromFile: Send + Sync {
    /// `path` is relative to the mirror root.
    fn url_for(&self, path: &Path) -> Result<String>;
}

#[async_trait]
pub trait PageRoutine: Send + Sync {
    async fn run(&self, page: &dyn Page) -> Result<()>;
}

/// Handle given to a [`Visit`] while it runs.
#[async_trait]
pub trait VisitContext: Send {
    fn page(&self) -> &dyn Page;

    /// Pause, then click the `index`th match of `selector` with retries.
    async fn click(&mut self, selector: &str, index: usize) -> Result<()>;

    /// Pause, run `action` recursively, then undo the navigation.
    async fn descend(&mut self, action: &str) -> Result<()>;
}

#[async_trait]
pub trait Visit: Send + Sync {
    async fn visit(&self, ctx: &mut dyn VisitContext) -> Result<()>;
}

/// What a `visit_all` action iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub action: String,
    pub selector: String,
}

#[async_trait]
pub trait LinkSource: Send + Sync {
    async fn links(&self, page: &dyn Page) -> Result<LinkTarget>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
    Done,
    /// The hook already moved to the next page.
    More,
    /// Click the first match; zero matches means done.
    Click(String),
}

#[async_trait]
pub trait Paginate: Send + Sync {
    async fn next(&self, page: &dyn Page) -> Result<NextPage>;
}

// ═══════════════════════════════════════════════════════════════════════
// Action types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct ExtractHooks {
    pub extract: Arc<dyn Extract>,
    pub images: Option<Arc<dyn ImageUrls>>,
}

#[derive(Clone)]
pub enum Init {
    Url(String),
    Routine(Arc<dyn PageRoutine>),
}

#[derive(Clone, Default)]
pub enum Traversal {
    #[default]
    None,
    Visit {
        visit: Arc<dyn Visit>,
        undo: Option<Arc<dyn PageRoutine>>,
    },
    VisitAll {
        links: Arc<dyn LinkSource>,
        should_revisit: Option<Arc<dyn ShouldRevisit>>,
        undo: Option<Arc<dyn PageRoutine>>,
    },
}

#[derive(Clone, Default)]
pub struct Action {
    pub init: Option<Init>,
    pub extract: Option<ExtractHooks>,
    pub traversal: Traversal,
    pub next: Option<Arc<dyn Paginate>>,
    pub test_urls: Vec<String>,
}

impl Action {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init_url(mut self, url: impl Into<String>) -> Self {
        self.init = Some(Init::Url(url.into()));
        self
    }

    pub fn with_init(mut self, routine: Arc<dyn PageRoutine>) -> Self {
        self.init = Some(Init::Routine(routine));
        self
    }

    pub fn with_extract(mut self, extract: Arc<dyn Extract>) -> Self {
        self.extract = Some(ExtractHooks {
            extract,
            images: None,
        });
        self
    }

    pub fn with_hooks(mut self, hooks: ExtractHooks) -> Self {
        self.extract = Some(hooks);
        self
    }

    pub fn with_traversal(mut self, traversal: Traversal) -> Self {
        self.traversal = traversal;
        self
    }

    pub fn with_next(mut self, next: Arc<dyn Paginate>) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_test_urls(mut self, urls: Vec<String>) -> Self {
        self.test_urls = urls;
        self
    }
}

/// Browser actions keyed by name. Always contains `start`.
#[derive(Clone)]
pub struct ActionSet {
    actions: BTreeMap<String, Action>,
}

impl ActionSet {
    pub fn new(actions: BTreeMap<String, Action>) -> Result<Self> {
        if !actions.contains_key(START_ACTION) {
            bail!("No '{}' action defined.", START_ACTION);
        }
        Ok(Self { actions })
    }

    pub fn get(&self, name: &str) -> Result<&Action> {
        self.actions
            .get(name)
            .ok_or_else(|| FatalError::UnknownAction(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Action)> {
        self.actions.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Clone)]
pub struct MirrorAction {
    pub html_files: Vec<String>,
    pub test_files: Vec<String>,
    pub root: PathBuf,
    /// Without a hook the record URL is the file's relative path.
    pub url_from_file: Option<Arc<dyn UrlFromFile>>,
    pub extract: ExtractHooks,
}

impl MirrorAction {
    pub fn new(root: impl Into<PathBuf>, extract: ExtractHooks) -> Self {
        Self {
            html_files: vec![DEFAULT_HTML_FILES.to_string()],
            test_files: vec![DEFAULT_HTML_FILES.to_string()],
            root: root.into(),
            url_from_file: None,
            extract,
        }
    }
}

#[derive(Clone)]
pub enum Plan {
    Browser(ActionSet),
    Mirror(MirrorAction),
}

// ═══════════════════════════════════════════════════════════════════════
// Declarative implementations
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub expr: String,
    pub all: bool,
}

/// CSS field map. With `records` set, every match of that selector is one
/// candidate and fields are queried inside it.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    pub records: Option<String>,
    pub fields: Vec<(String, FieldSpec)>,
}

impl FieldExtractor {
    fn fields_of(&self, root: scraper::ElementRef<'_>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for (name, spec) in &self.fields {
            let sel = Selection::parse(&spec.expr)?;
            let value = if spec.all {
                Value::Array(sel.all_in(root).into_iter().map(Value::String).collect())
            } else {
                sel.first_in(root).map(Value::String).unwrap_or(Value::Null)
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

impl Extract for FieldExtractor {
    fn extract(&self, page: &PageData<'_>) -> Result<Option<Value>> {
        match &self.records {
            Some(expr) => {
                let items = page
                    .dom
                    .query_all(expr)?
                    .into_iter()
                    .map(|el| self.fields_of(el).map(Value::Object))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(Value::Array(items)))
            }
            None => {
                let fields = self.fields_of(page.dom.root())?;
                if fields.values().all(is_blank) {
                    return Ok(None);
                }
                Ok(Some(Value::Object(fields)))
            }
        }
    }
}

/// Every value of a `sel@attr` expression, resolved against the page URL.
#[derive(Debug, Clone)]
pub struct SelectorImages {
    pub expr: String,
}

impl ImageUrls for SelectorImages {
    fn image_urls(&self, page: &PageData<'_>, _record: &Value) -> Result<Vec<String>> {
        let base = url::Url::parse(page.url).ok();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for raw in page.dom.query_all_text(&self.expr)? {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let resolved = match &base {
                Some(b) => b
                    .join(raw)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| raw.to_string()),
                None => raw.to_string(),
            };
            if seen.insert(resolved.clone()) {
                out.push(resolved);
            }
        }
        Ok(out)
    }
}

/// Click the first match of `click`, then descend into `action`.
#[derive(Debug, Clone)]
pub struct ClickVisit {
    pub click: String,
    pub action: String,
}

#[async_trait]
impl Visit for ClickVisit {
    async fn visit(&self, ctx: &mut dyn VisitContext) -> Result<()> {
        ctx.click(&self.click, 0)
            .await
            .with_context(|| format!("Failed to click '{}'", self.click))?;
        ctx.descend(&self.action).await
    }
}

#[derive(Debug, Clone)]
pub struct StaticLinks {
    pub selector: String,
    pub action: String,
}

#[async_trait]
impl LinkSource for StaticLinks {
    async fn links(&self, _page: &dyn Page) -> Result<LinkTarget> {
        Ok(LinkTarget {
            action: self.action.clone(),
            selector: self.selector.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClickNext {
    pub selector: String,
}

#[async_trait]
impl Paginate for ClickNext {
    async fn next(&self, _page: &dyn Page) -> Result<NextPage> {
        Ok(NextPage::Click(self.selector.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ClickUndo {
    pub selector: String,
}

#[async_trait]
impl PageRoutine for ClickUndo {
    async fn run(&self, page: &dyn Page) -> Result<()> {
        page.click(&self.selector, 0).await
    }
}

/// Joins the file's relative path onto a base URL.
#[derive(Debug, Clone)]
pub struct BaseUrlFromFile {
    pub base: url::Url,
}

impl UrlFromFile for BaseUrlFromFile {
    fn url_for(&self, path: &Path) -> Result<String> {
        let rel = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        Ok(self
            .base
            .join(&rel)
            .with_context(|| format!("Cannot join '{}' onto {}", rel, self.base))?
            .to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Building from an action file
// ═══════════════════════════════════════════════════════════════════════

struct Builder {
    hooks: Option<Arc<LuaHooks>>,
}

impl Builder {
    fn lua(&self, function: &str, what: &str) -> Result<(Arc<LuaHooks>, String)> {
        let Some(hooks) = &self.hooks else {
            bail!(
                "{} references Lua function '{}' but options.script is not set",
                what,
                function
            );
        };
        if !hooks.has_function(function) {
            bail!("{}: Lua function scraper.{} is not defined", what, function);
        }
        Ok((hooks.clone(), function.to_string()))
    }

    fn extract(
        &self,
        what: &str,
        extract: &ExtractToml,
        images: Option<&ImagesToml>,
    ) -> Result<ExtractHooks> {
        let extract: Arc<dyn Extract> = match (&extract.lua, extract.fields.is_empty()) {
            (Some(_), false) => bail!("{}: extract sets both fields and lua", what),
            (None, true) => bail!("{}: extract needs fields or lua", what),
            (Some(function), true) => {
                let (hooks, function) = self.lua(function, what)?;
                Arc::new(LuaExtract { hooks, function })
            }
            (None, false) => {
                if let Some(records) = &extract.records {
                    check_selector(what, records)?;
                }
                let mut fields = Vec::new();
                for (name, field) in &extract.fields {
                    let (expr, all) = match field {
                        FieldToml::One(expr) => (expr.clone(), false),
                        FieldToml::All(exprs) => match exprs.as_slice() {
                            [expr] => (expr.clone(), true),
                            _ => bail!(
                                "{}: field '{}' must be a selector or a one-element list",
                                what,
                                name
                            ),
                        },
                    };
                    check_selector(what, &expr)?;
                    fields.push((name.clone(), FieldSpec { expr, all }));
                }
                Arc::new(FieldExtractor {
                    records: extract.records.clone(),
                    fields,
                })
            }
        };

        let images: Option<Arc<dyn ImageUrls>> = match images {
            None => None,
            Some(ImagesToml {
                selector: Some(_),
                lua: Some(_),
            }) => bail!("{}: images sets both selector and lua", what),
            Some(ImagesToml {
                selector: Some(expr),
                lua: None,
            }) => {
                check_selector(what, expr)?;
                Some(Arc::new(SelectorImages { expr: expr.clone() }))
            }
            Some(ImagesToml {
                selector: None,
                lua: Some(function),
            }) => {
                let (hooks, function) = self.lua(function, what)?;
                Some(Arc::new(LuaImages { hooks, function }))
            }
            Some(_) => bail!("{}: images needs selector or lua", what),
        };

        Ok(ExtractHooks { extract, images })
    }

    fn browser_action(
        &self,
        name: &str,
        t: &BrowserActionToml,
        names: &HashSet<&str>,
    ) -> Result<Action> {
        let what = format!("browser.{}", name);
        let target = |action: &str| -> Result<()> {
            if !names.contains(action) {
                bail!("{}: unknown target action '{}'", what, action);
            }
            Ok(())
        };

        let mut action = Action::new().with_test_urls(t.test_urls.clone());
        if let Some(url) = &t.init {
            action = action.with_init_url(url.clone());
        }

        match (&t.extract, &t.images) {
            (Some(ex), images) => {
                action = action.with_hooks(self.extract(&what, ex, images.as_ref())?);
            }
            (None, Some(_)) => bail!("{}: images requires extract", what),
            (None, None) => {}
        }

        let undo: Option<Arc<dyn PageRoutine>> = match &t.undo {
            Some(u) => {
                check_selector(&what, &u.click)?;
                Some(Arc::new(ClickUndo {
                    selector: u.click.clone(),
                }))
            }
            None => None,
        };

        action.traversal = match (&t.visit, &t.visit_all) {
            (Some(_), Some(_)) => bail!("{}: visit and visit_all are mutually exclusive", what),
            (Some(v), None) => {
                check_selector(&what, &v.click)?;
                target(&v.action)?;
                Traversal::Visit {
                    visit: Arc::new(ClickVisit {
                        click: v.click.clone(),
                        action: v.action.clone(),
                    }),
                    undo,
                }
            }
            (None, Some(v)) => {
                check_selector(&what, &v.links)?;
                target(&v.action)?;
                let should_revisit: Option<Arc<dyn ShouldRevisit>> = match &v.should_revisit {
                    Some(function) => {
                        let (hooks, function) = self.lua(function, &what)?;
                        Some(Arc::new(LuaShouldRevisit { hooks, function }))
                    }
                    None => None,
                };
                Traversal::VisitAll {
                    links: Arc::new(StaticLinks {
                        selector: v.links.clone(),
                        action: v.action.clone(),
                    }),
                    should_revisit,
                    undo,
                }
            }
            (None, None) => {
                if undo.is_some() {
                    bail!("{}: undo without visit or visit_all", what);
                }
                Traversal::None
            }
        };

        if let Some(n) = &t.next {
            check_selector(&what, &n.click)?;
            action = action.with_next(Arc::new(ClickNext {
                selector: n.click.clone(),
            }));
        }

        Ok(action)
    }
}

fn check_selector(what: &str, expr: &str) -> Result<()> {
    Selection::parse(expr).with_context(|| format!("{}: bad selector", what))?;
    Ok(())
}

/// Turn raw action tables into a [`Plan`].
///
/// `base` is the action file's directory; `script` is the resolved Lua
/// script path, if any.
pub fn build_plan(file: &ActionFileToml, base: &Path, script: Option<&Path>) -> Result<Plan> {
    let hooks = match script {
        Some(path) => {
            if !path.is_file() {
                bail!("Script file {} does not exist.", path.display());
            }
            Some(LuaHooks::load(path)?)
        }
        None => None,
    };
    let builder = Builder { hooks };

    if let Some(browser) = &file.browser {
        let names: HashSet<&str> = browser.keys().map(String::as_str).collect();
        let mut actions = BTreeMap::new();
        for (name, t) in browser {
            actions.insert(name.clone(), builder.browser_action(name, t, &names)?);
        }
        return Ok(Plan::Browser(ActionSet::new(actions)?));
    }

    let Some(m) = &file.mirror else {
        bail!("No actions found.");
    };
    let Some(ex) = &m.extract else {
        bail!("mirror: extract is required");
    };
    let hooks = builder.extract("mirror", ex, m.images.as_ref())?;

    let root = m
        .root
        .as_ref()
        .map(|r| if r.is_absolute() { r.clone() } else { base.join(r) })
        .unwrap_or_else(|| base.to_path_buf());

    let url_from_file: Option<Arc<dyn UrlFromFile>> = match (&m.base_url, &m.url_from_file) {
        (Some(_), Some(_)) => bail!("mirror: base_url and url_from_file are mutually exclusive"),
        (Some(b), None) => {
            let base = url::Url::parse(b).with_context(|| format!("mirror: bad base_url '{}'", b))?;
            Some(Arc::new(BaseUrlFromFile { base }))
        }
        (None, Some(function)) => {
            let (hooks, function) = builder.lua(function, "mirror")?;
            Some(Arc::new(LuaUrlFromFile { hooks, function }))
        }
        (None, None) => None,
    };

    let mut mirror = MirrorAction::new(root, hooks);
    if let Some(p) = &m.html_files {
        mirror.html_files = p.to_vec();
    }
    mirror.test_files = match &m.test_files {
        Some(p) => p.to_vec(),
        None => mirror.html_files.clone(),
    };
    mirror.url_from_file = url_from_file;
    Ok(Plan::Mirror(mirror))
}

//! Lua 5.4 hooks for action files.
//!
//! An action file may name a `script`. The script runs once in a sandboxed
//! VM and defines hook functions on a global `scraper` table; action tables
//! then reference them by name (`extract = { lua = "extract_item" }`).
//!
//! ```lua
//! scraper = {}
//!
//! function scraper.extract_item(page)
//!     return {
//!         title = page.dom:query_text("h1"),
//!         url = page.url,
//!     }
//! end
//! ```
//!
//! # Hook signatures
//!
//! | Hook | Call | Returns |
//! |------|------|---------|
//! | extract | `f(page)` | table, array of tables, or `nil` |
//! | images | `f(page, record)` | array of URL strings |
//! | should_revisit | `f(href, record)` | boolean |
//! | url_from_file | `f(path)` | string |
//!
//! `page` is `{ url, content, dom }`.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `json` | `parse`, `encode` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `url` | `join(base, relative)`, `encode(s)` |
//! | `dom` (userdata) | `query_text`, `query_all_text`, `query_attr`, `query_all_attr`, `query_html`, `query_all_html`, `count` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile`, and `dofile` are removed. Each hook call
//! gets an instruction-count deadline.

use anyhow::{anyhow, bail, Context, Result};
use mlua::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::actions::{Extract, ImageUrls, PageData, ShouldRevisit, UrlFromFile};
use crate::dom::{DomQuery, Selection};

/// Wall-clock budget for one hook call.
const HOOK_BUDGET: Duration = Duration::from_secs(30);

/// Name of the global table hooks are defined on.
const HOOK_TABLE: &str = "scraper";

// ═══════════════════════════════════════════════════════════════════════
// Script host
// ═══════════════════════════════════════════════════════════════════════

/// A loaded hook script.
pub struct LuaHooks {
    lua: Mutex<Lua>,
    name: String,
}

impl LuaHooks {
    /// Read and execute a script file.
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script: {}", path.display()))?;
        Self::from_source(&src, &path.to_string_lossy())
    }

    /// Execute script source; `name` is used in errors and log lines.
    pub fn from_source(src: &str, name: &str) -> Result<Arc<Self>> {
        let lua = Lua::new();
        sandbox_globals(&lua)?;
        register_json_api(&lua)?;
        register_log_api(&lua, name)?;
        register_url_api(&lua)?;

        lua.load(src)
            .set_name(name)
            .exec()
            .map_err(|e| anyhow!("Failed to execute script {}: {}", name, e))?;

        if lua.globals().get::<LuaTable>(HOOK_TABLE).is_err() {
            bail!("Script {} must define a global '{}' table", name, HOOK_TABLE);
        }

        Ok(Arc::new(Self {
            lua: Mutex::new(lua),
            name: name.to_string(),
        }))
    }

    pub fn has_function(&self, function: &str) -> bool {
        let lua = self.lua.lock().unwrap();
        lua.globals()
            .get::<LuaTable>(HOOK_TABLE)
            .and_then(|t| t.get::<LuaFunction>(function))
            .is_ok()
    }

    /// Call `scraper.<function>` with arguments built inside the VM.
    fn call<A, R>(&self, function: &str, args: impl FnOnce(&Lua) -> LuaResult<A>) -> Result<R>
    where
        A: IntoLuaMulti,
        R: FromLuaMulti,
    {
        let lua = self.lua.lock().unwrap();
        let f: LuaFunction = lua
            .globals()
            .get::<LuaTable>(HOOK_TABLE)
            .and_then(|t| t.get::<LuaFunction>(function))
            .map_err(|e| anyhow!("{}.{} is not defined in {}: {}", HOOK_TABLE, function, self.name, e))?;

        let deadline = Instant::now() + HOOK_BUDGET;
        lua.set_hook(
            LuaHookTriggers::new().every_nth_instruction(10_000),
            move |_lua, _debug| {
                if Instant::now() > deadline {
                    Err(mlua::Error::RuntimeError(format!(
                        "hook timed out after {} seconds",
                        HOOK_BUDGET.as_secs()
                    )))
                } else {
                    Ok(LuaVmState::Continue)
                }
            },
        );

        let result = args(&lua).and_then(|a| f.call::<R>(a));
        lua.remove_hook();
        result.map_err(|e| anyhow!("{}.{}() failed in {}: {}", HOOK_TABLE, function, self.name, e))
    }
}

fn page_table(lua: &Lua, page: &PageData<'_>) -> LuaResult<LuaTable> {
    let t = lua.create_table()?;
    t.set("url", page.url)?;
    t.set("content", page.content)?;
    t.set(
        "dom",
        LuaDom {
            html: Arc::from(page.content),
        },
    )?;
    Ok(t)
}

// ═══════════════════════════════════════════════════════════════════════
// Hook adapters
// ═══════════════════════════════════════════════════════════════════════

pub struct LuaExtract {
    pub hooks: Arc<LuaHooks>,
    pub function: String,
}

impl Extract for LuaExtract {
    fn extract(&self, page: &PageData<'_>) -> Result<Option<serde_json::Value>> {
        let value: LuaValue = self.hooks.call(&self.function, |lua| page_table(lua, page))?;
        match lua_value_to_json(value)? {
            serde_json::Value::Null => Ok(None),
            other => Ok(Some(other)),
        }
    }
}

pub struct LuaImages {
    pub hooks: Arc<LuaHooks>,
    pub function: String,
}

impl ImageUrls for LuaImages {
    fn image_urls(&self, page: &PageData<'_>, record: &serde_json::Value) -> Result<Vec<String>> {
        let value: LuaValue = self.hooks.call(&self.function, |lua| {
            Ok((page_table(lua, page)?, json_value_to_lua(lua, record)?))
        })?;
        match lua_value_to_json(value)? {
            serde_json::Value::Null => Ok(Vec::new()),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => Ok(s),
                    other => bail!("{} returned a non-string image URL: {}", self.function, other),
                })
                .collect(),
            // An empty Lua table converts to an empty object.
            serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
            other => bail!("{} must return an array of URLs, got {}", self.function, other),
        }
    }
}

pub struct LuaShouldRevisit {
    pub hooks: Arc<LuaHooks>,
    pub function: String,
}

impl ShouldRevisit for LuaShouldRevisit {
    fn should_revisit(&self, href: &str, record: &serde_json::Value) -> Result<bool> {
        self.hooks.call(&self.function, |lua| {
            Ok((href.to_string(), json_value_to_lua(lua, record)?))
        })
    }
}

pub struct LuaUrlFromFile {
    pub hooks: Arc<LuaHooks>,
    pub function: String,
}

impl UrlFromFile for LuaUrlFromFile {
    fn url_for(&self, path: &Path) -> Result<String> {
        let p: PathBuf = path.to_path_buf();
        self.hooks
            .call(&self.function, |_lua| Ok(p.to_string_lossy().into_owned()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// DOM userdata
// ═══════════════════════════════════════════════════════════════════════

/// Page HTML exposed to scripts. The document is re-parsed per call
/// because the parsed tree cannot cross threads.
struct LuaDom {
    html: Arc<str>,
}

fn dom_err(e: anyhow::Error) -> mlua::Error {
    mlua::Error::external(e)
}

impl LuaUserData for LuaDom {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("query_text", |_, this, expr: String| {
            DomQuery::parse(&this.html).query_text(&expr).map_err(dom_err)
        });
        methods.add_method("query_all_text", |_, this, expr: String| {
            DomQuery::parse(&this.html)
                .query_all_text(&expr)
                .map_err(dom_err)
        });
        methods.add_method("query_attr", |_, this, (expr, attr): (String, String)| {
            let dom = DomQuery::parse(&this.html);
            Ok(dom
                .query(&expr)
                .map_err(dom_err)?
                .and_then(|el| el.value().attr(&attr).map(str::to_string)))
        });
        methods.add_method("query_all_attr", |_, this, (expr, attr): (String, String)| {
            let dom = DomQuery::parse(&this.html);
            Ok(dom
                .query_all(&expr)
                .map_err(dom_err)?
                .into_iter()
                .filter_map(|el| el.value().attr(&attr).map(str::to_string))
                .collect::<Vec<_>>())
        });
        methods.add_method("query_html", |_, this, expr: String| {
            let dom = DomQuery::parse(&this.html);
            Ok(dom.query(&expr).map_err(dom_err)?.map(|el| el.html()))
        });
        methods.add_method("query_all_html", |_, this, expr: String| {
            let dom = DomQuery::parse(&this.html);
            Ok(dom
                .query_all(&expr)
                .map_err(dom_err)?
                .into_iter()
                .map(|el| el.html())
                .collect::<Vec<_>>())
        });
        methods.add_method("count", |_, this, expr: String| {
            Selection::parse(&expr).map_err(dom_err)?;
            DomQuery::parse(&this.html).count(&expr).map_err(dom_err)
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

/// Remove dangerous standard library functions from the Lua globals.
fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = script_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            tracing::error!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: url
// ═══════════════════════════════════════════════════════════════════════

fn register_url_api(lua: &Lua) -> LuaResult<()> {
    let url_table = lua.create_table()?;

    // url.join(base, relative) → absolute URL
    url_table.set(
        "join",
        lua.create_function(|_lua, (base, relative): (String, String)| {
            let base = url::Url::parse(&base)
                .map_err(|e| mlua::Error::external(anyhow!("url.join: bad base '{}': {}", base, e)))?;
            base.join(&relative)
                .map(|u| u.to_string())
                .map_err(|e| mlua::Error::external(anyhow!("url.join: {}", e)))
        })?,
    )?;

    // url.encode(s) → percent-encoded component
    url_table.set(
        "encode",
        lua.create_function(|_lua, s: String| Ok(urlencoding::encode(&s).into_owned()))?,
    )?;

    lua.globals().set("url", url_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
///
/// A table with a positive border is an array; anything else is an object.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCRIPT: &str = r#"
scraper = {}

function scraper.extract(page)
    local title = page.dom:query_text("h1")
    if title == nil then
        return nil
    end
    return { title = title, url = page.url, tags = page.dom:query_all_text("li") }
end

function scraper.images(page, record)
    local out = {}
    for _, src in ipairs(page.dom:query_all_attr("img", "src")) do
        table.insert(out, url.join(page.url, src))
    end
    return out
end

function scraper.revisit(href, record)
    return record.title ~= "done"
end

function scraper.file_url(path)
    return "https://example.com/" .. path
end
"#;

    const PAGE: &str =
        r#"<html><body><h1>Hello</h1><ul><li>a</li><li>b</li></ul><img src="/x.png"></body></html>"#;

    #[test]
    fn extract_hook_reads_dom() {
        let hooks = LuaHooks::from_source(SCRIPT, "test.lua").unwrap();
        let dom = DomQuery::parse(PAGE);
        let page = PageData {
            url: "https://example.com/p/1",
            content: PAGE,
            dom: &dom,
        };
        let ex = LuaExtract {
            hooks: hooks.clone(),
            function: "extract".to_string(),
        };
        let value = ex.extract(&page).unwrap().unwrap();
        assert_eq!(value["title"], json!("Hello"));
        assert_eq!(value["tags"], json!(["a", "b"]));

        let images = LuaImages {
            hooks,
            function: "images".to_string(),
        };
        assert_eq!(
            images.image_urls(&page, &value).unwrap(),
            vec!["https://example.com/x.png".to_string()]
        );
    }

    #[test]
    fn nil_extract_is_no_data() {
        let hooks = LuaHooks::from_source(SCRIPT, "test.lua").unwrap();
        let dom = DomQuery::parse("<html><body></body></html>");
        let page = PageData {
            url: "https://example.com/",
            content: "",
            dom: &dom,
        };
        let ex = LuaExtract {
            hooks,
            function: "extract".to_string(),
        };
        assert!(ex.extract(&page).unwrap().is_none());
    }

    #[test]
    fn revisit_and_file_url_hooks() {
        let hooks = LuaHooks::from_source(SCRIPT, "test.lua").unwrap();
        let revisit = LuaShouldRevisit {
            hooks: hooks.clone(),
            function: "revisit".to_string(),
        };
        assert!(!revisit.should_revisit("/a", &json!({"title": "done"})).unwrap());
        assert!(revisit.should_revisit("/a", &json!({"title": "open"})).unwrap());

        let file_url = LuaUrlFromFile {
            hooks,
            function: "file_url".to_string(),
        };
        assert_eq!(
            file_url.url_for(Path::new("a/b.html")).unwrap(),
            "https://example.com/a/b.html"
        );
    }

    #[test]
    fn sandbox_and_missing_table() {
        assert!(LuaHooks::from_source("scraper = {}\nos.execute('true')", "bad.lua").is_err());
        assert!(LuaHooks::from_source("local x = 1", "empty.lua").is_err());
        let hooks = LuaHooks::from_source("scraper = {}", "ok.lua").unwrap();
        assert!(!hooks.has_function("extract"));
    }

    #[test]
    fn json_roundtrip_preserves_arrays_and_objects() {
        let lua = Lua::new();
        let v = json!({"a": [1, 2, {"b": "c"}], "d": true});
        let lv = json_value_to_lua(&lua, &v).unwrap();
        assert_eq!(lua_value_to_json(lv).unwrap(), v);
    }
}

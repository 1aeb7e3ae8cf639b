//! Action-file loading.
//!
//! An action file is TOML with an `[options]` table and exactly one of
//! `[browser.<action>]` tables or a `[mirror]` table. Parsing happens in two
//! steps: serde reads the raw tables defined here, then
//! [`load_action_file`] resolves defaults and paths into [`Settings`] and
//! hands the action tables to [`crate::actions::build_plan`], which checks
//! them and turns them into the tagged action model.
//!
//! Paths inside the file are relative to the file's own directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actions::{self, Plan};
use crate::images::OutputFormat;

// ═══════════════════════════════════════════════════════════════════════
// Raw TOML schema
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ActionFileToml {
    #[serde(default)]
    pub options: OptionsToml,
    #[serde(default)]
    pub browser: Option<BTreeMap<String, BrowserActionToml>>,
    #[serde(default)]
    pub mirror: Option<MirrorToml>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OptionsToml {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub db_name: Option<PathBuf>,
    #[serde(default)]
    pub export_file: Option<PathBuf>,
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    #[serde(default)]
    pub test_dir: Option<PathBuf>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Lua file defining `scraper.*` hook functions.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub s3: Option<S3Toml>,
}

impl Default for OptionsToml {
    fn default() -> Self {
        Self {
            source: default_source(),
            output_dir: None,
            db_name: None,
            export_file: None,
            image_dir: None,
            test_dir: None,
            format: default_format(),
            delay_ms: None,
            timeout_ms: None,
            script: None,
            s3: None,
        }
    }
}

fn default_source() -> String {
    "default".to_string()
}
fn default_format() -> String {
    "jpg".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

const DEFAULT_DELAY_MS: u64 = 1000;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct S3Toml {
    pub bucket: String,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct BrowserActionToml {
    /// URL to open the first time this action runs.
    #[serde(default)]
    pub init: Option<String>,
    #[serde(default)]
    pub extract: Option<ExtractToml>,
    #[serde(default)]
    pub images: Option<ImagesToml>,
    #[serde(default)]
    pub visit: Option<VisitToml>,
    #[serde(default)]
    pub visit_all: Option<VisitAllToml>,
    #[serde(default)]
    pub undo: Option<UndoToml>,
    #[serde(default)]
    pub next: Option<NextToml>,
    #[serde(default)]
    pub test_urls: Vec<String>,
}

/// Either a CSS field map or a Lua function name.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ExtractToml {
    /// Selector whose matches each become one record; fields are queried
    /// inside the match. Without it the whole page is one record.
    #[serde(default)]
    pub records: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldToml>,
    #[serde(default)]
    pub lua: Option<String>,
}

/// `"h1"` reads one value, `["li.tag"]` reads every match.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum FieldToml {
    One(String),
    All(Vec<String>),
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ImagesToml {
    /// `sel@attr` expression; every match is an image URL.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub lua: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct VisitToml {
    /// Element clicked before descending.
    pub click: String,
    pub action: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct VisitAllToml {
    pub links: String,
    pub action: String,
    #[serde(default)]
    pub should_revisit: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UndoToml {
    pub click: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct NextToml {
    pub click: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct MirrorToml {
    #[serde(default)]
    pub html_files: Option<Patterns>,
    #[serde(default)]
    pub test_files: Option<Patterns>,
    /// Directory the patterns are matched under.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub url_from_file: Option<String>,
    #[serde(default)]
    pub extract: Option<ExtractToml>,
    #[serde(default)]
    pub images: Option<ImagesToml>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Patterns {
    One(String),
    Many(Vec<String>),
}

impl Patterns {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Patterns::One(p) => vec![p.clone()],
            Patterns::Many(ps) => ps.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Resolved settings
// ═══════════════════════════════════════════════════════════════════════

/// How a run treats persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Normal scrape: writes records, downloads, and bookkeeping.
    Scrape,
    /// Print what would be written; touch nothing.
    DryRun,
    /// Compare against snapshot fixtures instead of persisting.
    Test,
}

/// Command-line overrides applied on top of the action file.
#[derive(Debug, Clone)]
pub struct RunFlags {
    pub mode: RunMode,
    pub debug: bool,
    pub overwrite: bool,
    pub delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            mode: RunMode::Scrape,
            debug: false,
            overwrite: false,
            delay_ms: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub path_prefix: Option<String>,
    pub acl: Option<String>,
    pub region: String,
    pub endpoint_url: Option<String>,
}

/// Fully-resolved run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source: String,
    pub mode: RunMode,
    pub debug: bool,
    /// Re-fetch images even when a stored file already exists; in test
    /// mode, rewrite mismatching snapshots.
    pub overwrite: bool,
    /// Pause before every navigation step and fresh image download.
    pub delay: Duration,
    /// Upper bound for each browser operation and HTTP request.
    pub timeout: Duration,
    pub format: OutputFormat,
    pub db_path: PathBuf,
    pub export_file: PathBuf,
    pub image_dir: PathBuf,
    pub test_dir: PathBuf,
    pub s3: Option<S3Settings>,
}

impl Settings {
    /// Settings rooted at `dir` with every default applied. Used by tests
    /// and library callers that build actions in code.
    pub fn for_dir(dir: &Path, mode: RunMode) -> Self {
        Self {
            source: default_source(),
            mode,
            debug: false,
            overwrite: false,
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            format: OutputFormat::default(),
            db_path: dir.join("playscrape.db"),
            export_file: dir.join("playscrape.json"),
            image_dir: dir.join("images"),
            test_dir: dir.join("tests"),
            s3: None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == RunMode::DryRun
    }

    pub fn is_test(&self) -> bool {
        self.mode == RunMode::Test
    }
}

/// A loaded action file.
pub struct ActionFile {
    pub path: PathBuf,
    pub settings: Settings,
    pub plan: Plan,
}

fn resolve_path(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Parse action-file TOML without touching the filesystem.
pub fn parse_action_file(content: &str) -> Result<ActionFileToml> {
    let file: ActionFileToml =
        toml::from_str(content).with_context(|| "Failed to parse action file")?;

    match (&file.browser, &file.mirror) {
        (None, None) => bail!("No actions found. Define [browser.<name>] tables or a [mirror] table."),
        (Some(_), Some(_)) => bail!("Both browser and mirror actions defined, only use one."),
        (Some(browser), None) if browser.is_empty() => {
            bail!("No actions found. The [browser] table is empty.")
        }
        _ => {}
    }

    Ok(file)
}

/// Load, validate, and resolve an action file.
///
/// Creates the output directory, and in test mode the snapshot directory.
pub fn load_action_file(path: &Path, flags: &RunFlags) -> Result<ActionFile> {
    if !path.exists() {
        bail!("Action file {} does not exist.", path.display());
    }
    let path = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve action file: {}", path.display()))?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read action file: {}", path.display()))?;

    let file = parse_action_file(&content)?;
    let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let settings = resolve_settings(&file.options, &base, flags)?;

    std::fs::create_dir_all(
        settings
            .db_path
            .parent()
            .unwrap_or_else(|| Path::new(".")),
    )
    .with_context(|| format!("Failed to create output directory for {}", settings.db_path.display()))?;
    if settings.is_test() {
        std::fs::create_dir_all(&settings.test_dir).with_context(|| {
            format!("Failed to create test directory: {}", settings.test_dir.display())
        })?;
    }

    let script = file
        .options
        .script
        .as_ref()
        .map(|s| resolve_path(&base, s));
    let plan = actions::build_plan(&file, &base, script.as_deref())?;

    Ok(ActionFile {
        path,
        settings,
        plan,
    })
}

/// Apply defaults and CLI overrides to the `[options]` table.
pub fn resolve_settings(options: &OptionsToml, base: &Path, flags: &RunFlags) -> Result<Settings> {
    if options.source.trim().is_empty() {
        bail!("options.source must not be empty");
    }

    let output_dir = options
        .output_dir
        .as_ref()
        .map(|d| resolve_path(base, d))
        .unwrap_or_else(|| base.to_path_buf());
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let pick = |value: &Option<PathBuf>, default: &str| -> PathBuf {
        value
            .as_ref()
            .map(|p| resolve_path(base, p))
            .unwrap_or_else(|| output_dir.join(default))
    };

    let delay_ms = flags
        .delay_ms
        .or(options.delay_ms)
        .unwrap_or(DEFAULT_DELAY_MS);
    let timeout_ms = flags
        .timeout_ms
        .or(options.timeout_ms)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    if timeout_ms == 0 {
        bail!("timeout must be > 0");
    }

    let format = OutputFormat::parse(&options.format)?;

    let s3 = match &options.s3 {
        Some(s3) => {
            if s3.bucket.trim().is_empty() {
                bail!("S3 bucket not specified.");
            }
            Some(S3Settings {
                bucket: s3.bucket.clone(),
                path_prefix: s3.path_prefix.clone(),
                acl: s3.acl.clone(),
                region: s3.region.clone(),
                endpoint_url: s3.endpoint_url.clone(),
            })
        }
        None => None,
    };

    Ok(Settings {
        source: options.source.clone(),
        mode: flags.mode,
        debug: flags.debug,
        overwrite: flags.overwrite,
        delay: Duration::from_millis(delay_ms),
        timeout: Duration::from_millis(timeout_ms),
        format,
        db_path: pick(&options.db_name, "playscrape.db"),
        export_file: pick(&options.export_file, "playscrape.json"),
        image_dir: pick(&options.image_dir, "images"),
        test_dir: pick(&options.test_dir, "tests"),
        s3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_and_conflicting_action_tables() {
        let err = parse_action_file("[options]\nsource = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("No actions found"));

        let both = r#"
[browser.start]
init = "https://example.com"
[mirror]
html_files = "*.html"
"#;
        let err = parse_action_file(both).unwrap_err();
        assert!(err.to_string().contains("only use one"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let bad = r#"
[browser.start]
inti = "https://example.com"
"#;
        assert!(parse_action_file(bad).is_err());
    }

    #[test]
    fn field_forms_parse() {
        let src = r#"
[mirror]
html_files = ["a/*.html", "b/*.html"]
extract = { fields = { title = "h1", tags = ["li.tag"] } }
"#;
        let file = parse_action_file(src).unwrap();
        let mirror = file.mirror.unwrap();
        assert_eq!(
            mirror.html_files.unwrap().to_vec(),
            vec!["a/*.html".to_string(), "b/*.html".to_string()]
        );
        let fields = mirror.extract.unwrap().fields;
        assert_eq!(fields["title"], FieldToml::One("h1".to_string()));
        assert_eq!(fields["tags"], FieldToml::All(vec!["li.tag".to_string()]));
    }

    #[test]
    fn defaults_resolve_under_output_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings =
            resolve_settings(&OptionsToml::default(), tmp.path(), &RunFlags::default()).unwrap();
        assert_eq!(settings.source, "default");
        assert_eq!(settings.db_path, tmp.path().join("playscrape.db"));
        assert_eq!(settings.export_file, tmp.path().join("playscrape.json"));
        assert_eq!(settings.test_dir, tmp.path().join("tests"));
        assert_eq!(settings.delay, Duration::from_millis(1000));
        assert_eq!(settings.timeout, Duration::from_millis(60_000));
        assert_eq!(settings.format.extension(), Some("jpg"));
    }

    #[test]
    fn cli_flags_override_file_values() {
        let tmp = tempfile::TempDir::new().unwrap();
        let options = OptionsToml {
            delay_ms: Some(50),
            timeout_ms: Some(500),
            output_dir: Some(PathBuf::from("out")),
            ..Default::default()
        };
        let flags = RunFlags {
            delay_ms: Some(0),
            ..Default::default()
        };
        let settings = resolve_settings(&options, tmp.path(), &flags).unwrap();
        assert_eq!(settings.delay, Duration::ZERO);
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.db_path, tmp.path().join("out").join("playscrape.db"));
        assert!(tmp.path().join("out").is_dir());
    }

    #[test]
    fn bad_format_is_a_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let options = OptionsToml {
            format: "docx".to_string(),
            ..Default::default()
        };
        assert!(resolve_settings(&options, tmp.path(), &RunFlags::default()).is_err());
    }
}

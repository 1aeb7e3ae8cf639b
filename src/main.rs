//! # playscrape CLI
//!
//! ## Usage
//!
//! ```bash
//! playscrape <command> <action_file> [flags]
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `playscrape init <name>` | Scaffold `<name>.toml` and `<name>.lua` |
//! | `playscrape scrape <file>` | Run the traversal and store records |
//! | `playscrape extract <file>` | Re-extract stored records from their saved content |
//! | `playscrape test <file>` | Compare test pages against snapshot fixtures |
//! | `playscrape export <file>` | Write the flattened JSON export |
//! | `playscrape stats <file>` | Show recent runs and record counts |

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playscrape::config::{load_action_file, ActionFile, RunFlags, RunMode};
use playscrape::progress::ProgressMode;
use playscrape::session::Session;
use playscrape::sqlite_store::SqliteStore;
use playscrape::{export, scaffold, scrape, stats};

/// playscrape: declarative browser and mirror scraper.
#[derive(Parser)]
#[command(name = "playscrape", version)]
struct Cli {
    /// Verbose logging, including SQL; browser runs show the window.
    #[arg(long, global = true)]
    debug: bool,

    /// Progress output on stderr: human, json, or off.
    /// Defaults to human on a TTY and off otherwise.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Action file (TOML).
    action_file: PathBuf,

    /// Print what would be stored without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Milliseconds to wait between navigation steps.
    #[arg(long)]
    delay: Option<u64>,

    /// Milliseconds before a page operation or image fetch times out.
    #[arg(long)]
    timeout: Option<u64>,

    /// Re-download images that already have a stored copy.
    #[arg(long)]
    overwrite: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new action file and Lua hook script in the current directory.
    Init {
        /// Base name for `<name>.toml` and `<name>.lua`.
        name: String,
    },

    /// Run a scrape.
    Scrape(RunArgs),

    /// Re-run extraction over stored page content without fetching.
    Extract(RunArgs),

    /// Extract the test pages and compare against snapshots.
    Test {
        action_file: PathBuf,

        /// Rewrite mismatching snapshots instead of failing.
        #[arg(short = 'u', long = "update-snapshot")]
        update_snapshot: bool,

        #[arg(long)]
        delay: Option<u64>,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Export stored records as a JSON array.
    Export {
        action_file: PathBuf,

        /// Write to stdout instead of the configured export file.
        #[arg(long)]
        stdout: bool,
    },

    /// Show recent scrape runs and per-source totals.
    Stats {
        action_file: PathBuf,

        /// Number of recent runs to list.
        #[arg(long, default_value = "10")]
        limit: i64,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "playscrape=debug,sqlx=debug"
    } else {
        "playscrape=info,sqlx=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

impl RunArgs {
    fn flags(&self, debug: bool) -> RunFlags {
        RunFlags {
            mode: if self.dry_run {
                RunMode::DryRun
            } else {
                RunMode::Scrape
            },
            debug,
            overwrite: self.overwrite,
            delay_ms: self.delay,
            timeout_ms: self.timeout,
        }
    }
}

async fn open_session(file: &ActionFile, progress: ProgressMode) -> Result<(Session, SqliteStore)> {
    let store = SqliteStore::open(&file.settings.db_path).await?;
    let session = Session::new(
        file.settings.clone(),
        Arc::new(store.clone()),
        progress.reporter(),
    )?;
    Ok((session, store))
}

fn load(path: &Path, flags: &RunFlags) -> Result<ActionFile> {
    let file = load_action_file(path, flags)?;
    tracing::debug!(file = %file.path.display(), db = %file.settings.db_path.display(), "Loaded action file");
    Ok(file)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let progress = match &cli.progress {
        Some(p) => ProgressMode::parse(p)?,
        None => ProgressMode::default_for_tty(),
    };

    match cli.command {
        Commands::Init { name } => {
            let (toml_path, lua_path) = scaffold::scaffold(Path::new("."), &name)?;
            println!("Created {} and {}", toml_path.display(), lua_path.display());
        }
        Commands::Scrape(args) => {
            let file = load(&args.action_file, &args.flags(cli.debug))?;
            let (mut session, store) = open_session(&file, progress).await?;
            let result = scrape::run_scrape(&mut session, &file.plan).await;
            store.close().await;
            let counters = result?;
            if session.settings.is_dry_run() {
                println!("{}", serde_json::to_string_pretty(&counters)?);
            }
        }
        Commands::Extract(args) => {
            let file = load(&args.action_file, &args.flags(cli.debug))?;
            let (mut session, store) = open_session(&file, progress).await?;
            let result = scrape::run_re_extract(&mut session, &file.plan).await;
            store.close().await;
            let counters = result?;
            if session.settings.is_dry_run() {
                println!("{}", serde_json::to_string_pretty(&counters)?);
            }
        }
        Commands::Test {
            action_file,
            update_snapshot,
            delay,
            timeout,
        } => {
            let flags = RunFlags {
                mode: RunMode::Test,
                debug: cli.debug,
                overwrite: update_snapshot,
                delay_ms: delay,
                timeout_ms: timeout,
            };
            let file = load(&action_file, &flags)?;
            let (mut session, store) = open_session(&file, progress).await?;
            let result = scrape::run_test(&mut session, &file.plan).await;
            store.close().await;
            result?;
        }
        Commands::Export {
            action_file,
            stdout,
        } => {
            let file = load(&action_file, &RunFlags::default())?;
            let store = SqliteStore::open(&file.settings.db_path).await?;
            let output = if stdout {
                None
            } else {
                Some(file.settings.export_file.as_path())
            };
            let result = export::run_export(&store, output).await;
            store.close().await;
            result?;
        }
        Commands::Stats {
            action_file,
            limit,
        } => {
            let file = load(&action_file, &RunFlags::default())?;
            let store = SqliteStore::open(&file.settings.db_path).await?;
            let result = stats::run_stats(&store, &file.settings.db_path, limit).await;
            store.close().await;
            result?;
        }
    }

    Ok(())
}

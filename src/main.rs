//! # Context Connectors CLI (`ctxc`)
//!
//! ## Usage
//!
//! ```bash
//! ctxc --config ./config/ctxc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxc init` | Create the primary store (and its schema) |
//! | `ctxc sync <name\|all>` | Bring one or all configured indexes up to date |
//! | `ctxc list` | List indexes in the primary store and the S3 remote |
//! | `ctxc ls <name> [dir]` | List a directory of an index's source |
//! | `ctxc cat <name> <path>` | Print one file from an index's source |
//! | `ctxc check <path>` | Show whether a local file would be indexed |
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use context_connectors::config::{self, Config};
use context_connectors::ignore_rules::IgnoreRules;
use context_connectors::ingest::{self, SyncOptions};
use context_connectors::sources;
use context_connectors_core::store::IndexStateReader;
use tracing::error;

/// Context Connectors: keep filtered indexes of git repositories, websites
/// and local directories in sync.
#[derive(Parser)]
#[command(
    name = "ctxc",
    about = "Keep filtered, incrementally synced indexes of git repositories, websites and directories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ctxc.toml`.
    #[arg(long, global = true, default_value = "./config/ctxc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the primary store.
    ///
    /// Creates the SQLite database and schema, or the store directory.
    /// Safe to run repeatedly.
    Init,

    /// Sync one configured index, or `all`.
    ///
    /// Uses the source's change detection when a previous state exists and
    /// falls back to a full fetch when it cannot be used.
    Sync {
        /// Index name from `[indexes.<name>]`, or `all`.
        name: String,

        /// Skip change detection and re-fetch everything.
        #[arg(long)]
        full: bool,
    },

    /// List indexes from the primary store and, if configured, the S3 remote.
    List,

    /// List a directory of an index's source.
    Ls {
        name: String,
        /// Directory relative to the source root. Defaults to the root.
        dir: Option<String>,
    },

    /// Print a file from an index's source.
    Cat { name: String, path: String },

    /// Run the content filter on a local file.
    Check {
        path: PathBuf,
        /// Directory whose `.augmentignore`/`.gitignore` apply. Defaults to `.`.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    // `check` works without a config file.
    if let Commands::Check { path, root } = &cli.command {
        let cfg = if cli.config.exists() {
            config::load_config(&cli.config)?
        } else {
            Config::default()
        };
        return run_check(path, root, cfg.filter.max_file_size);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = sources::open_primary(&cfg).await?;
            let count = store.list().await?.len();
            println!(
                "Store initialized at {} ({} indexes).",
                cfg.store.path().display(),
                count
            );
        }
        Commands::Sync { name, full } => {
            let names: Vec<String> = if name == "all" {
                cfg.indexes.keys().cloned().collect()
            } else {
                vec![name]
            };
            if names.is_empty() {
                bail!("No indexes configured in {}", cli.config.display());
            }

            let store = sources::open_primary(&cfg).await?;
            let mut failed = 0;
            for name in &names {
                let source = sources::build_source(name, &cfg)?;
                match ingest::run_sync(name, source.as_ref(), store.as_ref(), SyncOptions { full })
                    .await
                {
                    Ok(report) => {
                        println!("sync {} ({})", name, report.mode);
                        println!("  added: {}", report.added);
                        println!("  modified: {}", report.modified);
                        println!("  removed: {}", report.removed);
                        println!("  total files: {}", report.total_files);
                        println!("  ref: {}", report.resolved_ref);
                    }
                    Err(e) => {
                        error!(index = %name, "sync failed: {:#}", e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} syncs failed", failed, names.len());
            }
            println!("ok");
        }
        Commands::List => {
            let reader = sources::open_reader(&cfg).await?;
            let names = reader.list().await?;
            if names.is_empty() {
                println!("No indexes.");
                return Ok(());
            }
            println!("{:<24} {:<12} {:<22} REF", "NAME", "TYPE", "SYNCED");
            for name in names {
                match reader.load_search(&name).await? {
                    Some(search) => println!(
                        "{:<24} {:<12} {:<22} {}",
                        name,
                        search.source.source_type().as_str(),
                        search.source.synced_at().format("%Y-%m-%d %H:%M:%S").to_string(),
                        search.source.resolved_ref()
                    ),
                    None => println!("{:<24} {:<12} {:<22} -", name, "-", "-"),
                }
            }
        }
        Commands::Ls { name, dir } => {
            let source = sources::build_source(&name, &cfg)?;
            for info in source.list_files(dir.as_deref()).await? {
                if info.is_directory {
                    println!("{}/", info.path);
                } else {
                    println!("{}", info.path);
                }
            }
        }
        Commands::Cat { name, path } => {
            let source = sources::build_source(&name, &cfg)?;
            match source.read_file(&path).await? {
                Some(bytes) => std::io::stdout().write_all(&bytes)?,
                None => bail!("{}: not found in index '{}'", path, name),
            }
        }
        Commands::Check { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

fn run_check(path: &Path, root: &Path, max_file_size: usize) -> Result<()> {
    let rules = IgnoreRules::load(root, max_file_size)?;
    let contents =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let relative = path.strip_prefix(root).unwrap_or(path);
    let relative = relative
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    match rules.check(&relative, &contents).reason {
        Some(reason) => println!("{}: filtered ({})", relative, reason),
        None => println!("{}: indexed", relative),
    }
    Ok(())
}

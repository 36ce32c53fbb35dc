//! TOML configuration.
//!
//! ```toml
//! [store]
//! kind = "sqlite"               # or "filesystem"
//! path = "./data/ctxc.sqlite"
//!
//! [filter]
//! max_file_size = 1048576
//!
//! [remote.s3]                   # optional read-through remote
//! bucket = "acme-indexes"
//! prefix = "context-connectors/"
//!
//! [indexes.platform]
//! type = "git"
//! url = "https://github.com/acme/platform.git"
//! branch = "main"
//!
//! [indexes.handbook]
//! type = "website"
//! url = "https://handbook.acme.dev/"
//! max_pages = 200
//!
//! [indexes.notes]
//! type = "filesystem"
//! root = "./notes"
//! ```
//!
//! When no `[remote.s3]` section is present, the remote falls back to the
//! `CC_S3_*` environment variables (see [`S3StoreConfig::from_env`]).

use anyhow::{bail, Context, Result};
use context_connectors_core::filter::DEFAULT_MAX_FILE_SIZE;
use context_connectors_core::store::validate_index_name;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Filesystem,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// Database file for `sqlite`, base directory for `filesystem`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        match (&self.path, self.kind) {
            (Some(p), _) => p.clone(),
            (None, StoreKind::Sqlite) => PathBuf::from("./data/ctxc.sqlite"),
            (None, StoreKind::Filesystem) => PathBuf::from(".context-connectors"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

fn default_max_file_size() -> usize {
    DEFAULT_MAX_FILE_SIZE
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RemoteConfig {
    pub s3: Option<S3StoreConfig>,
}

/// S3 (or S3-compatible) index-state storage.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct S3StoreConfig {
    /// Required. Empty when unset; [`S3Store::new`](crate::s3_store::S3Store::new) rejects it.
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for MinIO, R2, LocalStack and similar.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_s3_prefix() -> String {
    "context-connectors/".to_string()
}

impl S3StoreConfig {
    /// Read `CC_S3_BUCKET`, `CC_S3_PREFIX`, `CC_S3_REGION`,
    /// `CC_S3_ENDPOINT` and `CC_S3_FORCE_PATH_STYLE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            bucket: lookup("CC_S3_BUCKET").unwrap_or_default(),
            prefix: non_empty("CC_S3_PREFIX").unwrap_or_else(default_s3_prefix),
            region: non_empty("CC_S3_REGION"),
            endpoint: non_empty("CC_S3_ENDPOINT"),
            force_path_style: lookup("CC_S3_FORCE_PATH_STYLE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// One configured index and the source that feeds it.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexConfig {
    Git(GitIndexConfig),
    Filesystem(FilesystemIndexConfig),
    Website(WebsiteIndexConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitIndexConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Local clone location. Defaults to `.git-cache/<hash>` next to the store.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemIndexConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebsiteIndexConfig {
    pub url: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Upper bound on page requests per crawl.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Globs over URL paths; when non-empty, only matching pages are kept.
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Pause between page requests.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_depth() -> usize {
    3
}
fn default_max_pages() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// The remote reader configuration: `[remote.s3]` if present, else the
    /// environment when `CC_S3_BUCKET` is set.
    pub fn remote_s3(&self) -> Option<S3StoreConfig> {
        match &self.remote.s3 {
            Some(s3) => Some(s3.clone()),
            None => std::env::var("CC_S3_BUCKET")
                .ok()
                .filter(|b| !b.is_empty())
                .map(|_| S3StoreConfig::from_env()),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.filter.max_file_size == 0 {
        bail!("filter.max_file_size must be > 0");
    }

    for (name, index) in &config.indexes {
        validate_index_name(name).with_context(|| format!("indexes.{}", name))?;
        match index {
            IndexConfig::Git(git) => {
                if git.url.trim().is_empty() {
                    bail!("indexes.{}.url must be set for git indexes", name);
                }
                if git.branch.trim().is_empty() {
                    bail!("indexes.{}.branch must not be empty", name);
                }
            }
            IndexConfig::Filesystem(_) => {}
            IndexConfig::Website(site) => {
                let parsed = url::Url::parse(&site.url)
                    .with_context(|| format!("indexes.{}.url is not a valid URL", name))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    bail!("indexes.{}.url must be http or https", name);
                }
                if site.max_pages == 0 {
                    bail!("indexes.{}.max_pages must be > 0", name);
                }
            }
        }
    }

    Ok(config)
}

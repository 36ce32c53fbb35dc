//! Construction of sources and stores from configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use context_connectors_core::source::Source;
use context_connectors_core::store::layered::LayeredStore;
use context_connectors_core::store::{IndexStateReader, IndexStateStore};
use tracing::info;

use crate::config::{Config, IndexConfig, StoreKind};
use crate::fs_store::FilesystemStore;
use crate::s3_store::S3Store;
use crate::source_fs::FilesystemSource;
use crate::source_git::GitSource;
use crate::source_website::WebsiteSource;
use crate::sqlite_store::SqliteStore;

/// Build the source configured for index `name`.
pub fn build_source(name: &str, config: &Config) -> Result<Box<dyn Source>> {
    let index = config
        .indexes
        .get(name)
        .with_context(|| format!("No index named '{}' in config", name))?;
    let max_file_size = config.filter.max_file_size;

    let source: Box<dyn Source> = match index {
        IndexConfig::Git(git) => {
            let cache_dir = match &git.cache_dir {
                Some(dir) => dir.clone(),
                None => GitSource::default_cache_dir(&state_dir(config), &git.url),
            };
            Box::new(GitSource::new(
                git.url.clone(),
                git.branch.clone(),
                cache_dir,
                max_file_size,
            ))
        }
        IndexConfig::Filesystem(fs) => Box::new(
            FilesystemSource::new(fs.root.clone(), max_file_size)
                .with_excluded_paths(local_state_paths(config)),
        ),
        IndexConfig::Website(site) => Box::new(
            WebsiteSource::new(site.clone(), max_file_size)
                .with_context(|| format!("Invalid website index '{}'", name))?,
        ),
    };
    Ok(source)
}

/// Directory that holds local state: the store itself or its parent.
fn state_dir(config: &Config) -> PathBuf {
    let path = config.store.path();
    match config.store.kind {
        StoreKind::Filesystem => path,
        StoreKind::Sqlite => path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

/// Everything this tool writes locally: the store and the default git cache.
fn local_state_paths(config: &Config) -> Vec<PathBuf> {
    let path = config.store.path();
    let mut paths = match config.store.kind {
        StoreKind::Filesystem => vec![path],
        StoreKind::Sqlite => ["", "-wal", "-shm", "-journal"]
            .iter()
            .map(|suffix| {
                let mut name = path.clone().into_os_string();
                name.push(suffix);
                PathBuf::from(name)
            })
            .collect(),
    };
    paths.push(state_dir(config).join(".git-cache"));
    paths.extend(config.indexes.values().filter_map(|index| match index {
        IndexConfig::Git(git) => git.cache_dir.clone(),
        _ => None,
    }));
    paths
}

/// Open the writable primary store.
pub async fn open_primary(config: &Config) -> Result<Box<dyn IndexStateStore>> {
    let path = config.store.path();
    let store: Box<dyn IndexStateStore> = match config.store.kind {
        StoreKind::Sqlite => Box::new(SqliteStore::open(&path).await?),
        StoreKind::Filesystem => Box::new(FilesystemStore::new(path)),
    };
    Ok(store)
}

/// Open the read view: the primary store, layered over the S3 remote when
/// one is configured.
pub async fn open_reader(config: &Config) -> Result<Box<dyn IndexStateReader>> {
    let primary = open_primary(config).await?;
    match config.remote_s3() {
        Some(s3) => {
            let remote = S3Store::new(&s3).context("Failed to configure S3 remote")?;
            info!(bucket = %s3.bucket, prefix = %s3.prefix, "using S3 remote");
            Ok(Box::new(LayeredStore::new(primary, remote)))
        }
        None => Ok(Box::new(primary)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use context_connectors_core::models::SourceType;

    #[test]
    fn test_build_source_per_type() {
        let config = parse_config(
            r#"
            [indexes.api]
            type = "git"
            url = "https://example.com/acme/api.git"

            [indexes.notes]
            type = "filesystem"
            root = "./notes"

            [indexes.docs]
            type = "website"
            url = "https://docs.example.com/"
            "#,
        )
        .unwrap();

        assert_eq!(build_source("api", &config).unwrap().source_type(), SourceType::Git);
        assert_eq!(
            build_source("notes", &config).unwrap().source_type(),
            SourceType::Filesystem
        );
        assert_eq!(
            build_source("docs", &config).unwrap().source_type(),
            SourceType::Website
        );
        assert!(build_source("missing", &config).is_err());
    }

    #[test]
    fn test_state_dir() {
        let sqlite = parse_config("[store]\npath = \"/var/lib/ctxc/index.sqlite\"").unwrap();
        assert_eq!(state_dir(&sqlite), PathBuf::from("/var/lib/ctxc"));
        let fs = parse_config("[store]\nkind = \"filesystem\"\npath = \"/srv/idx\"").unwrap();
        assert_eq!(state_dir(&fs), PathBuf::from("/srv/idx"));
        let bare = parse_config("[store]\npath = \"ctxc.sqlite\"").unwrap();
        assert_eq!(state_dir(&bare), PathBuf::from("."));
    }

    #[tokio::test]
    async fn test_filesystem_index_skips_local_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("notes.md"), "notes").unwrap();
        std::fs::create_dir_all(root.join("data/.git-cache/0123")).unwrap();
        std::fs::write(root.join("data/.git-cache/0123/HEAD"), "ref: refs/heads/main").unwrap();
        std::fs::write(root.join("data/ctxc.sqlite-wal"), "wal").unwrap();
        let config = parse_config(&format!(
            "[store]\npath = \"{0}/data/ctxc.sqlite\"\n\n[indexes.here]\ntype = \"filesystem\"\nroot = \"{0}\"",
            root.display()
        ))
        .unwrap();
        // The store exists by the time a sync walks the tree.
        let store = open_primary(&config).await.unwrap();
        store.list().await.unwrap();

        let source = build_source("here", &config).unwrap();
        let paths: Vec<String> = source
            .fetch_all()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["notes.md"]);
    }

    #[test]
    fn test_local_state_paths() {
        let config = parse_config(
            r#"
            [store]
            kind = "filesystem"
            path = "/srv/idx"

            [indexes.api]
            type = "git"
            url = "https://example.com/acme/api.git"
            cache_dir = "/tmp/api-cache"
            "#,
        )
        .unwrap();
        assert_eq!(
            local_state_paths(&config),
            vec![
                PathBuf::from("/srv/idx"),
                PathBuf::from("/srv/idx/.git-cache"),
                PathBuf::from("/tmp/api-cache"),
            ]
        );
    }

    #[tokio::test]
    async fn test_open_primary_filesystem() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = parse_config(&format!(
            "[store]\nkind = \"filesystem\"\npath = \"{}\"",
            tmp.path().display()
        ))
        .unwrap();
        let store = open_primary(&config).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}

//! Directory-backed index-state store.
//!
//! ```text
//! <base>/
//!   <name>/
//!     state.json    full IndexState
//!     search.json   IndexStateSearchOnly projection
//! ```
//!
//! Both files are written to a temporary sibling, synced, then renamed
//! into place, so a reader never sees a half-written document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use context_connectors_core::models::{IndexState, IndexStateSearchOnly};
use context_connectors_core::store::{validate_index_name, IndexStateReader, IndexStateStore};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const DEFAULT_BASE_DIR: &str = ".context-connectors";
const STATE_FILE: &str = "state.json";
const SEARCH_FILE: &str = "search.json";

pub struct FilesystemStore {
    base: PathBuf,
}

impl FilesystemStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn index_dir(&self, name: &str) -> Result<PathBuf> {
        validate_index_name(name)?;
        Ok(self.base.join(name))
    }
}

impl Default for FilesystemStore {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Corrupt index file {}", path.display()))?;
    Ok(Some(value))
}

async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[async_trait]
impl IndexStateReader for FilesystemStore {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        read_json(&self.index_dir(name)?.join(STATE_FILE)).await
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        read_json(&self.index_dir(name)?.join(SEARCH_FILE)).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut reader = match tokio::fs::read_dir(&self.base).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.base.display()))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let has_state = tokio::fs::try_exists(dir.join(STATE_FILE)).await?;
            let has_search = tokio::fs::try_exists(dir.join(SEARCH_FILE)).await?;
            if has_state || has_search {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl IndexStateStore for FilesystemStore {
    async fn save(&self, name: &str, state: &IndexState) -> Result<()> {
        let dir = self.index_dir(name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let state_json = serde_json::to_vec_pretty(state)?;
        let search_json = serde_json::to_vec(&state.to_search_only())?;
        atomic_write(&dir.join(STATE_FILE), &state_json).await?;
        atomic_write(&dir.join(SEARCH_FILE), &search_json).await?;
        debug!(index = name, dir = %dir.display(), "saved index state");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let dir = self.index_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", dir.display())),
        }
    }
}

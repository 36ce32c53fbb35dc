//! In-memory [`IndexStateStore`] for tests and embedding.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{IndexState, IndexStateSearchOnly};

use super::{IndexStateReader, IndexStateStore};

struct StoredIndex {
    /// Absent for entries seeded search-only.
    state: Option<IndexState>,
    search: IndexStateSearchOnly,
}

/// In-memory store keyed by index name.
pub struct InMemoryStore {
    indexes: RwLock<HashMap<String, StoredIndex>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Seed an entry that only supports querying, the way a read-only
    /// remote backend would hold it.
    pub fn insert_search_only(&self, name: &str, search: IndexStateSearchOnly) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        indexes.insert(
            name.to_string(),
            StoredIndex {
                state: None,
                search,
            },
        );
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStateReader for InMemoryStore {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        Ok(indexes.get(name).and_then(|s| s.state.clone()))
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        Ok(indexes.get(name).map(|s| s.search.clone()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        let mut names: Vec<String> = indexes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl IndexStateStore for InMemoryStore {
    async fn save(&self, name: &str, state: &IndexState) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        indexes.insert(
            name.to_string(),
            StoredIndex {
                state: Some(state.clone()),
                search: state.to_search_only(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        indexes.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileEntry, FilesystemSourceRef, SourceMetadata};
    use chrono::Utc;

    fn state(files: &[&str]) -> IndexState {
        IndexState::from_entries(
            SourceMetadata::Filesystem {
                config: FilesystemSourceRef {
                    root: "/tmp/docs".to_string(),
                },
                resolved_ref: "r1".to_string(),
                synced_at: Utc::now(),
            },
            files.iter().map(|p| FileEntry::new(*p, "x")).collect(),
        )
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = InMemoryStore::new();
        assert!(store.load_state("docs").await.unwrap().is_none());

        store.save("docs", &state(&["a.md"])).await.unwrap();
        let loaded = store.load_state("docs").await.unwrap().unwrap();
        assert_eq!(loaded.file_paths(), vec!["a.md"]);
        let search = store.load_search("docs").await.unwrap().unwrap();
        assert_eq!(search.documents.len(), 1);

        store.delete("docs").await.unwrap();
        assert!(store.load_state("docs").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_only_entry_has_no_state() {
        let store = InMemoryStore::new();
        store
            .insert_search_only("remote", state(&["a.md"]).to_search_only())
            .unwrap();
        assert!(store.load_state("remote").await.unwrap().is_none());
        assert!(store.load_search("remote").await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap(), vec!["remote"]);
    }
}

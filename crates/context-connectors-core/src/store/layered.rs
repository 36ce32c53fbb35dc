//! Read-only composition of a primary and a remote backend.
//!
//! Precedence is fixed: the primary store shadows any same-named remote
//! index. Loads go to the primary first and only reach the remote on a
//! miss. Listing queries both concurrently and returns the sorted union.
//!
//! ```text
//!             load_state("x")
//!                   │
//!           ┌───────▼───────┐  Some ──▶ return
//!           │    primary    │
//!           └───────┬───────┘
//!                   │ None
//!           ┌───────▼───────┐
//!           │    remote     │ ──▶ Some / None / Err
//!           └───────────────┘
//! ```
//!
//! There is no write path: remote-backed indexes are not locally owned.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{IndexState, IndexStateSearchOnly};

use super::IndexStateReader;

/// Primary-wins view over two [`IndexStateReader`]s.
pub struct LayeredStore<P, R> {
    primary: P,
    remote: R,
}

impl<P: IndexStateReader, R: IndexStateReader> LayeredStore<P, R> {
    pub fn new(primary: P, remote: R) -> Self {
        Self { primary, remote }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }
}

#[async_trait]
impl<P: IndexStateReader, R: IndexStateReader> IndexStateReader for LayeredStore<P, R> {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        if let Some(state) = self.primary.load_state(name).await? {
            return Ok(Some(state));
        }
        self.remote.load_state(name).await
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        if let Some(search) = self.primary.load_search(name).await? {
            return Ok(Some(search));
        }
        self.remote.load_search(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let (primary, remote) = futures::try_join!(self.primary.list(), self.remote.list())?;
        let names: BTreeSet<String> = primary.into_iter().chain(remote).collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileEntry, SourceMetadata, WebsiteSourceRef};
    use crate::store::memory::InMemoryStore;
    use crate::store::IndexStateStore;
    use anyhow::bail;
    use chrono::Utc;
    use std::time::Duration;

    fn state(resolved: &str, files: &[&str]) -> IndexState {
        IndexState::from_entries(
            SourceMetadata::Website {
                config: WebsiteSourceRef {
                    url: "https://docs.example.com".to_string(),
                },
                resolved_ref: resolved.to_string(),
                synced_at: Utc::now(),
            },
            files.iter().map(|p| FileEntry::new(*p, "body")).collect(),
        )
    }

    async fn store_with(names: &[&str], resolved: &str) -> InMemoryStore {
        let store = InMemoryStore::new();
        for name in names {
            store.save(name, &state(resolved, &["index.md"])).await.unwrap();
        }
        store
    }

    /// Backend that always fails, standing in for an unreachable remote.
    struct Unreachable;

    #[async_trait]
    impl IndexStateReader for Unreachable {
        async fn load_state(&self, _name: &str) -> Result<Option<IndexState>> {
            bail!("connection refused")
        }
        async fn load_search(&self, _name: &str) -> Result<Option<IndexStateSearchOnly>> {
            bail!("connection refused")
        }
        async fn list(&self) -> Result<Vec<String>> {
            bail!("connection refused")
        }
    }

    /// Wraps a reader and delays its listing.
    struct Slow<T> {
        inner: T,
        delay: Duration,
    }

    #[async_trait]
    impl<T: IndexStateReader> IndexStateReader for Slow<T> {
        async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
            self.inner.load_state(name).await
        }
        async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
            self.inner.load_search(name).await
        }
        async fn list(&self) -> Result<Vec<String>> {
            tokio::time::sleep(self.delay).await;
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_list_union_sorted_dedup() {
        let layered = LayeredStore::new(
            store_with(&["b", "a"], "p").await,
            store_with(&["c", "b"], "r").await,
        );
        assert_eq!(layered.list().await.unwrap(), vec!["a", "b", "c"]);
        // Idempotent.
        assert_eq!(layered.list().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_list_independent_of_arrival_order() {
        let slow_primary = LayeredStore::new(
            Slow {
                inner: store_with(&["a", "b"], "p").await,
                delay: Duration::from_millis(30),
            },
            store_with(&["b", "c"], "r").await,
        );
        let slow_remote = LayeredStore::new(
            store_with(&["a", "b"], "p").await,
            Slow {
                inner: store_with(&["b", "c"], "r").await,
                delay: Duration::from_millis(30),
            },
        );
        assert_eq!(slow_primary.list().await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(slow_remote.list().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_list_runs_backends_concurrently() {
        let delay = Duration::from_millis(200);
        let layered = LayeredStore::new(
            Slow {
                inner: store_with(&["a"], "p").await,
                delay,
            },
            Slow {
                inner: store_with(&["b"], "r").await,
                delay,
            },
        );
        let started = std::time::Instant::now();
        layered.list().await.unwrap();
        assert!(started.elapsed() < delay * 2);
    }

    #[tokio::test]
    async fn test_primary_wins() {
        let layered = LayeredStore::new(
            store_with(&["x"], "primary-ref").await,
            store_with(&["x"], "remote-ref").await,
        );
        let state = layered.load_state("x").await.unwrap().unwrap();
        assert_eq!(state.source.resolved_ref(), "primary-ref");
        let search = layered.load_search("x").await.unwrap().unwrap();
        assert_eq!(search.source.resolved_ref(), "primary-ref");
    }

    #[tokio::test]
    async fn test_remote_used_on_primary_miss() {
        let layered = LayeredStore::new(
            store_with(&[], "p").await,
            store_with(&["y"], "remote-ref").await,
        );
        let state = layered.load_state("y").await.unwrap().unwrap();
        assert_eq!(state.source.resolved_ref(), "remote-ref");
        assert!(layered.load_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_only_remote() {
        let remote = InMemoryStore::new();
        remote
            .insert_search_only("y", state("r", &["a.md"]).to_search_only())
            .unwrap();
        let layered = LayeredStore::new(InMemoryStore::new(), remote);
        assert!(layered.load_state("y").await.unwrap().is_none());
        assert!(layered.load_search("y").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_primary_hit_masks_unreachable_remote() {
        let layered = LayeredStore::new(store_with(&["x"], "p").await, Unreachable);
        assert!(layered.load_state("x").await.unwrap().is_some());
        assert!(layered.load_search("x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_remote_propagates_on_miss() {
        let layered = LayeredStore::new(store_with(&["x"], "p").await, Unreachable);
        let err = layered.load_state("y").await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(layered.load_search("y").await.is_err());
        assert!(layered.list().await.is_err());
    }
}

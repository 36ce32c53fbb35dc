//! Index-state storage abstraction.
//!
//! Every backend exposes the read contract [`IndexStateReader`]. Backends
//! that own their data also implement [`IndexStateStore`] for writes.
//! Index names are the primary key within each backend.
//!
//! | Backend | Crate | Writable |
//! |---------|-------|----------|
//! | [`memory::InMemoryStore`] | core | yes |
//! | [`layered::LayeredStore`] | core | no |
//! | `FilesystemStore`, `SqliteStore`, `S3Store` | `context-connectors` | yes |
//!
//! Not-found is `Ok(None)`; backend and transport failures are `Err` and are
//! never folded into `None`.

pub mod layered;
pub mod memory;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{IndexState, IndexStateSearchOnly};

/// Read access to named index states.
#[async_trait]
pub trait IndexStateReader: Send + Sync {
    /// Full state, including what incremental sync needs.
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>>;

    /// Query-only projection.
    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>>;

    /// Names of all indexes held by this backend.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Write access to named index states.
///
/// At most one writer per index name is assumed; backends without a
/// conditional update leave that to the caller.
#[async_trait]
pub trait IndexStateStore: IndexStateReader {
    /// Persist `state` and its search-only projection under `name`.
    async fn save(&self, name: &str, state: &IndexState) -> Result<()>;

    /// Remove `name`. Deleting a missing index is not an error.
    async fn delete(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl<T: IndexStateReader + ?Sized> IndexStateReader for Arc<T> {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        (**self).load_state(name).await
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        (**self).load_search(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }
}

#[async_trait]
impl<T: IndexStateReader + ?Sized> IndexStateReader for Box<T> {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        (**self).load_state(name).await
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        (**self).load_search(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }
}

/// Reject names that cannot be used as a single path or key segment.
pub fn validate_index_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("index name must not be empty");
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!(
            "invalid index name '{}': must not contain '/', '\\' or '..'",
            name
        );
    }
    Ok(())
}

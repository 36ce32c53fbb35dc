//! SQLite-backed index-state store.
//!
//! One row per index in `index_states`, holding the full state and its
//! search-only projection as JSON. Each row carries a `revision` that is
//! bumped on every write.
//!
//! A store instance remembers the revision it saw when it last loaded or
//! saved an index. A later [`save`](IndexStateStore::save) only succeeds if
//! the row still has that revision, so two writers that both loaded the
//! same state cannot silently overwrite each other. A writer that never
//! loaded the index writes unconditionally.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use context_connectors_core::models::{IndexState, IndexStateSearchOnly};
use context_connectors_core::store::{validate_index_name, IndexStateReader, IndexStateStore};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::{db, migrate};

pub struct SqliteStore {
    pool: SqlitePool,
    /// Last revision observed per index. `Some(None)` means "seen absent".
    seen: Mutex<HashMap<String, Option<i64>>>,
}

impl SqliteStore {
    /// Open the database at `path`, creating file and schema as needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn remember(&self, name: &str, revision: Option<i64>) -> Result<()> {
        self.seen
            .lock()
            .map_err(|_| anyhow!("sqlite store lock poisoned"))?
            .insert(name.to_string(), revision);
        Ok(())
    }

    fn last_seen(&self, name: &str) -> Result<Option<Option<i64>>> {
        Ok(self
            .seen
            .lock()
            .map_err(|_| anyhow!("sqlite store lock poisoned"))?
            .get(name)
            .copied())
    }
}

#[async_trait]
impl IndexStateReader for SqliteStore {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        validate_index_name(name)?;
        let row = sqlx::query("SELECT state_json, revision FROM index_states WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.get("state_json");
                let revision: i64 = row.get("revision");
                let state = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt state for index '{}'", name))?;
                self.remember(name, Some(revision))?;
                Ok(Some(state))
            }
            None => {
                self.remember(name, None)?;
                Ok(None)
            }
        }
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        validate_index_name(name)?;
        let json: Option<String> =
            sqlx::query_scalar("SELECT search_json FROM index_states WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        json.map(|j| {
            serde_json::from_str(&j)
                .with_context(|| format!("Corrupt search state for index '{}'", name))
        })
        .transpose()
    }

    async fn list(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM index_states ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }
}

#[async_trait]
impl IndexStateStore for SqliteStore {
    async fn save(&self, name: &str, state: &IndexState) -> Result<()> {
        validate_index_name(name)?;
        let state_json = serde_json::to_string(state)?;
        let search_json = serde_json::to_string(&state.to_search_only())?;
        let source_type = state.source.source_type().as_str();
        let now = Utc::now().timestamp();

        let revision: i64 = match self.last_seen(name)? {
            Some(Some(expected)) => {
                let result = sqlx::query(
                    r#"
                    UPDATE index_states
                    SET source_type = ?, state_json = ?, search_json = ?,
                        revision = revision + 1, updated_at = ?
                    WHERE name = ? AND revision = ?
                    "#,
                )
                .bind(source_type)
                .bind(&state_json)
                .bind(&search_json)
                .bind(now)
                .bind(name)
                .bind(expected)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    bail!(
                        "index '{}' was modified by another writer since it was loaded",
                        name
                    );
                }
                expected + 1
            }
            Some(None) => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO index_states
                        (name, source_type, state_json, search_json, revision, updated_at)
                    VALUES (?, ?, ?, ?, 1, ?)
                    ON CONFLICT(name) DO NOTHING
                    "#,
                )
                .bind(name)
                .bind(source_type)
                .bind(&state_json)
                .bind(&search_json)
                .bind(now)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    bail!(
                        "index '{}' was created by another writer since it was loaded",
                        name
                    );
                }
                1
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO index_states
                        (name, source_type, state_json, search_json, revision, updated_at)
                    VALUES (?, ?, ?, ?, 1, ?)
                    ON CONFLICT(name) DO UPDATE SET
                        source_type = excluded.source_type,
                        state_json = excluded.state_json,
                        search_json = excluded.search_json,
                        revision = index_states.revision + 1,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(name)
                .bind(source_type)
                .bind(&state_json)
                .bind(&search_json)
                .bind(now)
                .execute(&self.pool)
                .await?;
                sqlx::query_scalar("SELECT revision FROM index_states WHERE name = ?")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        self.remember(name, Some(revision))?;
        debug!(index = name, revision, files = state.files.len(), "saved index state");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_index_name(name)?;
        sqlx::query("DELETE FROM index_states WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.remember(name, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_connectors_core::models::{FileEntry, FilesystemSourceRef, SourceMetadata};
    use tempfile::TempDir;

    fn state(resolved: &str, files: &[(&str, &str)]) -> IndexState {
        let source = SourceMetadata::Filesystem {
            config: FilesystemSourceRef {
                root: "/srv/notes".into(),
            },
            resolved_ref: resolved.into(),
            synced_at: Utc::now(),
        };
        IndexState::from_entries(
            source,
            files.iter().map(|(p, c)| FileEntry::new(*p, *c)).collect(),
        )
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("db/ctxc.sqlite")).await.unwrap();

        assert!(store.load_state("notes").await.unwrap().is_none());
        let s = state("r1", &[("a.md", "alpha"), ("b.md", "beta")]);
        store.save("notes", &s).await.unwrap();

        let loaded = store.load_state("notes").await.unwrap().unwrap();
        assert_eq!(loaded, s);
        let search = store.load_search("notes").await.unwrap().unwrap();
        assert_eq!(search.documents.len(), 2);
        assert_eq!(search.source.resolved_ref(), "r1");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("ctxc.sqlite")).await.unwrap();
        store.save("zeta", &state("r", &[])).await.unwrap();
        store.save("alpha", &state("r", &[])).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["alpha", "zeta"]);

        store.delete("zeta").await.unwrap();
        store.delete("missing").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["alpha"]);
        assert!(store.load_search("zeta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_saves_by_one_writer() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("ctxc.sqlite")).await.unwrap();
        store.load_state("notes").await.unwrap();
        store.save("notes", &state("r1", &[])).await.unwrap();
        store.save("notes", &state("r2", &[])).await.unwrap();
        let loaded = store.load_state("notes").await.unwrap().unwrap();
        assert_eq!(loaded.source.resolved_ref(), "r2");
    }

    #[tokio::test]
    async fn test_lost_update_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ctxc.sqlite");
        let first = SqliteStore::open(&path).await.unwrap();
        let second = SqliteStore::open(&path).await.unwrap();
        first.save("notes", &state("r0", &[])).await.unwrap();

        first.load_state("notes").await.unwrap();
        second.load_state("notes").await.unwrap();

        first.save("notes", &state("r1", &[])).await.unwrap();
        let err = second.save("notes", &state("r2", &[])).await.unwrap_err();
        assert!(err.to_string().contains("another writer"));

        let loaded = first.load_state("notes").await.unwrap().unwrap();
        assert_eq!(loaded.source.resolved_ref(), "r1");
    }

    #[tokio::test]
    async fn test_concurrent_create_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ctxc.sqlite");
        let first = SqliteStore::open(&path).await.unwrap();
        let second = SqliteStore::open(&path).await.unwrap();

        assert!(first.load_state("notes").await.unwrap().is_none());
        assert!(second.load_state("notes").await.unwrap().is_none());
        first.save("notes", &state("r1", &[])).await.unwrap();
        assert!(second.save("notes", &state("r2", &[])).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_name() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("ctxc.sqlite")).await.unwrap();
        assert!(store.load_state("../etc").await.is_err());
        assert!(store.save("a/b", &state("r", &[])).await.is_err());
    }
}

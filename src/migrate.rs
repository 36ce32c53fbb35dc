use anyhow::Result;
use sqlx::SqlitePool;

/// Create the index-state schema. Safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per index; `revision` backs the conditional update in SqliteStore.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_states (
            name TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            state_json TEXT NOT NULL,
            search_json TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_states_updated_at ON index_states(updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

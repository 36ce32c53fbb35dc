//! Sync driver.
//!
//! Brings one named index up to date with its [`Source`]:
//!
//! 1. Load the previous [`IndexState`] from the store.
//! 2. If there is one (and `--full` was not requested), ask the source for
//!    an incremental delta. `None` means the delta cannot be computed and
//!    the driver falls back to a full fetch.
//! 3. Otherwise fetch everything and replace the file set.
//! 4. Stamp the state with fresh [`SourceMetadata`](context_connectors_core::models::SourceMetadata)
//!    and save it.

use std::fmt;

use anyhow::{bail, Context, Result};
use context_connectors_core::models::{IndexState, SourceType};
use context_connectors_core::source::Source;
use context_connectors_core::store::{IndexStateReader, IndexStateStore};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Skip change detection and re-fetch everything.
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub total_files: usize,
    pub resolved_ref: String,
}

pub async fn run_sync(
    name: &str,
    source: &dyn Source,
    store: &dyn IndexStateStore,
    options: SyncOptions,
) -> Result<SyncReport> {
    // Loaded even for --full so stores with conditional writes see the
    // current revision; a corrupt previous state must not block a full sync.
    let previous = match store.load_state(name).await {
        Ok(state) => state,
        Err(e) if options.full => {
            warn!(index = name, error = %e, "ignoring unreadable previous state for full sync");
            None
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to load index '{}'", name)),
    };

    if let Some(prev) = &previous {
        let stored = prev.source.source_type();
        if !options.full && stored != source.source_type() {
            bail!(
                "index '{}' was built from a {} source but is configured as {}; re-run with --full",
                name,
                stored,
                source.source_type()
            );
        }
    }

    let incremental = match (&previous, options.full) {
        (Some(prev), false) => source.fetch_changes(&prev.source).await?,
        _ => None,
    };

    let (mut state, mode, added, modified, removed) = match (incremental, previous) {
        (Some(changes), Some(mut state)) => {
            let counts = (changes.added.len(), changes.modified.len(), changes.removed.len());
            state.apply_changes(changes);
            (state, SyncMode::Incremental, counts.0, counts.1, counts.2)
        }
        (_, previous) => {
            if previous.is_some() && !options.full {
                info!(index = name, "incremental sync not possible, running full sync");
            }
            let entries = source.fetch_all().await?;
            let metadata = source.get_metadata().await?;
            let state = IndexState::from_entries(metadata, entries);
            let (added, modified, removed) = match &previous {
                Some(prev) => diff_counts(prev, &state),
                None => (state.files.len(), 0, 0),
            };
            (state, SyncMode::Full, added, modified, removed)
        }
    };

    if mode == SyncMode::Incremental {
        state.source = source.get_metadata().await?;
    }

    store
        .save(name, &state)
        .await
        .with_context(|| format!("Failed to save index '{}'", name))?;

    let report = SyncReport {
        mode,
        added,
        modified,
        removed,
        total_files: state.files.len(),
        resolved_ref: state.source.resolved_ref().to_string(),
    };
    info!(
        index = name,
        mode = %report.mode,
        added = report.added,
        modified = report.modified,
        removed = report.removed,
        total = report.total_files,
        "sync complete"
    );
    Ok(report)
}

/// (added, modified, removed) between two full file sets.
fn diff_counts(before: &IndexState, after: &IndexState) -> (usize, usize, usize) {
    let mut added = 0;
    let mut modified = 0;
    for (path, file) in &after.files {
        match before.files.get(path) {
            None => added += 1,
            Some(old) if old.hash != file.hash => modified += 1,
            Some(_) => {}
        }
    }
    let removed = before
        .files
        .keys()
        .filter(|p| !after.files.contains_key(*p))
        .count();
    (added, modified, removed)
}

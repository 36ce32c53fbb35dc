//! The source capability contract.
//!
//! A [`Source`] is any content provider that can be indexed: a git
//! repository, a local directory, a website. Implementations are chosen
//! from configuration at construction time and used only through this
//! trait.
//!
//! # Indexing vs. client operations
//!
//! | Method | Group | Purpose |
//! |--------|-------|---------|
//! | [`fetch_all`](Source::fetch_all) | indexing | Full enumeration, filtered |
//! | [`fetch_changes`](Source::fetch_changes) | indexing | Delta since a previous sync, or `None` |
//! | [`get_metadata`](Source::get_metadata) | indexing | State to store for the next sync |
//! | [`list_files`](Source::list_files) | client | Live, non-recursive listing |
//! | [`read_file`](Source::read_file) | client | Live single-file read |
//!
//! Indexing operations populate the persisted index. Client operations
//! serve browsing tools and read the source directly, independent of any
//! stored index.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{FileChanges, FileEntry, FileInfo, SourceMetadata, SourceType};

/// A content provider that can be enumerated, diffed, and read.
#[async_trait]
pub trait Source: Send + Sync {
    /// The kind of metadata this source produces.
    fn source_type(&self) -> SourceType;

    /// Enumerate every indexable file.
    ///
    /// Entries are already filtered. Repeatable, and never mutates the
    /// remote.
    async fn fetch_all(&self) -> Result<Vec<FileEntry>>;

    /// Compute the delta since `previous`.
    ///
    /// `Ok(None)` means an incremental sync is not possible and the caller
    /// must fall back to [`fetch_all`](Source::fetch_all). This is an
    /// expected outcome, not an error. Entries inside `Some` are already
    /// filtered.
    async fn fetch_changes(&self, previous: &SourceMetadata) -> Result<Option<FileChanges>>;

    /// Current resolved state of the source, stored after each sync.
    async fn get_metadata(&self) -> Result<SourceMetadata>;

    /// Non-recursive children of `directory` (root when `None`).
    async fn list_files(&self, directory: Option<&str>) -> Result<Vec<FileInfo>>;

    /// Read one file. `Ok(None)` when it does not exist or is unreadable.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

//! Core data models used throughout Context Connectors.
//!
//! These types represent the files produced by a [`Source`](crate::source::Source),
//! the metadata recorded after each sync, and the durable index state that
//! flows between the sync driver and the stores.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Persisted layout version of [`IndexState`] and [`IndexStateSearchOnly`].
pub const INDEX_STATE_VERSION: u32 = 1;

/// A file produced by a source: relative POSIX-style path plus raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub contents: Vec<u8>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Size of the contents in bytes.
    pub fn size(&self) -> usize {
        self.contents.len()
    }

    /// The contents as text, if they are valid UTF-8.
    pub fn contents_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.contents).ok()
    }
}

/// Lightweight listing record returned by [`Source::list_files`](crate::source::Source::list_files).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub is_directory: bool,
}

impl FileInfo {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: false,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: true,
        }
    }
}

/// Delta produced by an incremental fetch.
///
/// `added` and `modified` carry full contents; `removed` carries bare paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    pub added: Vec<FileEntry>,
    pub modified: Vec<FileEntry>,
    pub removed: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of changed paths.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Discriminator of a [`SourceMetadata`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Filesystem,
    Website,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Git => "git",
            SourceType::Filesystem => "filesystem",
            SourceType::Website => "website",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a git source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSourceRef {
    pub url: String,
    pub branch: String,
}

/// Identity of a local directory source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSourceRef {
    pub root: String,
}

/// Identity of a website source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteSourceRef {
    pub url: String,
}

/// State recorded after a sync and compared against on the next one.
///
/// Serialized with a `"type"` discriminator, e.g.
///
/// ```json
/// {"type":"git","config":{"url":"...","branch":"main"},
///  "resolvedRef":"3f2a...","syncedAt":"2026-01-05T10:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SourceMetadata {
    Git {
        config: GitSourceRef,
        resolved_ref: String,
        synced_at: DateTime<Utc>,
    },
    Filesystem {
        config: FilesystemSourceRef,
        resolved_ref: String,
        synced_at: DateTime<Utc>,
    },
    Website {
        config: WebsiteSourceRef,
        resolved_ref: String,
        synced_at: DateTime<Utc>,
    },
}

impl SourceMetadata {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceMetadata::Git { .. } => SourceType::Git,
            SourceMetadata::Filesystem { .. } => SourceType::Filesystem,
            SourceMetadata::Website { .. } => SourceType::Website,
        }
    }

    /// The commit or version actually synced.
    pub fn resolved_ref(&self) -> &str {
        match self {
            SourceMetadata::Git { resolved_ref, .. }
            | SourceMetadata::Filesystem { resolved_ref, .. }
            | SourceMetadata::Website { resolved_ref, .. } => resolved_ref,
        }
    }

    pub fn synced_at(&self) -> DateTime<Utc> {
        match self {
            SourceMetadata::Git { synced_at, .. }
            | SourceMetadata::Filesystem { synced_at, .. }
            | SourceMetadata::Website { synced_at, .. } => *synced_at,
        }
    }
}

/// A single file held in an [`IndexState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: String,
    /// Hex SHA-256 of `contents`.
    pub hash: String,
    pub contents: String,
}

impl IndexedFile {
    pub fn from_entry(entry: FileEntry) -> Self {
        let hash = content_hash(&entry.contents);
        let contents = match String::from_utf8(entry.contents) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Self {
            path: entry.path,
            hash,
            contents,
        }
    }
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Full durable state of one named index.
///
/// Holds every indexed file plus the [`SourceMetadata`] used to compute the
/// next incremental sync. Stores move this value opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub version: u32,
    pub source: SourceMetadata,
    pub files: BTreeMap<String, IndexedFile>,
}

impl IndexState {
    /// Build a state from a complete, already-filtered file set.
    pub fn from_entries(source: SourceMetadata, entries: Vec<FileEntry>) -> Self {
        let files = entries
            .into_iter()
            .map(|e| (e.path.clone(), IndexedFile::from_entry(e)))
            .collect();
        Self {
            version: INDEX_STATE_VERSION,
            source,
            files,
        }
    }

    /// Apply an incremental delta. Removals are applied before additions so
    /// that a rename expressed as remove+add lands on the new path.
    pub fn apply_changes(&mut self, changes: FileChanges) {
        for path in &changes.removed {
            self.files.remove(path);
        }
        for entry in changes.added.into_iter().chain(changes.modified) {
            self.files
                .insert(entry.path.clone(), IndexedFile::from_entry(entry));
        }
    }

    /// Indexed paths in sorted order.
    pub fn file_paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// Project to the reduced, query-only form.
    pub fn to_search_only(&self) -> IndexStateSearchOnly {
        IndexStateSearchOnly {
            version: self.version,
            source: self.source.clone(),
            documents: self
                .files
                .values()
                .map(|f| SearchDocument {
                    path: f.path.clone(),
                    contents: f.contents.clone(),
                })
                .collect(),
        }
    }
}

/// A document as seen by the search engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub path: String,
    pub contents: String,
}

/// Query-only projection of an [`IndexState`].
///
/// Carries no content hashes, so it cannot drive change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStateSearchOnly {
    pub version: u32,
    pub source: SourceMetadata,
    pub documents: Vec<SearchDocument>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn git_meta(sha: &str) -> SourceMetadata {
        SourceMetadata::Git {
            config: GitSourceRef {
                url: "https://github.com/acme/docs.git".to_string(),
                branch: "main".to_string(),
            },
            resolved_ref: sha.to_string(),
            synced_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_metadata_json_shape() {
        let json = serde_json::to_value(git_meta("abc123")).unwrap();
        assert_eq!(json["type"], "git");
        assert_eq!(json["config"]["branch"], "main");
        assert_eq!(json["resolvedRef"], "abc123");
        assert_eq!(json["syncedAt"], "2026-01-05T10:00:00Z");

        let back: SourceMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, git_meta("abc123"));
        assert_eq!(back.source_type(), SourceType::Git);
    }

    #[test]
    fn test_apply_changes_rename() {
        let mut state = IndexState::from_entries(
            git_meta("a"),
            vec![
                FileEntry::new("old.md", "hello"),
                FileEntry::new("keep.md", "keep"),
            ],
        );
        state.apply_changes(FileChanges {
            added: vec![FileEntry::new("new.md", "hello")],
            modified: vec![FileEntry::new("keep.md", "changed")],
            removed: vec!["old.md".to_string()],
        });
        assert_eq!(state.file_paths(), vec!["keep.md", "new.md"]);
        assert_eq!(state.files["keep.md"].contents, "changed");
        assert_eq!(state.files["keep.md"].hash, content_hash(b"changed"));
    }

    #[test]
    fn test_search_only_projection() {
        let state = IndexState::from_entries(
            git_meta("a"),
            vec![FileEntry::new("b.md", "B"), FileEntry::new("a.md", "A")],
        );
        let search = state.to_search_only();
        let paths: Vec<_> = search.documents.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md"]);
        assert_eq!(search.source, state.source);
    }

    #[test]
    fn test_file_changes_len() {
        let changes = FileChanges {
            added: vec![FileEntry::new("a", "")],
            modified: vec![],
            removed: vec!["b".to_string(), "c".to_string()],
        };
        assert_eq!(changes.len(), 3);
        assert!(!changes.is_empty());
        assert!(FileChanges::default().is_empty());
    }
}

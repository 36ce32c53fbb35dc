//! Local directory source.
//!
//! Walks a directory tree with `walkdir`, skipping `.git` and
//! `node_modules`, and applies root-level `.augmentignore`/`.gitignore`
//! rules plus the content filter.
//!
//! A plain directory has no change-tracking primitive, so
//! [`fetch_changes`](Source::fetch_changes) always requests a full sync.
//! The resolved ref is a digest of the walked tree's paths, sizes and
//! modification times.
//!
//! Paths registered with [`FilesystemSource::with_excluded_paths`] are never
//! walked. [`crate::sources`] registers the local store and git cache there,
//! so a root that contains them does not index its own state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use context_connectors_core::filter::{check_path, check_size};
use context_connectors_core::models::{
    FileChanges, FileEntry, FileInfo, FilesystemSourceRef, SourceMetadata, SourceType,
};
use context_connectors_core::source::Source;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;

use crate::ignore_rules::{IgnoreRules, ALWAYS_SKIPPED_DIRS};

pub struct FilesystemSource {
    root: PathBuf,
    max_file_size: usize,
    excluded: Vec<PathBuf>,
}

impl FilesystemSource {
    pub fn new(root: impl Into<PathBuf>, max_file_size: usize) -> Self {
        Self {
            root: root.into(),
            max_file_size,
            excluded: Vec::new(),
        }
    }

    /// Files or directories to leave out of every walk.
    pub fn with_excluded_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.excluded.extend(paths);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A file found by the walk, before its contents are read.
struct WalkedFile {
    relative: String,
    absolute: PathBuf,
    size: u64,
    modified_secs: u64,
}

/// Best-effort absolute form of `path`, also for paths that do not exist yet.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(p) => p.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

fn walk_tree(root: &Path, excluded: &[PathBuf]) -> Result<Vec<WalkedFile>> {
    if !root.is_dir() {
        anyhow::bail!("Filesystem source root does not exist: {}", root.display());
    }
    let root = resolve_path(root);
    let excluded: Vec<PathBuf> = excluded.iter().map(|p| resolve_path(p)).collect();

    let mut files = Vec::new();
    let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        if excluded.iter().any(|x| e.path() == x.as_path()) {
            debug!(path = %e.path().display(), "excluded from walk");
            return false;
        }
        !(e.file_type().is_dir()
            && ALWAYS_SKIPPED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
    });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        let modified_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        files.push(WalkedFile {
            relative: to_posix(relative),
            absolute: entry.path().to_path_buf(),
            size: metadata.len(),
            modified_secs,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn scan_tree(root: &Path, excluded: &[PathBuf], max_file_size: usize) -> Result<Vec<FileEntry>> {
    let rules = IgnoreRules::load(root, max_file_size)?;
    let mut entries = Vec::new();

    for file in walk_tree(root, excluded)? {
        let size = file.size as usize;
        // Everything up to the ignore files needs no contents.
        if let Some(reason) = check_path(&file.relative).or_else(|| check_size(size, max_file_size))
        {
            debug!(path = %file.relative, %reason, "filtered");
            continue;
        }
        if rules.is_ignored(&file.relative) {
            debug!(path = %file.relative, "filtered by ignore rules");
            continue;
        }

        let contents = std::fs::read(&file.absolute)
            .with_context(|| format!("Failed to read {}", file.absolute.display()))?;
        match rules.check(&file.relative, &contents).reason {
            Some(reason) => debug!(path = %file.relative, %reason, "filtered"),
            None => entries.push(FileEntry::new(file.relative, contents)),
        }
    }

    Ok(entries)
}

fn tree_digest(files: &[WalkedFile]) -> String {
    let mut hasher = Sha256::new();
    for f in files {
        hasher.update(f.relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(f.size.to_le_bytes());
        hasher.update(f.modified_secs.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Source for FilesystemSource {
    fn source_type(&self) -> SourceType {
        SourceType::Filesystem
    }

    async fn fetch_all(&self) -> Result<Vec<FileEntry>> {
        let root = self.root.clone();
        let excluded = self.excluded.clone();
        let max = self.max_file_size;
        tokio::task::spawn_blocking(move || scan_tree(&root, &excluded, max)).await?
    }

    async fn fetch_changes(&self, _previous: &SourceMetadata) -> Result<Option<FileChanges>> {
        debug!(root = %self.root.display(), "filesystem source has no change tracking");
        Ok(None)
    }

    async fn get_metadata(&self) -> Result<SourceMetadata> {
        let root = self.root.clone();
        let excluded = self.excluded.clone();
        let files = tokio::task::spawn_blocking(move || walk_tree(&root, &excluded)).await??;
        Ok(SourceMetadata::Filesystem {
            config: FilesystemSourceRef {
                root: self.root.display().to_string(),
            },
            resolved_ref: tree_digest(&files),
            synced_at: Utc::now(),
        })
    }

    async fn list_files(&self, directory: Option<&str>) -> Result<Vec<FileInfo>> {
        let dir = directory.unwrap_or("").trim_matches('/');
        if dir.contains("..") {
            return Ok(Vec::new());
        }
        let full = if dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir)
        };

        let mut reader = match tokio::fs::read_dir(&full).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", full.display()))
            }
        };

        let mut infos = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_directory = entry.file_type().await?.is_dir();
            if is_directory && ALWAYS_SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            let path = if dir.is_empty() {
                name
            } else {
                format!("{}/{}", dir, name)
            };
            infos.push(FileInfo { path, is_directory });
        }
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if path.contains("..") {
            return Ok(None);
        }
        match tokio::fs::read(self.root.join(path.trim_start_matches('/'))).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                debug!(path, error = %e, "read_file miss");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_connectors_core::filter::DEFAULT_MAX_FILE_SIZE;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join("dist")).unwrap();
        fs::write(root.join("README.md"), "# Readme").unwrap();
        fs::write(root.join("docs/guide.md"), "Guide body").unwrap();
        fs::write(root.join("id_rsa"), "not really a key").unwrap();
        fs::write(root.join("logo.png"), [0x89, 0x50, 0x4e, 0x47, 0xff, 0x00]).unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "module.exports = 1").unwrap();
        fs::write(root.join("dist/app.js"), "built").unwrap();
        fs::write(root.join(".gitignore"), "dist/\n").unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_fetch_all_filters() {
        let tmp = setup();
        let source = FilesystemSource::new(tmp.path(), DEFAULT_MAX_FILE_SIZE);
        let files = source.fetch_all().await.unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec![".gitignore", "README.md", "docs/guide.md"]);
        assert_eq!(files[1].contents, b"# Readme");
    }

    #[tokio::test]
    async fn test_oversized_file_skipped() {
        let tmp = setup();
        fs::write(tmp.path().join("big.txt"), vec![b'a'; 64]).unwrap();
        let source = FilesystemSource::new(tmp.path(), 32);
        let files = source.fetch_all().await.unwrap();
        assert!(files.iter().all(|f| f.path != "big.txt"));
        assert!(files.iter().any(|f| f.path == "README.md"));
    }

    #[tokio::test]
    async fn test_fetch_changes_requests_full_sync() {
        let tmp = setup();
        let source = FilesystemSource::new(tmp.path(), DEFAULT_MAX_FILE_SIZE);
        let meta = source.get_metadata().await.unwrap();
        assert!(source.fetch_changes(&meta).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metadata_digest_tracks_tree() {
        let tmp = setup();
        let source = FilesystemSource::new(tmp.path(), DEFAULT_MAX_FILE_SIZE);
        let first = source.get_metadata().await.unwrap();
        let again = source.get_metadata().await.unwrap();
        assert_eq!(first.resolved_ref(), again.resolved_ref());
        assert_eq!(first.source_type(), SourceType::Filesystem);

        fs::write(tmp.path().join("new.md"), "new").unwrap();
        let changed = source.get_metadata().await.unwrap();
        assert_ne!(first.resolved_ref(), changed.resolved_ref());
    }

    #[tokio::test]
    async fn test_excluded_paths_are_not_walked() {
        let tmp = setup();
        let root = tmp.path();
        fs::create_dir_all(root.join("data/.git-cache/abc")).unwrap();
        fs::write(root.join("data/.git-cache/abc/HEAD"), "ref: refs/heads/main").unwrap();
        fs::write(root.join("data/ctxc.sqlite"), "db").unwrap();
        fs::write(root.join("data/notes.md"), "kept").unwrap();

        let source = FilesystemSource::new(root, DEFAULT_MAX_FILE_SIZE).with_excluded_paths([
            root.join("data/ctxc.sqlite"),
            root.join("data/ctxc.sqlite-wal"),
            root.join("data/.git-cache"),
        ]);
        let before = source.get_metadata().await.unwrap();
        let paths: Vec<_> = source
            .fetch_all()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert!(paths.contains(&"data/notes.md".to_string()));
        assert!(!paths.iter().any(|p| p.starts_with("data/.git-cache")));
        assert!(!paths.contains(&"data/ctxc.sqlite".to_string()));

        // Store writes do not change the tree digest.
        fs::write(root.join("data/ctxc.sqlite-wal"), "wal").unwrap();
        fs::write(root.join("data/ctxc.sqlite"), "db, grown").unwrap();
        let after = source.get_metadata().await.unwrap();
        assert_eq!(before.resolved_ref(), after.resolved_ref());
    }

    #[tokio::test]
    async fn test_ignored_files_skipped_before_read() {
        let tmp = setup();
        // Unreadable contents would fail the read if it were attempted.
        let locked = tmp.path().join("dist/locked.bin");
        fs::write(&locked, [0xff, 0xfe]).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        }
        let source = FilesystemSource::new(tmp.path(), DEFAULT_MAX_FILE_SIZE);
        let files = source.fetch_all().await.unwrap();
        assert!(files.iter().all(|f| !f.path.starts_with("dist/")));
    }

    #[tokio::test]
    async fn test_list_files() {
        let tmp = setup();
        let source = FilesystemSource::new(tmp.path(), DEFAULT_MAX_FILE_SIZE);
        let root = source.list_files(None).await.unwrap();
        assert!(root.contains(&FileInfo::directory("docs")));
        assert!(root.contains(&FileInfo::file("README.md")));
        assert!(!root.iter().any(|f| f.path == "node_modules"));

        let docs = source.list_files(Some("docs")).await.unwrap();
        assert_eq!(docs, vec![FileInfo::file("docs/guide.md")]);
        assert!(source.list_files(Some("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_file() {
        let tmp = setup();
        let source = FilesystemSource::new(tmp.path(), DEFAULT_MAX_FILE_SIZE);
        assert_eq!(
            source.read_file("docs/guide.md").await.unwrap(),
            Some(b"Guide body".to_vec())
        );
        assert_eq!(source.read_file("missing.md").await.unwrap(), None);
        assert_eq!(source.read_file("../etc/passwd").await.unwrap(), None);
    }
}

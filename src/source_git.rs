//! Git repository source.
//!
//! Keeps a bare mirror of one branch in a local cache directory using the
//! `git` CLI, and reads every file straight from the object database at a
//! single resolved commit.
//!
//! Workflow:
//! 1. Clone the branch (bare, single-branch) or force-fetch it if the cache
//!    already exists.
//! 2. Resolve the branch to a commit once per [`GitSource`] instance, so
//!    that fetches and metadata agree on what was synced.
//! 3. Enumerate blobs with `git ls-tree` and read them in one
//!    `git cat-file --batch` pass.
//!
//! # Incremental sync
//!
//! [`fetch_changes`](Source::fetch_changes) diffs the previously synced
//! commit against the resolved one and returns `None` (full re-index) when:
//!
//! - the previous metadata belongs to another source,
//! - the previous commit is gone or is no longer an ancestor (force push),
//! - `.gitignore` or `.augmentignore` changed,
//! - more than [`MAX_INCREMENTAL_CHANGES`] paths changed.
//!
//! Only regular files are indexed. A path that turns into a symlink or a
//! submodule leaves the index, the same way a full fetch would skip it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use context_connectors_core::filter::{check_path, check_size};
use context_connectors_core::models::{
    FileChanges, FileEntry, FileInfo, GitSourceRef, SourceMetadata, SourceType,
};
use context_connectors_core::source::Source;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::ignore_rules::{is_ignore_file, IgnoreRules, AUGMENTIGNORE, GITIGNORE};

/// Above this many changed paths a full re-index is requested instead.
pub const MAX_INCREMENTAL_CHANGES: usize = 100;

pub struct GitSource {
    url: String,
    branch: String,
    cache_dir: PathBuf,
    max_file_size: usize,
    resolved: OnceCell<String>,
}

/// One change from `git diff --raw`, already reduced to indexable files.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DiffEntry {
    Added(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
}

/// One object returned by `git cat-file --batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchObject {
    Found { kind: String, contents: Vec<u8> },
    Missing,
}

impl GitSource {
    pub fn new(
        url: impl Into<String>,
        branch: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        max_file_size: usize,
    ) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            cache_dir: cache_dir.into(),
            max_file_size,
            resolved: OnceCell::new(),
        }
    }

    /// Default clone location: `<base>/.git-cache/<hash of url>`.
    pub fn default_cache_dir(base: &Path, url: &str) -> PathBuf {
        base.join(".git-cache").join(short_hash(url))
    }

    /// The commit this instance syncs, cloning or fetching on first use.
    async fn resolve(&self) -> Result<&str> {
        let sha = self
            .resolved
            .get_or_try_init(|| async {
                self.update_mirror().await?;
                let spec = format!("refs/heads/{}^{{commit}}", self.branch);
                let out = self.git(&["rev-parse", &spec]).await?;
                let sha = String::from_utf8_lossy(&out).trim().to_string();
                info!(url = %self.url, branch = %self.branch, commit = %sha, "resolved git ref");
                Ok::<_, anyhow::Error>(sha)
            })
            .await?;
        Ok(sha.as_str())
    }

    async fn update_mirror(&self) -> Result<()> {
        if self.cache_dir.join("HEAD").exists() {
            let refspec = format!("+refs/heads/{0}:refs/heads/{0}", self.branch);
            self.git(&["fetch", "--prune", &self.url, &refspec])
                .await
                .context("git fetch failed")?;
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create cache directory: {}",
                    self.cache_dir.display()
                )
            })?;
        let output = Command::new("git")
            .args(["clone", "--bare", "--single-branch", "--branch"])
            .arg(&self.branch)
            .arg(&self.url)
            .arg(&self.cache_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Run git in the mirror and return stdout, failing on non-zero exit.
    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.cache_dir)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args[0], stderr.trim());
        }
        Ok(output.stdout)
    }

    /// Run git and report only whether it exited successfully.
    async fn git_succeeds(&self, args: &[&str]) -> Result<bool> {
        let status = Command::new("git")
            .arg("--git-dir")
            .arg(&self.cache_dir)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;
        Ok(status.success())
    }

    /// Read many objects (`<oid>` or `<commit>:<path>`) in one process.
    async fn read_objects(&self, specs: &[String]) -> Result<Vec<BatchObject>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let mut child = Command::new("git")
            .arg("--git-dir")
            .arg(&self.cache_dir)
            .args(["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| "Failed to execute 'git cat-file'")?;

        let mut input = specs.join("\n");
        input.push('\n');
        let mut stdin = child.stdin.take().context("git cat-file stdin unavailable")?;
        let writer = tokio::spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git cat-file failed: {}", stderr.trim());
        }
        writer.await?.context("Failed to write to git cat-file")?;
        parse_batch_output(&output.stdout, specs.len())
    }

    async fn load_rules(&self, commit: &str) -> Result<IgnoreRules> {
        let specs = vec![
            format!("{}:{}", commit, AUGMENTIGNORE),
            format!("{}:{}", commit, GITIGNORE),
        ];
        let objects = self.read_objects(&specs).await?;
        let text = |obj: &BatchObject| match obj {
            BatchObject::Found { kind, contents } if kind == "blob" => {
                Some(String::from_utf8_lossy(contents).into_owned())
            }
            _ => None,
        };
        IgnoreRules::from_contents(
            text(&objects[0]).as_deref(),
            text(&objects[1]).as_deref(),
            self.max_file_size,
        )
    }

    /// Read and filter the given paths at `commit`.
    ///
    /// Returns kept entries and the paths that were rejected or are not blobs.
    async fn read_filtered(
        &self,
        commit: &str,
        paths: &[String],
        rules: &IgnoreRules,
    ) -> Result<(Vec<FileEntry>, Vec<String>)> {
        let specs: Vec<String> = paths.iter().map(|p| format!("{}:{}", commit, p)).collect();
        let objects = self.read_objects(&specs).await?;

        let mut kept = Vec::new();
        let mut rejected = Vec::new();
        for (path, object) in paths.iter().zip(objects) {
            match object {
                BatchObject::Found { kind, contents } if kind == "blob" => {
                    match rules.check(path, &contents).reason {
                        Some(reason) => {
                            debug!(path = %path, %reason, "filtered");
                            rejected.push(path.clone());
                        }
                        None => kept.push(FileEntry::new(path.clone(), contents)),
                    }
                }
                _ => rejected.push(path.clone()),
            }
        }
        Ok((kept, rejected))
    }
}

#[async_trait]
impl Source for GitSource {
    fn source_type(&self) -> SourceType {
        SourceType::Git
    }

    async fn fetch_all(&self) -> Result<Vec<FileEntry>> {
        let commit = self.resolve().await?.to_string();
        let rules = self.load_rules(&commit).await?;
        let listing = self.git(&["ls-tree", "-r", "-l", "-z", &commit]).await?;

        let mut candidates = Vec::new();
        for item in parse_ls_tree(&listing) {
            if item.kind != "blob" || !is_regular_file(&item.mode) {
                continue;
            }
            let size = item.size.unwrap_or(0);
            let early = check_path(&item.path).or_else(|| check_size(size, self.max_file_size));
            if let Some(reason) = early {
                debug!(path = %item.path, %reason, "filtered");
                continue;
            }
            if rules.is_ignored(&item.path) {
                debug!(path = %item.path, "filtered by ignore rules");
                continue;
            }
            candidates.push(item.path);
        }

        let (entries, _) = self.read_filtered(&commit, &candidates, &rules).await?;
        info!(commit = %commit, files = entries.len(), "fetched git tree");
        Ok(entries)
    }

    async fn fetch_changes(&self, previous: &SourceMetadata) -> Result<Option<FileChanges>> {
        let SourceMetadata::Git {
            config,
            resolved_ref: previous_ref,
            ..
        } = previous
        else {
            debug!("previous metadata is not from a git source");
            return Ok(None);
        };
        if config.url != self.url || config.branch != self.branch {
            debug!("previous metadata is for a different repository or branch");
            return Ok(None);
        }

        let current = self.resolve().await?.to_string();
        if *previous_ref == current {
            return Ok(Some(FileChanges::default()));
        }

        let previous_commit = format!("{}^{{commit}}", previous_ref);
        if !self.git_succeeds(&["cat-file", "-e", &previous_commit]).await? {
            info!(previous = %previous_ref, "previous commit not found, history rewritten");
            return Ok(None);
        }
        if !self
            .git_succeeds(&["merge-base", "--is-ancestor", previous_ref, &current])
            .await?
        {
            info!(previous = %previous_ref, current = %current, "previous commit is not an ancestor");
            return Ok(None);
        }

        let raw = self
            .git(&["diff", "--raw", "-z", "-M", previous_ref, &current])
            .await?;
        let Some(diff) = parse_raw_diff(&raw) else {
            info!("unrecognized diff status, falling back to full sync");
            return Ok(None);
        };

        let touched: Vec<&str> = diff
            .iter()
            .flat_map(|d| match d {
                DiffEntry::Renamed { from, to } => vec![from.as_str(), to.as_str()],
                DiffEntry::Added(p) | DiffEntry::Modified(p) | DiffEntry::Deleted(p) => {
                    vec![p.as_str()]
                }
            })
            .collect();
        if touched.iter().any(|p| is_ignore_file(p)) {
            info!("ignore rules changed, full re-index required");
            return Ok(None);
        }
        if touched.len() > MAX_INCREMENTAL_CHANGES {
            info!(
                changed = touched.len(),
                limit = MAX_INCREMENTAL_CHANGES,
                "too many changes for incremental sync"
            );
            return Ok(None);
        }

        let mut added_paths = Vec::new();
        let mut modified_paths = Vec::new();
        let mut changes = FileChanges::default();
        for entry in diff {
            match entry {
                DiffEntry::Added(p) => added_paths.push(p),
                DiffEntry::Modified(p) => modified_paths.push(p),
                DiffEntry::Deleted(p) => changes.removed.push(p),
                DiffEntry::Renamed { from, to } => {
                    changes.removed.push(from);
                    added_paths.push(to);
                }
            }
        }

        let rules = self.load_rules(&current).await?;
        let (added, _) = self.read_filtered(&current, &added_paths, &rules).await?;
        let (modified, now_rejected) = self
            .read_filtered(&current, &modified_paths, &rules)
            .await?;
        changes.added = added;
        changes.modified = modified;
        // A modified file that no longer passes the filter must leave the index.
        changes.removed.extend(now_rejected);

        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            "computed incremental changes"
        );
        Ok(Some(changes))
    }

    async fn get_metadata(&self) -> Result<SourceMetadata> {
        let commit = self.resolve().await?.to_string();
        Ok(SourceMetadata::Git {
            config: GitSourceRef {
                url: self.url.clone(),
                branch: self.branch.clone(),
            },
            resolved_ref: commit,
            synced_at: Utc::now(),
        })
    }

    async fn list_files(&self, directory: Option<&str>) -> Result<Vec<FileInfo>> {
        let dir = directory.unwrap_or("").trim_matches('/');
        if dir.contains("..") {
            return Ok(Vec::new());
        }
        let commit = self.resolve().await?.to_string();
        let listing = if dir.is_empty() {
            self.git(&["ls-tree", "-l", "-z", &commit]).await?
        } else {
            let prefix = format!("{}/", dir);
            self.git(&["ls-tree", "-l", "-z", &commit, "--", &prefix])
                .await?
        };
        Ok(parse_ls_tree(&listing)
            .into_iter()
            .map(|item| FileInfo {
                is_directory: item.kind == "tree",
                path: item.path,
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let path = path.trim_start_matches('/');
        if path.contains("..") || path.is_empty() {
            return Ok(None);
        }
        let commit = self.resolve().await?.to_string();
        let objects = self
            .read_objects(&[format!("{}:{}", commit, path)])
            .await?;
        Ok(match objects.into_iter().next() {
            Some(BatchObject::Found { kind, contents }) if kind == "blob" => Some(contents),
            _ => None,
        })
    }
}

/// One record of `git ls-tree -l -z`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeItem {
    mode: String,
    kind: String,
    size: Option<usize>,
    path: String,
}

fn parse_ls_tree(raw: &[u8]) -> Vec<TreeItem> {
    raw.split(|b| *b == 0)
        .filter(|r| !r.is_empty())
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let (meta, path) = record.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            let mode = fields.next()?.to_string();
            let kind = fields.next()?.to_string();
            let _oid = fields.next()?;
            let size = fields.next().and_then(|s| s.parse().ok());
            Some(TreeItem {
                mode,
                kind,
                size,
                path: path.to_string(),
            })
        })
        .collect()
}

/// Regular (possibly executable) file. Symlinks are `120000`, submodules `160000`.
fn is_regular_file(mode: &str) -> bool {
    mode.starts_with("100")
}

/// Parse `git diff --raw -z`. `None` on a record it cannot map.
///
/// Each record is `:<src mode> <dst mode> <src oid> <dst oid> <status>`
/// followed by one path, or two for renames and copies. Only regular files
/// are kept: a file that becomes a symlink or submodule is reported as
/// deleted, and changes among non-files are dropped.
fn parse_raw_diff(raw: &[u8]) -> Option<Vec<DiffEntry>> {
    let mut tokens = raw
        .split(|b| *b == 0)
        .filter(|t| !t.is_empty())
        .map(|t| String::from_utf8_lossy(t).into_owned());
    let mut entries = Vec::new();

    while let Some(meta) = tokens.next() {
        let fields: Vec<&str> = meta.strip_prefix(':')?.split(' ').collect();
        let [src_mode, dst_mode, _src_oid, _dst_oid, status] = fields[..] else {
            return None;
        };
        let was_file = is_regular_file(src_mode);
        let file = is_regular_file(dst_mode);
        match status.chars().next()? {
            'A' => {
                let path = tokens.next()?;
                if file {
                    entries.push(DiffEntry::Added(path));
                }
            }
            'C' => {
                let _source = tokens.next()?;
                let path = tokens.next()?;
                if file {
                    entries.push(DiffEntry::Added(path));
                }
            }
            'M' | 'T' => {
                let path = tokens.next()?;
                if file {
                    entries.push(DiffEntry::Modified(path));
                } else if was_file {
                    entries.push(DiffEntry::Deleted(path));
                }
            }
            'D' => {
                let path = tokens.next()?;
                if was_file {
                    entries.push(DiffEntry::Deleted(path));
                }
            }
            'R' => {
                let from = tokens.next()?;
                let to = tokens.next()?;
                match (was_file, file) {
                    (true, true) => entries.push(DiffEntry::Renamed { from, to }),
                    (true, false) => entries.push(DiffEntry::Deleted(from)),
                    (false, true) => entries.push(DiffEntry::Added(to)),
                    (false, false) => {}
                }
            }
            _ => return None,
        }
    }
    Some(entries)
}

/// Parse `git cat-file --batch` output for `expected` requests.
fn parse_batch_output(raw: &[u8], expected: usize) -> Result<Vec<BatchObject>> {
    let mut objects = Vec::with_capacity(expected);
    let mut rest = raw;

    while objects.len() < expected {
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .context("truncated git cat-file output")?;
        let header = String::from_utf8_lossy(&rest[..newline]).into_owned();
        rest = &rest[newline + 1..];

        let fields: Vec<&str> = header.split(' ').collect();
        if fields.last() == Some(&"missing") || fields.last() == Some(&"ambiguous") {
            objects.push(BatchObject::Missing);
            continue;
        }
        if fields.len() != 3 {
            bail!("unexpected git cat-file header: {}", header);
        }
        let size: usize = fields[2]
            .parse()
            .with_context(|| format!("bad object size in header: {}", header))?;
        if rest.len() < size + 1 {
            bail!("truncated git cat-file object body");
        }
        objects.push(BatchObject::Found {
            kind: fields[1].to_string(),
            contents: rest[..size].to_vec(),
        });
        rest = &rest[size + 1..];
    }

    Ok(objects)
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

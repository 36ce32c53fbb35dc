//! Ignore-file evaluation around the core content filter.
//!
//! The core filter has no file-tree context, so the two ignore files are
//! matched here and slotted into the fixed check order:
//!
//! ```text
//! dotdot → size → .augmentignore → keyish → .gitignore → encoding
//! ```
//!
//! Only root-level ignore files are honored. Patterns follow gitignore
//! syntax via the `ignore` crate.

use anyhow::{Context, Result};
use context_connectors_core::filter::{
    check_encoding, check_keyish, check_path, check_size, FilterDecision, FilterReason,
};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

pub const AUGMENTIGNORE: &str = ".augmentignore";
pub const GITIGNORE: &str = ".gitignore";

/// Directory names never descended into while walking a tree.
pub const ALWAYS_SKIPPED_DIRS: &[&str] = &[".git", "node_modules"];

/// Ignore rules plus the size limit for one source.
pub struct IgnoreRules {
    augmentignore: Option<Gitignore>,
    gitignore: Option<Gitignore>,
    max_file_size: usize,
}

impl IgnoreRules {
    /// Rules with no ignore files.
    pub fn new(max_file_size: usize) -> Self {
        Self {
            augmentignore: None,
            gitignore: None,
            max_file_size,
        }
    }

    /// Build from ignore-file contents fetched from a remote.
    pub fn from_contents(
        augmentignore: Option<&str>,
        gitignore: Option<&str>,
        max_file_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            augmentignore: augmentignore
                .map(|c| build_matcher(AUGMENTIGNORE, c))
                .transpose()?,
            gitignore: gitignore.map(|c| build_matcher(GITIGNORE, c)).transpose()?,
            max_file_size,
        })
    }

    /// Read `.augmentignore` and `.gitignore` from the root of a local tree.
    pub fn load(root: &Path, max_file_size: usize) -> Result<Self> {
        let augmentignore = read_optional(&root.join(AUGMENTIGNORE))?;
        let gitignore = read_optional(&root.join(GITIGNORE))?;
        Self::from_contents(
            augmentignore.as_deref(),
            gitignore.as_deref(),
            max_file_size,
        )
    }

    /// Run the full ordered check on one file.
    pub fn check(&self, path: &str, contents: &[u8]) -> FilterDecision {
        check_path(path)
            .or_else(|| check_size(contents.len(), self.max_file_size))
            .or_else(|| ignored_by(&self.augmentignore, path, "augmentignore"))
            .or_else(|| check_keyish(path))
            .or_else(|| ignored_by(&self.gitignore, path, "gitignore"))
            .or_else(|| check_encoding(contents))
            .into()
    }

    /// Whether `path` matches either ignore file, without looking at
    /// contents. Sources call it after the path and size checks to avoid
    /// reading files that [`check`](Self::check) would reject anyway.
    pub fn is_ignored(&self, path: &str) -> bool {
        ignored_by(&self.augmentignore, path, "augmentignore").is_some()
            || ignored_by(&self.gitignore, path, "gitignore").is_some()
    }
}

/// Whether a changed path is itself an ignore file, which invalidates
/// previous filtering decisions.
pub fn is_ignore_file(path: &str) -> bool {
    path == AUGMENTIGNORE || path == GITIGNORE
}

fn build_matcher(file_name: &str, contents: &str) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new("");
    for line in contents.lines() {
        builder
            .add_line(None, line)
            .with_context(|| format!("Invalid pattern in {}: {}", file_name, line))?;
    }
    builder
        .build()
        .with_context(|| format!("Failed to build matcher for {}", file_name))
}

fn ignored_by(matcher: &Option<Gitignore>, path: &str, rule: &str) -> Option<FilterReason> {
    let matcher = matcher.as_ref()?;
    matcher
        .matched_path_or_any_parents(path, false)
        .is_ignore()
        .then(|| FilterReason::Ignored {
            rule: rule.to_string(),
        })
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_connectors_core::filter::DEFAULT_MAX_FILE_SIZE;

    fn rules(augment: Option<&str>, git: Option<&str>) -> IgnoreRules {
        IgnoreRules::from_contents(augment, git, DEFAULT_MAX_FILE_SIZE).unwrap()
    }

    fn reason(rules: &IgnoreRules, path: &str, contents: &[u8]) -> Option<String> {
        rules.check(path, contents).reason.map(|r| r.to_string())
    }

    #[test]
    fn test_no_rules_matches_core_filter() {
        let r = IgnoreRules::new(DEFAULT_MAX_FILE_SIZE);
        assert_eq!(reason(&r, "src/main.rs", b"fn main() {}"), None);
        assert_eq!(reason(&r, "id_rsa", b"key"), Some("keyish_pattern".into()));
        assert_eq!(reason(&r, "a.bin", &[0xff]), Some("binary_file".into()));
    }

    #[test]
    fn test_gitignore_patterns() {
        let r = rules(None, Some("target/\n*.log\n!keep.log\n"));
        assert_eq!(
            reason(&r, "target/debug/out.txt", b"x"),
            Some("ignored_by_gitignore".into())
        );
        assert_eq!(reason(&r, "logs/app.log", b"x"), Some("ignored_by_gitignore".into()));
        assert_eq!(reason(&r, "keep.log", b"x"), None);
        assert_eq!(reason(&r, "src/lib.rs", b"x"), None);
    }

    #[test]
    fn test_augmentignore_runs_before_keyish() {
        let r = rules(Some("secrets/\n"), Some("*.pem\n"));
        assert_eq!(
            reason(&r, "secrets/server.pem", b"x"),
            Some("ignored_by_augmentignore".into())
        );
        // Not covered by .augmentignore: keyish wins over .gitignore.
        assert_eq!(reason(&r, "certs/server.pem", b"x"), Some("keyish_pattern".into()));
    }

    #[test]
    fn test_gitignore_runs_before_encoding() {
        let r = rules(None, Some("*.bin\n"));
        assert_eq!(reason(&r, "blob.bin", &[0xff, 0x00]), Some("ignored_by_gitignore".into()));
    }

    #[test]
    fn test_size_runs_before_ignore_files() {
        let r = IgnoreRules::from_contents(Some("*.txt\n"), None, 4).unwrap();
        assert_eq!(
            reason(&r, "a.txt", b"12345"),
            Some("file_too_large (5 bytes)".into())
        );
    }

    #[test]
    fn test_load_from_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".gitignore"), "dist/\n").unwrap();
        let r = IgnoreRules::load(tmp.path(), DEFAULT_MAX_FILE_SIZE).unwrap();
        assert!(r.is_ignored("dist/app.js"));
        assert!(!r.is_ignored("src/app.js"));
    }

    #[test]
    fn test_is_ignore_file() {
        assert!(is_ignore_file(".gitignore"));
        assert!(is_ignore_file(".augmentignore"));
        assert!(!is_ignore_file("docs/.gitignore"));
    }
}

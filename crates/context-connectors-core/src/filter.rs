//! Content filter applied at the ingestion boundary.
//!
//! Decides whether a candidate file may enter an index. The checks run in a
//! fixed order and the first rejection wins:
//!
//! | # | Check | Reason code |
//! |---|-------|-------------|
//! | 1 | Path contains `..` | `path_contains_dotdot` |
//! | 2 | Size above the maximum | `file_too_large (<n> bytes)` |
//! | 3 | `.augmentignore` rules (caller) | `ignored_by_augmentignore` |
//! | 4 | Key or credential file name | `keyish_pattern` |
//! | 5 | `.gitignore` rules (caller) | `ignored_by_gitignore` |
//! | 6 | Not valid UTF-8 | `binary_file` |
//!
//! Steps 3 and 5 need file-tree context and are evaluated by the caller
//! between the checks exposed here; see `IgnoreRules` in the
//! `context-connectors` crate. [`should_filter`] runs steps 1, 2, 4 and 6.

use std::fmt;

/// Default maximum file size accepted into an index (1 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 1_048_576;

/// Exact file names treated as private keys.
const KEYISH_NAMES: &[&str] = &[".git", "id_rsa", "id_ed25519", "id_ecdsa", "id_dsa"];

/// File name suffixes treated as key or certificate material.
const KEYISH_EXTENSIONS: &[&str] = &[
    ".pem", ".key", ".pfx", ".p12", ".jks", ".keystore", ".pkcs12", ".crt", ".cer",
];

/// Why a file was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterReason {
    PathContainsDotDot,
    FileTooLarge { size: usize, max: usize },
    /// Matched a caller-supplied ignore file, e.g. `"gitignore"`.
    Ignored { rule: String },
    KeyishPattern,
    BinaryFile,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::PathContainsDotDot => f.write_str("path_contains_dotdot"),
            FilterReason::FileTooLarge { size, .. } => write!(f, "file_too_large ({} bytes)", size),
            FilterReason::Ignored { rule } => write!(f, "ignored_by_{}", rule),
            FilterReason::KeyishPattern => f.write_str("keyish_pattern"),
            FilterReason::BinaryFile => f.write_str("binary_file"),
        }
    }
}

/// Outcome of running the filter on one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub filtered: bool,
    pub reason: Option<FilterReason>,
}

impl FilterDecision {
    pub fn keep() -> Self {
        Self {
            filtered: false,
            reason: None,
        }
    }

    pub fn reject(reason: FilterReason) -> Self {
        Self {
            filtered: true,
            reason: Some(reason),
        }
    }
}

impl From<Option<FilterReason>> for FilterDecision {
    fn from(reason: Option<FilterReason>) -> Self {
        match reason {
            Some(r) => FilterDecision::reject(r),
            None => FilterDecision::keep(),
        }
    }
}

/// Step 1. Any occurrence of `..` is rejected, wherever it appears.
pub fn check_path(path: &str) -> Option<FilterReason> {
    path.contains("..").then_some(FilterReason::PathContainsDotDot)
}

/// Step 2.
pub fn check_size(size: usize, max_file_size: usize) -> Option<FilterReason> {
    (size > max_file_size).then_some(FilterReason::FileTooLarge {
        size,
        max: max_file_size,
    })
}

/// Whether the final path segment looks like key or credential material.
pub fn is_keyish_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    KEYISH_NAMES.contains(&name) || KEYISH_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Step 4.
pub fn check_keyish(path: &str) -> Option<FilterReason> {
    is_keyish_path(path).then_some(FilterReason::KeyishPattern)
}

/// Step 6. The content must survive a UTF-8 decode/re-encode unchanged.
///
/// `str::from_utf8` is strict (no replacement characters), so any
/// successful decode re-encodes to the identical byte sequence.
pub fn check_encoding(contents: &[u8]) -> Option<FilterReason> {
    std::str::from_utf8(contents)
        .is_err()
        .then_some(FilterReason::BinaryFile)
}

/// Run the built-in checks in order, short-circuiting on the first rejection.
///
/// `max_file_size` defaults to [`DEFAULT_MAX_FILE_SIZE`].
pub fn should_filter(path: &str, contents: &[u8], max_file_size: Option<usize>) -> FilterDecision {
    let max = max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE);
    check_path(path)
        .or_else(|| check_size(contents.len(), max))
        .or_else(|| check_keyish(path))
        .or_else(|| check_encoding(contents))
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(path: &str, contents: &[u8]) -> Option<FilterReason> {
        should_filter(path, contents, None).reason
    }

    #[test]
    fn test_plain_text_kept() {
        let d = should_filter("docs/readme.md", b"# Hello", None);
        assert!(!d.filtered);
        assert_eq!(d.reason, None);
    }

    #[test]
    fn test_dotdot_rejected_anywhere() {
        for path in ["../etc/passwd", "a/../b.txt", "a/b/..", "notes..txt"] {
            assert_eq!(
                reason(path, b"text"),
                Some(FilterReason::PathContainsDotDot),
                "path {}",
                path
            );
        }
    }

    #[test]
    fn test_dotdot_wins_over_everything() {
        let big_binary = vec![0xffu8; DEFAULT_MAX_FILE_SIZE + 1];
        assert_eq!(
            reason("../id_rsa", &big_binary),
            Some(FilterReason::PathContainsDotDot)
        );
    }

    #[test]
    fn test_size_limit() {
        let at_limit = vec![b'a'; 10];
        assert!(!should_filter("a.txt", &at_limit, Some(10)).filtered);

        let over = vec![b'a'; 11];
        let d = should_filter("a.txt", &over, Some(10));
        assert_eq!(d.reason, Some(FilterReason::FileTooLarge { size: 11, max: 10 }));
        assert_eq!(d.reason.unwrap().to_string(), "file_too_large (11 bytes)");
    }

    #[test]
    fn test_size_checked_before_keyish() {
        let over = vec![b'a'; 11];
        assert!(matches!(
            should_filter("id_rsa", &over, Some(10)).reason,
            Some(FilterReason::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_keyish_patterns() {
        for path in [
            ".git",
            "id_rsa",
            "home/.ssh/id_ed25519",
            "id_ecdsa",
            "id_dsa",
            "certs/server.pem",
            "tls.key",
            "store.pfx",
            "store.p12",
            "app.jks",
            "release.keystore",
            "bundle.pkcs12",
            "ca.crt",
            "ca.cer",
        ] {
            assert_eq!(
                reason(path, b"small text"),
                Some(FilterReason::KeyishPattern),
                "path {}",
                path
            );
        }
    }

    #[test]
    fn test_keyish_matches_basename_only() {
        assert!(!should_filter("id_rsa/notes.md", b"text", None).filtered);
        assert!(!should_filter("keys.pem/readme.md", b"text", None).filtered);
        assert!(!should_filter("id_rsa.pub", b"ssh-ed25519 AAAA", None).filtered);
        assert!(!should_filter(".github/workflows/ci.yml", b"on: push", None).filtered);
    }

    #[test]
    fn test_keyish_wins_over_binary() {
        assert_eq!(
            reason("server.key", &[0x30, 0x82, 0xff, 0xfe]),
            Some(FilterReason::KeyishPattern)
        );
    }

    #[test]
    fn test_binary_rejected() {
        assert_eq!(reason("a.bin", &[0xff, 0xfe, 0x00]), Some(FilterReason::BinaryFile));
        // Truncated multi-byte sequence.
        assert_eq!(reason("a.txt", &[b'a', 0xe2, 0x82]), Some(FilterReason::BinaryFile));
        // Overlong encoding of '/'.
        assert_eq!(reason("a.txt", &[0xc0, 0xaf]), Some(FilterReason::BinaryFile));
        // Encoded surrogate half.
        assert_eq!(reason("a.txt", &[0xed, 0xa0, 0x80]), Some(FilterReason::BinaryFile));
    }

    #[test]
    fn test_multibyte_utf8_kept() {
        assert!(!should_filter("a.txt", "héllo ┌─┐ 日本".as_bytes(), None).filtered);
        assert!(!should_filter("a.txt", b"", None).filtered);
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(FilterReason::PathContainsDotDot.to_string(), "path_contains_dotdot");
        assert_eq!(FilterReason::KeyishPattern.to_string(), "keyish_pattern");
        assert_eq!(FilterReason::BinaryFile.to_string(), "binary_file");
        assert_eq!(
            FilterReason::Ignored {
                rule: "gitignore".to_string()
            }
            .to_string(),
            "ignored_by_gitignore"
        );
    }

    #[test]
    fn test_mixed_batch() {
        let files: Vec<(&str, Vec<u8>)> = vec![
            ("a.txt", b"0123456789".to_vec()),
            ("id_rsa", b"0123456789".to_vec()),
            ("big.bin", vec![b'x'; 2 * 1024 * 1024]),
        ];
        let decisions: Vec<_> = files
            .iter()
            .map(|(p, c)| (*p, should_filter(p, c, None)))
            .collect();

        let kept: Vec<_> = decisions
            .iter()
            .filter(|(_, d)| !d.filtered)
            .map(|(p, _)| *p)
            .collect();
        assert_eq!(kept, vec!["a.txt"]);
        assert_eq!(decisions[1].1.reason, Some(FilterReason::KeyishPattern));
        assert_eq!(
            decisions[2].1.reason,
            Some(FilterReason::FileTooLarge {
                size: 2 * 1024 * 1024,
                max: DEFAULT_MAX_FILE_SIZE
            })
        );
    }
}

//! Website source.
//!
//! Crawls a site breadth-first from a start URL, staying on the same host,
//! and turns each HTML page into plain text stored under a `.md` path
//! derived from the URL path:
//!
//! | URL path | Index path |
//! |----------|-----------|
//! | `/` | `index.md` |
//! | `/docs/` | `docs/index.md` |
//! | `/docs/intro` | `docs/intro.md` |
//! | `/faq.html` | `faq.md` |
//!
//! Websites have no change-tracking primitive, so every sync is a full
//! crawl. `robots.txt` `Disallow` rules for `User-agent: *` are honored.
//!
//! `max_pages` caps requests, not kept pages, so restrictive include or
//! exclude globs cannot turn a crawl into a walk of the whole site.
//!
//! A missing page (404, 410) is skipped. Server errors, and a start page
//! that yields nothing, fail the crawl: an empty result would otherwise
//! replace a stored index during an outage.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use context_connectors_core::filter::should_filter;
use context_connectors_core::models::{
    content_hash, FileChanges, FileEntry, FileInfo, SourceMetadata, SourceType, WebsiteSourceRef,
};
use context_connectors_core::source::Source;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WebsiteIndexConfig;

const USER_AGENT: &str = concat!("context-connectors/", env!("CARGO_PKG_VERSION"));

/// Extensions that are never worth requesting.
const SKIPPED_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".pdf", ".zip", ".gz", ".tar",
    ".mp4", ".mp3", ".woff", ".woff2", ".ttf", ".css", ".js",
];

pub struct WebsiteSource {
    start: Url,
    config: WebsiteIndexConfig,
    max_file_size: usize,
    include: Option<GlobSet>,
    exclude: GlobSet,
    client: reqwest::Client,
    crawl: OnceCell<Vec<FileEntry>>,
}

impl WebsiteSource {
    pub fn new(config: WebsiteIndexConfig, max_file_size: usize) -> Result<Self> {
        let start = Url::parse(&config.url)
            .with_context(|| format!("Invalid website url: {}", config.url))?;
        let include = if config.include_paths.is_empty() {
            None
        } else {
            Some(build_globset(&config.include_paths)?)
        };
        let exclude = build_globset(&config.exclude_paths)?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            start,
            config,
            max_file_size,
            include,
            exclude,
            client,
            crawl: OnceCell::new(),
        })
    }

    fn wanted(&self, url: &Url) -> bool {
        let path = url.path();
        if self.exclude.is_match(path) {
            return false;
        }
        self.include.as_ref().map_or(true, |set| set.is_match(path))
    }

    /// Crawl once per instance; later calls reuse the result.
    async fn pages(&self) -> Result<&Vec<FileEntry>> {
        self.crawl.get_or_try_init(|| self.run_crawl()).await
    }

    async fn run_crawl(&self) -> Result<Vec<FileEntry>> {
        let disallowed = self.fetch_robots().await;
        let mut queue = VecDeque::from([(self.start.clone(), 0usize)]);
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages = Vec::new();
        let mut requests = 0usize;

        while let Some((url, depth)) = queue.pop_front() {
            if requests >= self.config.max_pages {
                info!(limit = self.config.max_pages, "page limit reached");
                break;
            }
            let path = page_path(&url);
            if !seen.insert(path.clone()) {
                continue;
            }
            if disallowed.iter().any(|d| url.path().starts_with(d.as_str())) {
                if depth == 0 {
                    bail!("Start page {} is disallowed by robots.txt", url);
                }
                debug!(url = %url, "disallowed by robots.txt");
                continue;
            }

            if requests > 0 && self.config.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delay_ms)).await;
            }
            requests += 1;

            let Some(html) = self.fetch_page(&url).await? else {
                if depth == 0 {
                    bail!("Start page {} returned no content", url);
                }
                continue;
            };

            if depth < self.config.max_depth {
                for link in extract_links(&url, &html) {
                    if link.host_str() == self.start.host_str() && !seen.contains(&page_path(&link)) {
                        queue.push_back((link, depth + 1));
                    }
                }
            }

            if !self.wanted(&url) {
                continue;
            }
            let text = html_to_text(&html);
            let decision = should_filter(&path, text.as_bytes(), Some(self.max_file_size));
            match decision.reason {
                Some(reason) => debug!(path = %path, %reason, "filtered"),
                None => pages.push(FileEntry::new(path, text)),
            }
        }

        pages.sort_by(|a, b| a.path.cmp(&b.path));
        info!(url = %self.start, pages = pages.len(), "crawled website");
        Ok(pages)
    }

    /// GET one page. `None` for missing pages and non-text responses;
    /// transport failures, server errors and throttling are errors.
    async fn fetch_page(&self, url: &Url) -> Result<Option<String>> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            bail!("{} returned {}", url, status);
        }
        if !status.is_success() {
            if status != reqwest::StatusCode::NOT_FOUND && status != reqwest::StatusCode::GONE {
                warn!(url = %url, %status, "skipping page");
            }
            return Ok(None);
        }
        let is_text = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |ct| ct.starts_with("text/html") || ct.starts_with("text/plain"));
        if !is_text {
            return Ok(None);
        }
        Ok(Some(resp.text().await?))
    }

    async fn fetch_robots(&self) -> Vec<String> {
        let Ok(robots_url) = self.start.join("/robots.txt") else {
            return Vec::new();
        };
        match self.client.get(robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => parse_robots(&body),
                Err(_) => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Source for WebsiteSource {
    fn source_type(&self) -> SourceType {
        SourceType::Website
    }

    async fn fetch_all(&self) -> Result<Vec<FileEntry>> {
        Ok(self.pages().await?.clone())
    }

    async fn fetch_changes(&self, _previous: &SourceMetadata) -> Result<Option<FileChanges>> {
        debug!(url = %self.start, "website source has no change tracking");
        Ok(None)
    }

    async fn get_metadata(&self) -> Result<SourceMetadata> {
        let pages = self.pages().await?;
        let mut hasher = Sha256::new();
        for page in pages {
            hasher.update(page.path.as_bytes());
            hasher.update(content_hash(&page.contents).as_bytes());
        }
        Ok(SourceMetadata::Website {
            config: WebsiteSourceRef {
                url: self.config.url.clone(),
            },
            resolved_ref: format!("{:x}", hasher.finalize()),
            synced_at: Utc::now(),
        })
    }

    async fn list_files(&self, directory: Option<&str>) -> Result<Vec<FileInfo>> {
        let pages = self.pages().await?;
        Ok(list_children(
            pages.iter().map(|p| p.path.as_str()),
            directory.unwrap_or(""),
        ))
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if path.contains("..") {
            return Ok(None);
        }
        let url = self
            .start
            .join(&url_path_for(path))
            .with_context(|| format!("Cannot map {} to a URL", path))?;
        Ok(self
            .fetch_page(&url)
            .await?
            .map(|html| html_to_text(&html).into_bytes()))
    }
}

/// Index path for a page URL.
fn page_path(url: &Url) -> String {
    let mut path = url.path().trim_start_matches('/').to_string();
    if path.is_empty() || path.ends_with('/') {
        path.push_str("index");
    } else if let Some(stem) = path
        .strip_suffix(".html")
        .or_else(|| path.strip_suffix(".htm"))
    {
        path = stem.to_string();
    }
    format!("{}.md", path)
}

/// Inverse of [`page_path`], as an absolute URL path.
fn url_path_for(path: &str) -> String {
    let stem = path.trim_start_matches('/');
    let stem = stem.strip_suffix(".md").unwrap_or(stem);
    if stem == "index" {
        "/".to_string()
    } else if let Some(dir) = stem.strip_suffix("/index") {
        format!("/{}/", dir)
    } else {
        format!("/{}", stem)
    }
}

/// Same-site candidate links found in `<a href>` attributes.
fn extract_links(base: &Url, html: &str) -> Vec<Url> {
    static HREF: OnceLock<Regex> = OnceLock::new();
    let href = HREF.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"'#]*)"#).expect("valid href regex")
    });

    href.captures_iter(html)
        .filter_map(|c| base.join(c.get(1)?.as_str().trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .filter(|u| {
            let path = u.path().to_ascii_lowercase();
            !SKIPPED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        })
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .collect()
}

/// Reduce an HTML document to readable text.
fn html_to_text(html: &str) -> String {
    static PATTERNS: OnceLock<[Regex; 5]> = OnceLock::new();
    let [dropped, title, breaks, tags, blank_lines] = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
                .expect("valid drop regex"),
            Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid title regex"),
            Regex::new(r"(?i)<br\s*/?>|</(p|div|li|tr|h[1-6]|pre|blockquote|section|article)\s*>")
                .expect("valid break regex"),
            Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"),
            Regex::new(r"\n[ \t]*(\n[ \t]*)+").expect("valid blank-line regex"),
        ]
    });

    let cleaned = dropped.replace_all(html, "");
    let page_title = title
        .captures(&cleaned)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().trim()));
    let without_title = title.replace_all(&cleaned, "");
    let with_breaks = breaks.replace_all(&without_title, "\n");
    let stripped = tags.replace_all(&with_breaks, "");
    let decoded = decode_entities(&stripped);
    let lines: Vec<&str> = decoded.lines().map(str::trim).collect();
    let body = blank_lines.replace_all(lines.join("\n").trim(), "\n\n").into_owned();

    match page_title {
        Some(t) if !t.is_empty() => format!("# {}\n\n{}", t, body),
        _ => body,
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// `Disallow` prefixes that apply to every user agent.
fn parse_robots(body: &str) -> Vec<String> {
    let mut disallowed = Vec::new();
    let mut applies = false;
    let mut in_agent_block = false;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "user-agent" => {
                if !in_agent_block {
                    applies = false;
                }
                in_agent_block = true;
                applies |= value == "*";
            }
            "disallow" => {
                in_agent_block = false;
                if applies && !value.is_empty() {
                    disallowed.push(value.to_string());
                }
            }
            _ => in_agent_block = false,
        }
    }
    disallowed
}

/// Direct children of `directory` among a flat list of file paths.
fn list_children<'a>(paths: impl Iterator<Item = &'a str>, directory: &str) -> Vec<FileInfo> {
    let dir = directory.trim_matches('/');
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    };

    let mut children: BTreeMap<String, bool> = BTreeMap::new();
    for path in paths {
        let Some(rest) = path.strip_prefix(prefix.as_str()) else {
            continue;
        };
        match rest.split_once('/') {
            Some((sub, _)) => {
                children.insert(format!("{}{}", prefix, sub), true);
            }
            None => {
                children.entry(path.to_string()).or_insert(false);
            }
        }
    }
    children
        .into_iter()
        .map(|(path, is_directory)| FileInfo { path, is_directory })
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

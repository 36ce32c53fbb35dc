//! S3 (and S3-compatible) index-state store.
//!
//! Objects are laid out as:
//!
//! ```text
//! s3://<bucket>/<prefix><name>/state.json
//! s3://<bucket>/<prefix><name>/search.json
//! ```
//!
//! Requests go straight to the S3 REST API, signed with AWS Signature V4
//! using the pure-Rust `hmac` + `sha2` crates.
//!
//! # Credentials
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)
//!
//! # Addressing
//!
//! | Mode | Request URL |
//! |------|-------------|
//! | virtual-hosted (default) | `https://<bucket>.s3.<region>.amazonaws.com/<key>` |
//! | virtual-hosted, custom endpoint | `<scheme>://<bucket>.<endpoint-host>/<key>` |
//! | path style | `<endpoint or https://s3.<region>.amazonaws.com>/<bucket>/<key>` |
//!
//! A missing object is `Ok(None)`. Any other non-success response is an
//! error carrying the HTTP status.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use context_connectors_core::models::{IndexState, IndexStateSearchOnly};
use context_connectors_core::store::{validate_index_name, IndexStateReader, IndexStateStore};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::S3StoreConfig;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_REGION: &str = "us-east-1";
const STATE_FILE: &str = "state.json";
const SEARCH_FILE: &str = "search.json";

/// AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Where requests for one bucket go.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    scheme: String,
    /// Host, with port when non-default. This is also the signed `host` header.
    host: String,
    /// `Some(bucket)` for path-style addressing.
    path_bucket: Option<String>,
}

impl Endpoint {
    fn resolve(config: &S3StoreConfig, region: &str) -> Result<Self> {
        let (scheme, base_host) = match &config.endpoint {
            Some(endpoint) => {
                let url = Url::parse(endpoint)
                    .with_context(|| format!("Invalid S3 endpoint: {}", endpoint))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow!("S3 endpoint has no host: {}", endpoint))?;
                let host = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                (url.scheme().to_string(), host)
            }
            None => ("https".to_string(), format!("s3.{}.amazonaws.com", region)),
        };

        Ok(if config.force_path_style {
            Self {
                scheme,
                host: base_host,
                path_bucket: Some(config.bucket.clone()),
            }
        } else {
            Self {
                scheme,
                host: format!("{}.{}", config.bucket, base_host),
                path_bucket: None,
            }
        })
    }

    /// Canonical (already encoded) URI path for `key`, or the bucket root.
    fn canonical_uri(&self, key: Option<&str>) -> String {
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        match &self.path_bucket {
            Some(bucket) if encoded_key.is_empty() => format!("/{}", uri_encode(bucket)),
            Some(bucket) => format!("/{}/{}", uri_encode(bucket), encoded_key),
            None => format!("/{}", encoded_key),
        }
    }
}

/// One page of a `ListObjectsV2` response with `delimiter=/`.
#[derive(Debug, Default, PartialEq, Eq)]
struct ListPage {
    common_prefixes: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

pub struct S3Store {
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Endpoint,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
    /// Build a store from configuration and environment credentials.
    /// Fails immediately on an empty bucket or missing credentials.
    pub fn new(config: &S3StoreConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            bail!("S3 store requires a bucket (set remote.s3.bucket or CC_S3_BUCKET)");
        }
        let creds = AwsCredentials::from_env()?;
        Self::with_credentials(config, creds)
    }

    pub fn with_credentials(config: &S3StoreConfig, creds: AwsCredentials) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            bail!("S3 store requires a bucket (set remote.s3.bucket or CC_S3_BUCKET)");
        }
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = Endpoint::resolve(config, &region)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            bucket: config.bucket.clone(),
            prefix: normalize_prefix(&config.prefix),
            region,
            endpoint,
            creds,
            client,
        })
    }

    fn object_key(&self, name: &str, file: &str) -> Result<String> {
        validate_index_name(name)?;
        Ok(format!("{}{}/{}", self.prefix, name, file))
    }

    /// Build, sign and send one request.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let canonical_uri = self.endpoint.canonical_uri(key);
        let canonical_query = canonical_query_string(query);
        let payload_hash = hex_sha256(&body);
        let now = Utc::now();
        let authorization = sign_request(
            &self.creds,
            &self.region,
            method.as_str(),
            &self.endpoint.host,
            &canonical_uri,
            &canonical_query,
            &payload_hash,
            now,
        )?;

        let mut url = format!("{}://{}{}", self.endpoint.scheme, self.endpoint.host, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", now.format("%Y%m%dT%H%M%SZ").to_string());
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        req.send().await.with_context(|| {
            format!(
                "S3 {} s3://{}/{} failed",
                method,
                self.bucket,
                key.unwrap_or("")
            )
        })
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.send(Method::GET, Some(key), &[], Vec::new()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, "GetObject", key).await?;
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_object(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("Corrupt object s3://{}/{}", self.bucket, key)
            })?)),
            None => Ok(None),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let resp = self.send(Method::PUT, Some(key), &[], body).await?;
        check_status(resp, "PutObject", key).await?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, Some(key), &[], Vec::new()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp, "DeleteObject", key).await?;
        Ok(())
    }

    /// All `CommonPrefixes` directly under the store prefix, following
    /// continuation tokens.
    async fn list_common_prefixes(&self) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2"), ("delimiter", "/")];
            if !self.prefix.is_empty() {
                query.push(("prefix", self.prefix.as_str()));
            }
            if let Some(ref t) = token {
                query.push(("continuation-token", t.as_str()));
            }

            let resp = self.send(Method::GET, None, &query, Vec::new()).await?;
            let resp = check_status(resp, "ListObjectsV2", &self.prefix).await?;
            let page = parse_list_response(&resp.text().await?)?;
            prefixes.extend(page.common_prefixes);

            match (page.is_truncated, page.next_token) {
                (true, Some(next)) => token = Some(next),
                _ => break,
            }
        }

        Ok(prefixes)
    }
}

#[async_trait]
impl IndexStateReader for S3Store {
    async fn load_state(&self, name: &str) -> Result<Option<IndexState>> {
        self.get_json(&self.object_key(name, STATE_FILE)?).await
    }

    async fn load_search(&self, name: &str) -> Result<Option<IndexStateSearchOnly>> {
        self.get_json(&self.object_key(name, SEARCH_FILE)?).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list_common_prefixes()
            .await?
            .iter()
            .filter_map(|p| p.strip_prefix(self.prefix.as_str()))
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[async_trait]
impl IndexStateStore for S3Store {
    async fn save(&self, name: &str, state: &IndexState) -> Result<()> {
        let state_key = self.object_key(name, STATE_FILE)?;
        let search_key = self.object_key(name, SEARCH_FILE)?;
        self.put_object(&state_key, serde_json::to_vec(state)?).await?;
        self.put_object(&search_key, serde_json::to_vec(&state.to_search_only())?)
            .await?;
        debug!(index = name, bucket = %self.bucket, "saved index state to S3");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.delete_object(&self.object_key(name, STATE_FILE)?).await?;
        self.delete_object(&self.object_key(name, SEARCH_FILE)?).await?;
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response, op: &str, key: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!(
        "S3 {} failed (HTTP {}) for '{}': {}",
        op,
        status,
        key,
        body.chars().take(500).collect::<String>()
    )
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

// ============ AWS SigV4 ============

fn canonical_query_string(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Produce the `Authorization` header value for one request.
#[allow(clippy::too_many_arguments)]
fn sign_request(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    host: &str,
    canonical_uri: &str,
    canonical_query: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host", host.to_string()),
        ("x-amz-content-sha256", payload_hash.to_string()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let signed_headers = headers.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3")?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    ))
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ ListObjectsV2 XML ============

fn parse_list_response(xml: &str) -> Result<ListPage> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape()?.into_owned();
                let tail: Vec<&str> = path.iter().rev().take(2).map(String::as_str).collect();
                match tail.as_slice() {
                    ["Prefix", "CommonPrefixes"] => page.common_prefixes.push(text),
                    ["IsTruncated", "ListBucketResult"] => page.is_truncated = text == "true",
                    ["NextContinuationToken", "ListBucketResult"] => page.next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("Malformed ListObjectsV2 response: {}", e),
            _ => {}
        }
    }

    Ok(page)
}

//! Disk-backed payload cache + resilient HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-storage";

/// Identity of one cached fetch: `<namespace>/<source>/<identity>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub namespace: String,
    pub source: String,
    pub identity: String,
    pub extension: String,
}

impl CacheKey {
    pub fn new(
        namespace: impl Into<String>,
        source: impl Into<String>,
        identity: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            source: source.into(),
            identity: identity.into(),
            extension: extension.into(),
        }
    }

    /// Date-stamped namespace, so each calendar day gets a fresh cache.
    pub fn dated(
        day: DateTime<Utc>,
        source: impl Into<String>,
        identity: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self::new(day.format("%Y%m%d").to_string(), source, identity, extension)
    }

    pub fn relative_path(&self) -> PathBuf {
        let ext = self.extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(sanitize_segment(&self.namespace))
            .join(sanitize_segment(&self.source))
            .join(format!("{}.{ext}", sanitize_segment(&self.identity)))
    }
}

fn sanitize_segment(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CachedPayload {
    pub absolute_path: PathBuf,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Read-or-write payload cache. Entries never expire; callers pick namespaces.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    pub async fn load(&self, key: &CacheKey) -> anyhow::Result<Option<CachedPayload>> {
        let absolute_path = self.path_for(key);
        if !fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking cache path {}", absolute_path.display()))?
        {
            return Ok(None);
        }
        let body = fs::read(&absolute_path)
            .await
            .with_context(|| format!("reading cache entry {}", absolute_path.display()))?;
        let stored_at = fs::metadata(&absolute_path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(CachedPayload {
            absolute_path,
            body,
            stored_at,
        }))
    }

    /// Persist bytes with an atomic temp-file rename. An entry already on disk is left as is.
    pub async fn store(&self, key: &CacheKey, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let absolute_path = self.path_for(key);
        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking cache path {}", absolute_path.display()))?
        {
            return Ok(absolute_path);
        }
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(absolute_path),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp cache file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// `None` retries forever, for long bulk syncs against a throttling host.
    pub max_retries: Option<usize>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Whether another attempt may follow `retries_so_far` retries.
    pub fn allows_retry(&self, retries_so_far: usize) -> bool {
        match self.max_retries {
            Some(max) => retries_so_far < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            default_headers: Vec::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    /// Query parameters on the URL.
    Get,
    /// `application/x-www-form-urlencoded` body.
    PostForm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
    pub params: Vec<(String, String)>,
    /// Sent on top of the client's default headers.
    pub headers: Vec<(String, String)>,
    /// A 200 body containing any of these is retried as a throttled response.
    pub unavailable_markers: Vec<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
            params,
            headers: Vec::new(),
            unavailable_markers: Vec::new(),
        }
    }

    pub fn post_form(url: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::PostForm,
            params,
            headers: Vec::new(),
            unavailable_markers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_unavailable_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unavailable_markers
            .extend(markers.into_iter().map(Into::into).filter(|m: &String| !m.is_empty()));
        self
    }

    fn unavailable_marker_in(&self, body: &[u8]) -> Option<&str> {
        if self.unavailable_markers.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(body);
        self.unavailable_markers
            .iter()
            .find(|marker| text.contains(marker.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub url: String,
    pub body: Vec<u8>,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
    pub from_cache: bool,
}

impl FetchedPayload {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("service unavailable marker {marker:?} in response from {url}")]
    ServiceUnavailable { url: String, marker: String },
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last: Box<FetchError>,
    },
    #[error("payload cache: {0:#}")]
    Cache(anyhow::Error),
}

impl FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { .. } | FetchError::ServiceUnavailable { .. } => {
                RetryDisposition::Retryable
            }
            FetchError::RetriesExhausted { .. } | FetchError::Cache(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache: DiskCache,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, cache: DiskCache) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            cache,
            backoff: config.backoff,
        })
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Return the cached payload for `cache_key`, or fetch it with retries and
    /// cache it before returning.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        cache_key: &CacheKey,
    ) -> Result<FetchedPayload, FetchError> {
        let span = info_span!(
            "http_fetch",
            url = %request.url,
            source = %cache_key.source,
            identity = %cache_key.identity
        );

        async {
            if let Some(cached) = self.cache.load(cache_key).await.map_err(FetchError::Cache)? {
                tracing::debug!(path = %cached.absolute_path.display(), "serving payload from cache");
                return Ok(FetchedPayload {
                    url: request.url.clone(),
                    sha256: sha256_hex(&cached.body),
                    body: cached.body,
                    fetched_at: cached.stored_at,
                    from_cache: true,
                });
            }

            let body = self.fetch_with_retry(request).await?;
            let fetched_at = Utc::now();
            let path = self
                .cache
                .store(cache_key, &body)
                .await
                .map_err(FetchError::Cache)?;
            tracing::info!(bytes = body.len(), path = %path.display(), "fetched and cached payload");

            Ok(FetchedPayload {
                url: request.url.clone(),
                sha256: sha256_hex(&body),
                body,
                fetched_at,
                from_cache: false,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_with_retry(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
        let mut retries = 0usize;
        loop {
            let err = match self.attempt(request).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };

            if err.disposition() == RetryDisposition::NonRetryable {
                return Err(err);
            }
            if !self.backoff.allows_retry(retries) {
                return Err(FetchError::RetriesExhausted {
                    url: request.url.clone(),
                    attempts: retries + 1,
                    last: Box::new(err),
                });
            }

            let wait = self.backoff.delay_for_attempt(retries);
            retries += 1;
            tracing::warn!(
                attempt = retries,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "fetch attempt failed; backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn attempt(&self, request: &FetchRequest) -> Result<Vec<u8>, FetchError> {
        let mut builder = match request.method {
            FetchMethod::Get => self.client.get(&request.url).query(&request.params),
            FetchMethod::PostForm => self.client.post(&request.url).form(&request.params),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        if let Some(marker) = request.unavailable_marker_in(&body) {
            return Err(FetchError::ServiceUnavailable {
                url: final_url,
                marker: marker.to_string(),
            });
        }
        Ok(body)
    }
}

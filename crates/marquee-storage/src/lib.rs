//! Collection persistence + HTTP fetch utilities for Marquee.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use marquee_core::{Review, Show};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Mobile Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Shows,
    Reviews,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Shows => "shows",
            Collection::Reviews => "reviews",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.name())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding collection {collection}: {source}")]
    Encode {
        collection: Collection,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Storage medium for the two named collections.
///
/// `read` returns `None` when nothing has been stored yet. `write_all` replaces every
/// given collection; implementations must never leave a half-written collection behind.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn read(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError>;

    async fn write_all(&self, batch: &[(Collection, Vec<u8>)]) -> Result<(), StoreError>;
}

/// One JSON document per collection under `root`, replaced via temp-file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn collection_path(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.file_name())
    }

    async fn stage(&self, collection: Collection, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", collection.name(), Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io("opening temp file", &temp_path, e))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("writing temp file", &temp_path, err));
        }
        Ok(temp_path)
    }

    fn backup_path(&self, collection: Collection) -> PathBuf {
        self.root.join(format!(".{}.bak", collection.name()))
    }

    /// Hard-links the live file aside. `None` when the collection has never been written.
    async fn preserve(&self, collection: Collection) -> Result<Option<PathBuf>, StoreError> {
        let target = self.collection_path(collection);
        let backup = self.backup_path(collection);
        let _ = fs::remove_file(&backup).await;
        match fs::hard_link(&target, &backup).await {
            Ok(()) => Ok(Some(backup)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io("preserving", &target, err)),
        }
    }

    /// Puts the previous generation back for collections already swapped.
    async fn restore(&self, swapped: &[(Collection, PathBuf)], backups: &[Option<PathBuf>]) {
        for ((collection, _), backup) in swapped.iter().zip(backups) {
            let target = self.collection_path(*collection);
            let restored = match backup {
                Some(backup) => fs::rename(backup, &target).await,
                None => fs::remove_file(&target).await,
            };
            if let Err(err) = restored {
                warn!(%collection, path = %target.display(), error = %err, "restoring previous collection failed");
            }
        }
    }
}

async fn remove_quietly<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}

#[async_trait]
impl CollectionStore for JsonFileStore {
    async fn read(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.collection_path(collection);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io("reading", &path, err)),
        }
    }

    async fn write_all(&self, batch: &[(Collection, Vec<u8>)]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("creating data directory", &self.root, e))?;

        // Stage everything before touching any live file.
        let mut staged = Vec::with_capacity(batch.len());
        for (collection, bytes) in batch {
            match self.stage(*collection, bytes).await {
                Ok(temp_path) => staged.push((*collection, temp_path)),
                Err(err) => {
                    for (_, temp_path) in &staged {
                        let _ = fs::remove_file(temp_path).await;
                    }
                    return Err(err);
                }
            }
        }

        // Keep the live generation reachable until every collection has been swapped.
        let mut backups = Vec::with_capacity(staged.len());
        for (collection, _) in &staged {
            match self.preserve(*collection).await {
                Ok(backup) => backups.push(backup),
                Err(err) => {
                    remove_quietly(staged.iter().map(|(_, temp)| temp).collect::<Vec<_>>()).await;
                    remove_quietly(backups.iter().flatten()).await;
                    return Err(err);
                }
            }
        }

        for (swapped, (collection, temp_path)) in staged.iter().enumerate() {
            let target = self.collection_path(*collection);
            if let Err(err) = fs::rename(temp_path, &target).await {
                self.restore(&staged[..swapped], &backups).await;
                remove_quietly(staged[swapped..].iter().map(|(_, temp)| temp).collect::<Vec<_>>()).await;
                remove_quietly(backups.iter().flatten()).await;
                return Err(StoreError::io("renaming temp file over", &target, err));
            }
        }

        remove_quietly(backups.iter().flatten()).await;
        Ok(())
    }
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<Collection, Vec<u8>>>,
    reject_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail, leaving contents untouched.
    pub fn rejecting_writes() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            reject_writes: true,
        }
    }

    pub async fn put_raw(&self, collection: Collection, bytes: impl Into<Vec<u8>>) {
        self.collections.lock().await.insert(collection, bytes.into());
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn read(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.collections.lock().await.get(&collection).cloned())
    }

    async fn write_all(&self, batch: &[(Collection, Vec<u8>)]) -> Result<(), StoreError> {
        if self.reject_writes {
            return Err(StoreError::Unavailable("memory store rejects writes".to_string()));
        }
        let mut map = self.collections.lock().await;
        for (collection, bytes) in batch {
            map.insert(*collection, bytes.clone());
        }
        Ok(())
    }
}

/// JSON codec and recovery policy over a [`CollectionStore`].
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn CollectionStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn CollectionStore>) -> Self {
        Self { store }
    }

    pub fn json_files(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(root)))
    }

    /// Loads a collection; missing, blank, corrupt or unreadable data yields an empty list.
    pub async fn load<T: DeserializeOwned>(&self, collection: Collection) -> Vec<T> {
        let bytes = match self.store.read(collection).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(%collection, error = %err, "collection unreadable; starting empty");
                return Vec::new();
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }
        match serde_json::from_slice(&bytes) {
            Ok(items) => items,
            Err(err) => {
                warn!(%collection, error = %err, "collection corrupt; starting empty");
                Vec::new()
            }
        }
    }

    pub async fn load_shows(&self) -> Vec<Show> {
        self.load(Collection::Shows).await
    }

    pub async fn load_reviews(&self) -> Vec<Review> {
        self.load(Collection::Reviews).await
    }

    /// Writes both collections as one staged batch.
    pub async fn save_all(&self, shows: &[Show], reviews: &[Review]) -> Result<(), StoreError> {
        let batch = vec![
            (Collection::Shows, encode(Collection::Shows, shows)?),
            (Collection::Reviews, encode(Collection::Reviews, reviews)?),
        ];
        self.store.write_all(&batch).await
    }
}

fn encode<T: Serialize>(collection: Collection, items: &[T]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(items).map_err(|source| StoreError::Encode { collection, source })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outbound proxy, e.g. a residential scraping proxy with basic auth.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub proxy: Option<ProxyConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            proxy: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// Shared HTTP client for all source adapters: bounded concurrency, retries, optional proxy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB,en;q=0.9"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers);

        if let Some(proxy) = &config.proxy {
            let mut p = reqwest::Proxy::all(&proxy.url)
                .with_context(|| format!("configuring proxy {}", proxy.url))?;
            if let Some(username) = &proxy.username {
                p = p.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
            }
            builder = builder
                .proxy(p)
                .danger_accept_invalid_certs(proxy.accept_invalid_certs);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GETs `url` on behalf of `source`, retrying transient failures with backoff.
    pub async fn fetch_page(&self, source: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).header(REFERER, url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.text().await?;
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retryable request error");
                    } else {
                        return Err(FetchError::Request(err));
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

//! Document store contract, filesystem and in-memory stores, and the shared
//! HTTP fetcher used by remote adapters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "glsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("not a file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("path conflicts with an existing file: {}", .0.display())]
    Conflict(PathBuf),
    #[error("invalid store path: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.to_path_buf());
        }
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

impl Entry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Path-keyed document storage. Paths are relative to the store root.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates `path` and its parents. Returns `AlreadyExists` when the
    /// folder is already there.
    async fn create_folder(&self, path: &Path) -> Result<(), StoreError>;

    async fn get_entry(&self, path: &Path) -> Result<Option<Entry>, StoreError>;

    /// Every file below `folder`, recursively. Empty when `folder` is missing.
    async fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, StoreError>;

    async fn read(&self, path: &Path) -> Result<String, StoreError>;

    async fn create(&self, path: &Path, text: &str) -> Result<(), StoreError>;

    async fn modify(&self, path: &Path, text: &str) -> Result<(), StoreError>;

    async fn delete(&self, path: &Path) -> Result<(), StoreError>;
}

/// Rejects absolute paths and any component that could leave the root.
pub fn validate_store_path(path: &Path) -> Result<(), StoreError> {
    let valid = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_path_buf()))
    }
}

#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, StoreError> {
        validate_store_path(path)?;
        Ok(self.root.join(path))
    }

    /// Writes through a temp file in the target directory and renames it into
    /// place, so readers never observe a partial document.
    async fn write_atomic(&self, path: &Path, absolute: &Path, text: &str) -> Result<(), StoreError> {
        let parent = absolute
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_path_buf()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io("creating parent of", path, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), text.len()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, absolute).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("writing", path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn create_folder(&self, path: &Path) -> Result<(), StoreError> {
        let absolute = self.resolve(path)?;
        match fs::metadata(&absolute).await {
            Ok(meta) if meta.is_dir() => return Err(StoreError::AlreadyExists(path.to_path_buf())),
            Ok(_) => return Err(StoreError::Conflict(path.to_path_buf())),
            Err(_) => {}
        }
        fs::create_dir_all(&absolute)
            .await
            .map_err(|e| StoreError::io("creating folder", path, e))
    }

    async fn get_entry(&self, path: &Path) -> Result<Option<Entry>, StoreError> {
        let absolute = self.resolve(path)?;
        match fs::metadata(&absolute).await {
            Ok(meta) => Ok(Some(Entry {
                path: path.to_path_buf(),
                kind: if meta.is_dir() {
                    EntryKind::Folder
                } else {
                    EntryKind::File
                },
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io("inspecting", path, err)),
        }
    }

    async fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let absolute = self.resolve(folder)?;
        let root = self.root.clone();
        let relative = folder.to_path_buf();
        tokio::task::spawn_blocking(move || walk_files(&root, &absolute, &relative))
            .await
            .map_err(|e| StoreError::Io {
                action: "listing",
                path: folder.to_path_buf(),
                source: std::io::Error::other(e),
            })?
    }

    async fn read(&self, path: &Path) -> Result<String, StoreError> {
        let absolute = self.resolve(path)?;
        fs::read_to_string(&absolute)
            .await
            .map_err(|e| StoreError::io("reading", path, e))
    }

    async fn create(&self, path: &Path, text: &str) -> Result<(), StoreError> {
        let absolute = self.resolve(path)?;
        if fs::try_exists(&absolute)
            .await
            .map_err(|e| StoreError::io("checking", path, e))?
        {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        self.write_atomic(path, &absolute, text).await
    }

    async fn modify(&self, path: &Path, text: &str) -> Result<(), StoreError> {
        let absolute = self.resolve(path)?;
        let meta = fs::metadata(&absolute)
            .await
            .map_err(|e| StoreError::io("inspecting", path, e))?;
        if meta.is_dir() {
            return Err(StoreError::NotAFile(path.to_path_buf()));
        }
        self.write_atomic(path, &absolute, text).await
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        let absolute = self.resolve(path)?;
        let meta = fs::metadata(&absolute)
            .await
            .map_err(|e| StoreError::io("inspecting", path, e))?;
        if meta.is_dir() {
            return Err(StoreError::NotAFile(path.to_path_buf()));
        }
        fs::remove_file(&absolute)
            .await
            .map_err(|e| StoreError::io("deleting", path, e))
    }
}

/// Blocking recursive walk; paths come back relative to `root`, sorted.
fn walk_files(root: &Path, absolute: &Path, folder: &Path) -> Result<Vec<PathBuf>, StoreError> {
    if !absolute.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(absolute).follow_links(false) {
        let entry = entry.map_err(|e| StoreError::Io {
            action: "listing",
            path: folder.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        files.push(relative);
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, String>,
    folders: BTreeSet<PathBuf>,
}

impl MemoryState {
    fn add_ancestors(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.folders.insert(ancestor.to_path_buf());
        }
    }
}

/// In-process store for tests and embedders that keep documents elsewhere.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, S)>,
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let mut state = MemoryState::default();
        for (path, text) in files {
            let path = path.into();
            state.add_ancestors(&path);
            state.files.insert(path, text.into());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// All file paths currently stored, sorted.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().await.files.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_folder(&self, path: &Path) -> Result<(), StoreError> {
        validate_store_path(path)?;
        let mut state = self.state.lock().await;
        if state.files.contains_key(path) {
            return Err(StoreError::Conflict(path.to_path_buf()));
        }
        if !state.folders.insert(path.to_path_buf()) {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        state.add_ancestors(path);
        Ok(())
    }

    async fn get_entry(&self, path: &Path) -> Result<Option<Entry>, StoreError> {
        validate_store_path(path)?;
        let state = self.state.lock().await;
        let kind = if state.files.contains_key(path) {
            EntryKind::File
        } else if state.folders.contains(path) {
            EntryKind::Folder
        } else {
            return Ok(None);
        };
        Ok(Some(Entry {
            path: path.to_path_buf(),
            kind,
        }))
    }

    async fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, StoreError> {
        validate_store_path(folder)?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .keys()
            .filter(|p| p.starts_with(folder) && p.as_path() != folder)
            .cloned()
            .collect())
    }

    async fn read(&self, path: &Path) -> Result<String, StoreError> {
        validate_store_path(path)?;
        let state = self.state.lock().await;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }

    async fn create(&self, path: &Path, text: &str) -> Result<(), StoreError> {
        validate_store_path(path)?;
        let mut state = self.state.lock().await;
        if state.files.contains_key(path) || state.folders.contains(path) {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        state.add_ancestors(path);
        state.files.insert(path.to_path_buf(), text.to_string());
        Ok(())
    }

    async fn modify(&self, path: &Path, text: &str) -> Result<(), StoreError> {
        validate_store_path(path)?;
        let mut state = self.state.lock().await;
        if state.folders.contains(path) {
            return Err(StoreError::NotAFile(path.to_path_buf()));
        }
        match state.files.get_mut(path) {
            Some(existing) => {
                *existing = text.to_string();
                Ok(())
            }
            None => Err(StoreError::NotFound(path.to_path_buf())),
        }
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        validate_store_path(path)?;
        let mut state = self.state.lock().await;
        if state.folders.contains(path) {
            return Err(StoreError::NotAFile(path.to_path_buf()));
        }
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight through one fetcher.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying retryable failures with exponential backoff.
    /// Headers are never recorded in the span.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, headers).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        // The semaphore is owned by the fetcher and never closed.
        let _permit = self.limit.acquire().await.ok();
        let mut attempt = 0usize;

        loop {
            let result = self.client.get(url).headers(headers.clone()).send().await;
            let can_retry = attempt < self.backoff.max_retries;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        tracing::debug!(status = status.as_u16(), attempt, "retrying http fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        tracing::debug!(error = %err, attempt, "retrying http fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

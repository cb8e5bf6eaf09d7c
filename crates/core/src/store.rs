//! Metadata blob stores.
//!
//! Every backend exposes the same three operations. Keys and URIs coincide
//! for the local backends; the HTTP backend resolves relative keys against
//! its base URL and fetches absolute URIs as-is.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record at '{0}'")]
    NotFound(String),
    #[error("invalid location '{0}'")]
    InvalidLocation(String),
    #[error("{0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(format!("{err:#}"))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn download(&self, uri: &str) -> StoreResult<Vec<u8>>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()>;
}

/// Process-local store. Counts downloads so callers can assert on fetch traffic.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    downloads: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(key: impl Into<String>, bytes: Vec<u8>) -> Self {
        let store = Self::default();
        store.insert(key, bytes);
        store
    }

    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.lock().insert(key.into(), bytes);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A poisoned map is still a consistent map: every write is a single insert.
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn download(&self, uri: &str) -> StoreResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.get(uri)
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.lock().contains_key(key))
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        self.insert(key, bytes);
        Ok(())
    }
}

fn default_db_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| ".".into());
    let base: PathBuf = std::env::var("MWT_DATA")
        .map(Into::into)
        .unwrap_or(home.join(".mwt"));
    base.join("state").join("metadata.db")
}

/// SQLite-backed store, one row per key.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    path: PathBuf,
}

impl Default for SqliteMetadataStore {
    fn default() -> Self {
        Self::open(default_db_path())
    }
}

impl SqliteMetadataStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let res = tokio::task::spawn_blocking(move || {
            let c = conn(path)?;
            op(&c)
        })
        .await
        .context("spawn_blocking join failed")??;
        Ok(res)
    }
}

// Synchronous connection setup, only called inside spawn_blocking.
fn conn(path: PathBuf) -> anyhow::Result<Connection> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create parent dir for {}", path.display()))?;
    }
    let c = Connection::open(&path).with_context(|| format!("open sqlite at {}", path.display()))?;
    c.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS metadata_blob (
          key TEXT PRIMARY KEY,
          body BLOB NOT NULL,
          updated_at INTEGER NOT NULL
        );
    ",
    )?;
    Ok(c)
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn download(&self, uri: &str) -> StoreResult<Vec<u8>> {
        let key = uri.to_string();
        let found = self
            .with_conn(move |c| {
                let body = c
                    .query_row(
                        "SELECT body FROM metadata_blob WHERE key=?1",
                        params![&key],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(body)
            })
            .await?;
        found.ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |c| {
            let hit = c
                .query_row(
                    "SELECT 1 FROM metadata_blob WHERE key=?1",
                    params![&key],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |c| {
            let now = chrono::Utc::now().timestamp();
            c.execute(
                "INSERT INTO metadata_blob(key, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET body=excluded.body, updated_at=excluded.updated_at",
                params![key, bytes, now],
            )?;
            Ok(())
        })
        .await
    }
}

/// Blob store reached over plain HTTP: GET to read, HEAD to probe, PUT to write.
#[derive(Debug, Clone)]
pub struct HttpMetadataStore {
    client: reqwest::Client,
    base: Url,
}

impl HttpMetadataStore {
    pub fn new(base: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("failed to build http client, falling back to default: {}", e);
                reqwest::Client::new()
            });
        Self::with_client(base, client)
    }

    pub fn with_client(base: Url, client: reqwest::Client) -> Self {
        Self { client, base }
    }

    fn resolve(&self, location: &str) -> StoreResult<Url> {
        match Url::parse(location) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base
                .join(location)
                .map_err(|_| StoreError::InvalidLocation(location.to_string())),
            Err(_) => Err(StoreError::InvalidLocation(location.to_string())),
        }
    }
}

fn backend(err: reqwest::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn download(&self, uri: &str) -> StoreResult<Vec<u8>> {
        let url = self.resolve(uri)?;
        let resp = self.client.get(url).send().await.map_err(backend)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        let body = resp
            .error_for_status()
            .map_err(backend)?
            .bytes()
            .await
            .map_err(backend)?;
        Ok(body.to_vec())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let url = self.resolve(key)?;
        let resp = self.client.head(url).send().await.map_err(backend)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StoreError::Backend(format!("HEAD {key} returned {status}"))),
        }
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let url = self.resolve(key)?;
        self.client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(backend)?
            .error_for_status()
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_round_trips_and_reports_missing() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = SqliteMetadataStore::open(temp_dir.path().join("meta.db"));

        assert!(!store.exists("mwt-settings/client").await.unwrap());
        store
            .upload("mwt-settings/client", b"{\"applicationId\":\"a\"}".to_vec())
            .await
            .expect("upload failed");
        assert!(store.exists("mwt-settings/client").await.unwrap());
        assert_eq!(
            store.download("mwt-settings/client").await.unwrap(),
            b"{\"applicationId\":\"a\"}".to_vec()
        );

        store
            .upload("mwt-settings/client", b"{}".to_vec())
            .await
            .expect("overwrite failed");
        assert_eq!(store.download("mwt-settings/client").await.unwrap(), b"{}".to_vec());

        assert!(matches!(
            store.download("non_existent_key_9999").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_counts_downloads_only() {
        let store = MemoryMetadataStore::with_blob("k", vec![1, 2, 3]);
        assert!(store.exists("k").await.unwrap());
        store.upload("other", vec![4]).await.unwrap();
        assert_eq!(store.download_count(), 0);
        assert_eq!(store.download("k").await.unwrap(), vec![1, 2, 3]);
        assert!(store.download("missing").await.is_err());
        assert_eq!(store.download_count(), 2);
    }

    #[test]
    fn http_store_resolves_relative_keys_against_base() {
        let store = HttpMetadataStore::new(Url::parse("https://blobs.example/settings/").unwrap());
        assert_eq!(
            store.resolve("mwt-settings/client").unwrap().as_str(),
            "https://blobs.example/settings/mwt-settings/client"
        );
        assert_eq!(
            store.resolve("https://other.example/x?sig=abc").unwrap().as_str(),
            "https://other.example/x?sig=abc"
        );
    }
}

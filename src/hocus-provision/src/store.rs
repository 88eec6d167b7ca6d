//! Durable key-material store.
//!
//! A namespaced blob store addressed by stable object names. The remote
//! store is the cross-restart owner of serialized identities; during a run
//! it is read at most once (restore) and written best-effort.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

pub const CA_CERT: &str = "cacerts/ca-cert";
pub const CA_KEY: &str = "private/ca-key";
pub const SERVER_CERT: &str = "certs/server-cert";
pub const SERVER_KEY: &str = "private/server-key";

pub fn client_cert_object(device: &str) -> String {
    format!("certs/client-{device}-cert")
}

pub fn client_key_object(device: &str) -> String {
    format!("private/client-{device}-key")
}

pub fn client_p12_object(device: &str) -> String {
    format!("client-{device}.p12")
}

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0:?} not found")]
    NotFound(String),

    #[error("store backend unavailable: {0}")]
    Transient(String),

    #[error("store permission denied: {0}")]
    Permission(String),
}

impl StoreError {
    /// During restore, not-found and transient failures are treated
    /// identically: the object is absent for this run.
    pub fn treat_as_absent(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Transient(_))
    }
}

/// Namespaced blob store for serialized identities.
#[async_trait]
pub trait KeyMaterialStore: Send + Sync {
    async fn get(&self, object: &str) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, object: &str, data: &[u8]) -> Result<(), StoreError>;
}

/// HTTP backend: objects live under a base URL, `GET`/`PUT` per object.
pub struct HttpKeyMaterialStore {
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpKeyMaterialStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            max_retries,
        }
    }

    fn object_url(&self, object: &str) -> String {
        format!("{}/{object}", self.base_url)
    }

    fn map_status(object: &str, status: reqwest::StatusCode) -> StoreError {
        match status.as_u16() {
            404 => StoreError::NotFound(object.to_string()),
            401 | 403 => StoreError::Permission(format!("{object}: HTTP {status}")),
            _ => StoreError::Transient(format!("{object}: HTTP {status}")),
        }
    }

    async fn get_once(&self, object: &str, url: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::map_status(object, response.status()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(body.to_vec())
    }

    async fn put_once(&self, object: &str, url: &str, data: &[u8]) -> Result<(), StoreError> {
        let response = self
            .client
            .put(url)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::map_status(object, response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyMaterialStore for HttpKeyMaterialStore {
    async fn get(&self, object: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.object_url(object);
        let mut last = StoreError::Transient("no attempts made".into());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            match self.get_once(object, &url).await {
                Ok(data) => return Ok(data),
                // only transient failures are worth retrying
                Err(e @ StoreError::Transient(_)) => {
                    debug!(object, attempt, error = %e, "store read attempt failed");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn put(&self, object: &str, data: &[u8]) -> Result<(), StoreError> {
        let url = self.object_url(object);
        let mut last = StoreError::Transient("no attempts made".into());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            match self.put_once(object, &url, data).await {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::Transient(_)) => {
                    debug!(object, attempt, error = %e, "store write attempt failed");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

/// In-process store used by tests, with read/write failure injection.
#[derive(Default)]
pub struct MemoryKeyMaterialStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    deny_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryKeyMaterialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn deny_reads(&self, deny: bool) {
        self.deny_reads.store(deny, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, object: &str, data: &[u8]) {
        self.objects
            .lock()
            .expect("store lock")
            .insert(object.to_string(), data.to_vec());
    }

    pub fn remove(&self, object: &str) {
        self.objects.lock().expect("store lock").remove(object);
    }

    pub fn contains(&self, object: &str) -> bool {
        self.objects.lock().expect("store lock").contains_key(object)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyMaterialStore for MemoryKeyMaterialStore {
    async fn get(&self, object: &str) -> Result<Vec<u8>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("injected read failure".into()));
        }
        if self.deny_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Permission("injected access denial".into()));
        }
        self.objects
            .lock()
            .expect("store lock")
            .get(object)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(object.to_string()))
    }

    async fn put(&self, object: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Permission("injected write failure".into()));
        }
        self.insert(object, data);
        Ok(())
    }
}

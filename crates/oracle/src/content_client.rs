//! Content-addressed storage adapter.
//!
//! Fetches report bodies by content identifier through an HTTP gateway
//! (`GET {gateway}/{content_id}`). Bodies are JSON documents; anything else
//! is a decode error and the caller skips the report for this cycle.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_GATEWAY_URL: &str = "https://gateway.pinata.cloud/ipfs";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    #[error("content {0} not found")]
    NotFound(String),

    #[error("gateway request failed: {0}")]
    Network(String),

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway returned {0}")]
    Status(u16),

    #[error("content is not valid JSON: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetches and parses the JSON document stored at `content_id`.
    async fn fetch(&self, content_id: &str) -> Result<Value, ContentError>;
}

#[derive(Clone)]
pub struct HttpContentGateway {
    base: Url,
    client: Client,
}

impl HttpContentGateway {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, ContentError> {
        let base = Url::parse(base.trim_end_matches('/'))
            .map_err(|e| ContentError::InvalidUrl(format!("{}: {}", base, e)))?;
        if base.cannot_be_a_base() {
            return Err(ContentError::InvalidUrl(base.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContentError::Network(e.to_string()))?;
        Ok(HttpContentGateway { base, client })
    }

    fn content_url(&self, content_id: &str) -> Result<Url, ContentError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ContentError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(content_id.trim());
        Ok(url)
    }
}

#[async_trait]
impl ContentStore for HttpContentGateway {
    async fn fetch(&self, content_id: &str) -> Result<Value, ContentError> {
        let url = self.content_url(content_id)?;
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ContentError::Timeout
            } else {
                ContentError::Network(e.to_string())
            }
        })?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ContentError::NotFound(content_id.to_string()));
        }
        if !status.is_success() {
            return Err(ContentError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ContentError::Timeout
            } else {
                ContentError::Network(e.to_string())
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| ContentError::Decode(e.to_string()))
    }
}

/// In-memory content store. Identifiers listed via [`fail`](Self::fail)
/// return a network error until [`recover`](Self::recover) is called.
#[derive(Default)]
pub struct MockContentStore {
    objects: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    fetches: Mutex<usize>,
}

impl MockContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) the document at `content_id`.
    pub fn put(&self, content_id: &str, doc: Value) {
        self.objects.lock().insert(content_id.to_string(), doc);
    }

    pub fn fail(&self, content_id: &str) {
        self.failing.lock().insert(content_id.to_string());
    }

    pub fn recover(&self, content_id: &str) {
        self.failing.lock().remove(content_id);
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock()
    }
}

#[async_trait]
impl ContentStore for MockContentStore {
    async fn fetch(&self, content_id: &str) -> Result<Value, ContentError> {
        *self.fetches.lock() += 1;
        if self.failing.lock().contains(content_id) {
            return Err(ContentError::Network("mock gateway unavailable".to_string()));
        }
        self.objects
            .lock()
            .get(content_id)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(content_id.to_string()))
    }
}

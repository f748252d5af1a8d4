//! Resource store
//!
//! Key-value storage over named generations. Each generation maps a request
//! key to the bytes of a successful origin response. Two backends exist: an
//! in-memory map and an on-disk store for persistence across restarts.

pub mod disk;
pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::origin::{OriginResponse, ResourceRequest};

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Store error types
///
/// Callers treat every variant as a cache miss; none of them is ever
/// surfaced to the end user.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Resource store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt store entry: {0}")]
    Corrupt(String),
}

/// Identity of a cached request: method plus URL without fragment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn from_request(request: &ResourceRequest) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", request.method, url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    /// Request identity this entry answers
    pub key: RequestKey,
    /// HTTP status of the stored response (always 2xx)
    pub status: u16,
    /// Content-Type of the stored response
    pub content_type: Option<String>,
    /// Response body
    pub body: Bytes,
    /// When the entry was stored, in milliseconds since the Unix epoch
    pub stored_at: u64,
}

impl CachedEntry {
    /// Build an entry from an origin response
    ///
    /// Returns `None` for non-success responses, which are never stored.
    pub fn from_response(key: RequestKey, response: &OriginResponse) -> Option<Self> {
        if !response.is_success() {
            return None;
        }

        Some(Self {
            key,
            status: response.status,
            content_type: response.content_type.clone(),
            body: response.body.clone(),
            stored_at: now_millis(),
        })
    }
}

/// Handle to an opened generation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationHandle {
    name: String,
}

impl GenerationHandle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Storage backend for generations of cached entries
///
/// All operations are atomic per entry. A `put` into a generation that has
/// been deleted since it was opened is dropped, so a late write can never
/// resurrect a purged generation.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Open a generation, creating it if it does not exist
    async fn open(&self, name: &str) -> Result<GenerationHandle, StoreError>;

    /// Look up an entry by key
    async fn get(
        &self,
        handle: &GenerationHandle,
        key: &RequestKey,
    ) -> Result<Option<CachedEntry>, StoreError>;

    /// Store an entry, replacing any previous entry with the same key
    async fn put(&self, handle: &GenerationHandle, entry: CachedEntry) -> Result<(), StoreError>;

    /// Delete a whole generation. Returns whether it existed.
    async fn delete_generation(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of every generation currently present
    async fn generation_names(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Number of entries in a generation (0 if it no longer exists)
    async fn entry_count(&self, handle: &GenerationHandle) -> Result<usize, StoreError>;
}

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = ResourceRequest::get(Url::parse("http://localhost/index.html#top").unwrap());
        let b = ResourceRequest::get(Url::parse("http://localhost/index.html").unwrap());
        assert_eq!(RequestKey::from_request(&a), RequestKey::from_request(&b));
        assert_eq!(
            RequestKey::from_request(&b).as_str(),
            "GET http://localhost/index.html"
        );
    }

    #[test]
    fn test_failed_response_never_becomes_entry() {
        let key = RequestKey::from("GET http://localhost/x".to_string());
        let failed = OriginResponse {
            status: 500,
            content_type: None,
            body: Bytes::from_static(b"boom"),
        };
        assert!(CachedEntry::from_response(key.clone(), &failed).is_none());

        let ok = OriginResponse {
            status: 200,
            content_type: Some("text/html".into()),
            body: Bytes::from_static(b"<html>"),
        };
        let entry = CachedEntry::from_response(key, &ok).unwrap();
        assert_eq!(entry.status, 200);
        assert!(entry.stored_at > 0);
    }
}

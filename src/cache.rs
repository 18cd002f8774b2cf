//! Response cache used by the request layer.
//!
//! The cache is keyed by a request signature (method, path, query parameters and the API key
//! header) and stores raw response bodies together with the headers they were stored with. The
//! expiry of every entry is computed from the client-side TTL when the entry is stored; whatever
//! cache metadata the server sent is replaced.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    error::CacheError,
    transport::{find_header, ApiRequest, ApiResponse, AUTH_HEADER},
};

/// Opaque cache key derived from a request signature.
///
/// The signature is hashed, so the API key never appears in the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key for `request`.
    pub fn for_request(request: &ApiRequest) -> CacheKey {
        let mut query: Vec<(String, String)> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        query.sort();

        let mut signature = format!("{} {}", request.method, request.url.path());
        for (key, value) in &query {
            signature.push_str(&format!("\n{key}={value}"));
        }
        signature.push('\n');
        signature.push_str(request.header_value(AUTH_HEADER).unwrap_or_default());

        CacheKey(format!("{:x}", md5::compute(signature)))
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    /// Response headers, with cache metadata rewritten to the client TTL.
    pub headers: Vec<(String, String)>,
    #[allow(missing_docs)]
    pub body: Vec<u8>,
    #[allow(missing_docs)]
    pub stored_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
    /// Max-age written for entries that never expire.
    pub const UNBOUNDED_MAX_AGE: u64 = i64::MAX as u64;

    /// Build an entry from a fresh `response`, overriding its cache metadata with `ttl_seconds`.
    ///
    /// A TTL of zero means "cache forever".
    pub fn from_response(
        response: &ApiResponse,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> CachedResponse {
        let max_age = if ttl_seconds == 0 {
            CachedResponse::UNBOUNDED_MAX_AGE
        } else {
            ttl_seconds
        };
        let expires_at = (ttl_seconds != 0)
            .then(|| {
                i64::try_from(ttl_seconds)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .and_then(|ttl| now.checked_add_signed(ttl))
            })
            .flatten();

        CachedResponse {
            headers: override_cache_headers(&response.headers, max_age),
            body: response.body.clone(),
            stored_at: now,
            expires_at,
        }
    }

    #[allow(missing_docs)]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Returns the value of the header `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Replace server cache metadata with `cache-control: max-age=<max_age>`.
///
/// `expires` and `s-maxage` are dropped rather than merged, so the client TTL always wins.
pub fn override_cache_headers(headers: &[(String, String)], max_age: u64) -> Vec<(String, String)> {
    const OVERRIDDEN: [&str; 3] = ["cache-control", "expires", "s-maxage"];

    let mut result: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !OVERRIDDEN.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .cloned()
        .collect();
    result.push(("cache-control".to_owned(), format!("max-age={max_age}")));
    result
}

/// Storage for cached responses.
///
/// Implementations must be safe to share between concurrent requests; they serialize their own
/// reads and writes.
pub trait CacheStore: Send + Sync {
    /// Look up an entry. Expired entries may be returned; the caller checks expiry.
    fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError>;
    /// Insert or replace an entry.
    fn put(&self, key: CacheKey, response: CachedResponse) -> Result<(), CacheError>;
    /// Remove an entry if present.
    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
    /// Remove all entries.
    fn clear(&self) -> Result<(), CacheError>;
}

/// In-memory [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<CacheKey, CachedResponse>>,
}

impl MemoryCacheStore {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        MemoryCacheStore::default()
    }

    /// Create a store wrapped in an `Arc`, ready to be put into a
    /// [`CachePolicy`](crate::CachePolicy).
    pub fn shared() -> Arc<MemoryCacheStore> {
        Arc::new(MemoryCacheStore::new())
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Unavailable("cache lock poisoned".to_owned())
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    fn put(&self, key: CacheKey, response: CachedResponse) -> Result<(), CacheError> {
        self.entries.write().map_err(poisoned)?.insert(key, response);
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

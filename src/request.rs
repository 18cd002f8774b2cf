//! Cache-aware request layer.
//!
//! [`RequestLayer::fetch`] performs one logical fetch under a [`CachePolicy`] and reports where the
//! answer came from. It never consults default flags; that decision belongs to
//! [`resolve`](crate::resolve).
use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::{
    cache::{CacheKey, CachedResponse},
    config::CachePolicy,
    error::CacheError,
    transport::{ApiRequest, Transport},
    Error,
};

/// Result of a fetch, tagged with its provenance.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Decoded from a network response.
    Fresh(T),
    /// Decoded from a valid cache entry.
    Cached(T),
    /// Neither the network nor the cache produced a value.
    Failure(Error),
}

impl<T> Outcome<T> {
    /// Map the carried value, keeping provenance.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Fresh(value) => Outcome::Fresh(f(value)),
            Outcome::Cached(value) => Outcome::Cached(f(value)),
            Outcome::Failure(err) => Outcome::Failure(err),
        }
    }

    /// Convert into a `Result`, forgetting provenance.
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Outcome::Fresh(value) | Outcome::Cached(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
        }
    }
}

/// Per-request cache behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Follow the [`CachePolicy`].
    #[default]
    Default,
    /// Never read from the cache, but still store the fresh response.
    Reload,
}

/// Issues requests through a [`Transport`] and applies the cache policy.
#[derive(Clone)]
pub struct RequestLayer {
    transport: Arc<dyn Transport>,
}

impl RequestLayer {
    #[allow(missing_docs)]
    pub fn new(transport: Arc<dyn Transport>) -> RequestLayer {
        RequestLayer { transport }
    }

    /// Fetch and decode `request`.
    ///
    /// Only `GET` requests are cached. With caching enabled, a valid cache entry is served:
    /// - before the network call, if `policy.skip_network_when_cached` is set;
    /// - after a failed network call or undecodable response, otherwise.
    ///
    /// Expired or corrupted entries are treated as missing.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        policy: &CachePolicy,
        mode: CacheMode,
    ) -> Outcome<T> {
        let key = (policy.enabled && request.method == Method::GET)
            .then(|| CacheKey::for_request(&request));
        let read_key = key.as_ref().filter(|_| mode == CacheMode::Default);

        if let Some(key) = read_key.filter(|_| policy.skip_network_when_cached) {
            if let Some(value) = read_cache(policy, key) {
                log::debug!(target: "flagsync", path = request.url.path(); "serving cached response without network call");
                return Outcome::Cached(value);
            }
        }

        let path = request.url.path().to_owned();
        let error = match self.transport.perform(request).await {
            Ok(response) => match serde_json::from_slice::<T>(&response.body) {
                Ok(value) => {
                    if let Some(key) = &key {
                        let entry = CachedResponse::from_response(&response, policy.ttl_seconds, Utc::now());
                        if let Err(err) = policy.store.put(key.clone(), entry) {
                            log::warn!(target: "flagsync", path = path.as_str(); "failed to store response in cache: {err}");
                        }
                    }
                    return Outcome::Fresh(value);
                }
                Err(err) => {
                    log::warn!(target: "flagsync", path = path.as_str(); "failed to decode response: {err}");
                    Error::from(err)
                }
            },
            Err(err) => {
                log::warn!(target: "flagsync", path = path.as_str(); "request failed: {err}");
                Error::from(err)
            }
        };

        if let Some(key) = read_key {
            if let Some(value) = read_cache(policy, key) {
                log::debug!(target: "flagsync", path = path.as_str(); "network failed, serving cached response");
                return Outcome::Cached(value);
            }
        }

        Outcome::Failure(error)
    }
}

/// Read and decode a non-expired entry. Any cache problem is a miss.
fn read_cache<T: DeserializeOwned>(policy: &CachePolicy, key: &CacheKey) -> Option<T> {
    let entry = match policy.store.get(key) {
        Ok(entry) => entry?,
        Err(err) => {
            log::warn!(target: "flagsync", "cache read failed, treating as miss: {err}");
            return None;
        }
    };

    if entry.is_expired_at(Utc::now()) {
        log::trace!(target: "flagsync", "cache entry expired");
        return None;
    }

    match serde_json::from_slice(&entry.body) {
        Ok(value) => Some(value),
        Err(err) => {
            let err = CacheError::Corrupted(Arc::new(err));
            log::warn!(target: "flagsync", "{err}, treating as miss");
            if let Err(err) = policy.store.remove(key) {
                log::warn!(target: "flagsync", "failed to remove corrupted cache entry: {err}");
            }
            None
        }
    }
}

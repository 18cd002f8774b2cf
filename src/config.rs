use std::{fmt, sync::Arc, time::Duration};

use crate::{
    analytics::{LedgerStore, MemoryLedgerStore},
    backoff::BackoffConfig,
    cache::{CacheStore, MemoryCacheStore},
    transport::Transport,
    Client, FlagSnapshot,
};

/// How responses are cached.
///
/// The policy is read at the start of every request. Changing it affects the next request only;
/// entries already stored keep the expiry computed when they were stored.
#[derive(Clone)]
pub struct CachePolicy {
    /// Whether responses are stored and consulted at all.
    pub enabled: bool,
    /// Lifetime of a stored response in seconds. `0` caches for the maximum representable
    /// duration.
    pub ttl_seconds: u64,
    /// Serve a valid cached response without touching the network.
    pub skip_network_when_cached: bool,
    /// Where responses are stored.
    pub store: Arc<dyn CacheStore>,
}

impl CachePolicy {
    /// A disabled policy with an empty in-memory store.
    pub fn new() -> CachePolicy {
        CachePolicy::default()
    }

    /// Turn caching on or off.
    pub fn enabled(mut self, enabled: bool) -> CachePolicy {
        self.enabled = enabled;
        self
    }

    /// Set time-to-live of stored responses.
    pub fn ttl_seconds(mut self, ttl_seconds: u64) -> CachePolicy {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Serve valid cached responses without a network call.
    pub fn skip_network_when_cached(mut self, skip: bool) -> CachePolicy {
        self.skip_network_when_cached = skip;
        self
    }

    /// Use a custom cache store.
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> CachePolicy {
        self.store = store;
        self
    }
}

impl Default for CachePolicy {
    fn default() -> CachePolicy {
        CachePolicy {
            enabled: false,
            ttl_seconds: 0,
            skip_network_when_cached: false,
            store: Arc::new(MemoryCacheStore::new()),
        }
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("enabled", &self.enabled)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("skip_network_when_cached", &self.skip_network_when_cached)
            .finish_non_exhaustive()
    }
}

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use flagsync::{CachePolicy, ClientConfig, FlagRecord};
/// let client = ClientConfig::from_api_key("api-key")
///     .default_flags([FlagRecord::new("checkout_v2", false, "legacy")].into_iter().collect())
///     .cache_policy(CachePolicy::new().enabled(true).ttl_seconds(300))
///     .to_client();
/// ```
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) realtime_url: String,
    pub(crate) default_flags: Arc<FlagSnapshot>,
    pub(crate) cache_policy: CachePolicy,
    pub(crate) analytics_enabled: bool,
    pub(crate) analytics_flush_period: Duration,
    pub(crate) ledger_store: Arc<dyn LedgerStore>,
    pub(crate) request_timeout: Duration,
    pub(crate) stream_idle_timeout: Duration,
    pub(crate) backoff: BackoffConfig,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl ClientConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://edge.api.flagsmith.com/api/v1/";
    /// Default base URL of the real-time event stream.
    pub const DEFAULT_REALTIME_URL: &'static str = "https://realtime.flagsmith.com/";
    /// Default timeout of a single API request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// If the event stream is silent for this long, the connection is treated as timed out.
    pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default period between analytics flushes.
    pub const DEFAULT_ANALYTICS_FLUSH_PERIOD: Duration = Duration::from_secs(10);

    /// Create a default configuration using the specified API key.
    ///
    /// ```
    /// # use flagsync::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            realtime_url: ClientConfig::DEFAULT_REALTIME_URL.to_owned(),
            default_flags: Arc::new(FlagSnapshot::new()),
            cache_policy: CachePolicy::default(),
            analytics_enabled: false,
            analytics_flush_period: ClientConfig::DEFAULT_ANALYTICS_FLUSH_PERIOD,
            ledger_store: Arc::new(MemoryLedgerStore::new()),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            stream_idle_timeout: ClientConfig::DEFAULT_STREAM_IDLE_TIMEOUT,
            backoff: BackoffConfig::default(),
            transport: None,
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override base URL of the real-time event stream.
    pub fn realtime_url(mut self, realtime_url: impl Into<String>) -> Self {
        self.realtime_url = realtime_url.into();
        self
    }

    /// Flags served when neither the network nor the cache can answer.
    ///
    /// Flags whose value is [`TypedValue::Null`](crate::TypedValue::Null) are never served.
    pub fn default_flags(mut self, default_flags: FlagSnapshot) -> Self {
        self.default_flags = Arc::new(default_flags);
        self
    }

    /// Set response caching policy.
    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    /// Turn flag query analytics on or off.
    pub fn enable_analytics(mut self, enabled: bool) -> Self {
        self.analytics_enabled = enabled;
        self
    }

    /// Set period between analytics uploads.
    pub fn analytics_flush_period(mut self, period: Duration) -> Self {
        self.analytics_flush_period = period;
        self
    }

    /// Where analytics counts are persisted between flushes. Defaults to memory only.
    pub fn ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = store;
        self
    }

    /// Set timeout of a single API request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set how long the event stream may stay silent before it reconnects.
    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Set reconnect backoff of the event stream.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send API requests through a custom [`Transport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use flagsync::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_api_key("api-key").to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}

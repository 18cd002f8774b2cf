use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use tokio::{runtime::Handle, sync::mpsc, sync::watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    analytics::{AnalyticsBatcher, AnalyticsLedger, AnalyticsUploader},
    backoff::BackoffConfig,
    config::CachePolicy,
    error::ConfigurationError,
    event_stream::{EventHandler, EventStream, FlagEvent, StreamConfig, StreamState},
    fallback::{self, Resolution},
    request::{CacheMode, Outcome, RequestLayer},
    snapshot_store::SnapshotStore,
    transport::{ApiRequest, HttpTransport, Transport, AUTH_HEADER},
    ClientConfig, FlagQuery, FlagSnapshot, Identity, Result, Trait, TypedValue,
};

/// A client for the flag service.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// All operations read the client settings once when they start, so setters take effect on the
/// next operation and never affect one already in flight.
///
/// # Examples
/// ```
/// # use flagsync::{Client, ClientConfig};
/// # async fn test() -> flagsync::Result<()> {
/// let client = Client::new(ClientConfig::from_api_key("api-key"));
/// if client.is_enabled("checkout_v2", None).await? {
///     // ...
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    settings: Arc<RwLock<Settings>>,
    requests: RequestLayer,
    analytics: AnalyticsBatcher,
    snapshots: Arc<SnapshotStore>,
    live: Mutex<Option<LiveUpdates>>,
}

#[derive(Debug, Clone)]
struct Settings {
    api_key: String,
    base_url: String,
    realtime_url: String,
    default_flags: Arc<FlagSnapshot>,
    cache_policy: CachePolicy,
    stream_idle_timeout: Duration,
    backoff: BackoffConfig,
}

impl Settings {
    /// Build a request to `path` (relative to the base URL) with the auth header set.
    fn request(&self, method: Method, path: &str) -> Result<ApiRequest> {
        if self.api_key.is_empty() {
            return Err(ConfigurationError::MissingApiKey.into());
        }
        let base = if self.base_url.ends_with('/') {
            Url::parse(&self.base_url)
        } else {
            Url::parse(&format!("{}/", self.base_url))
        };
        let url = base
            .and_then(|base| base.join(path))
            .map_err(ConfigurationError::InvalidBaseUrl)?;

        Ok(ApiRequest::new(method, url).header(AUTH_HEADER, &self.api_key))
    }

    fn identity_request(&self, identity: &str) -> Result<ApiRequest> {
        let mut request = self.request(Method::GET, "identities/")?;
        request
            .url
            .query_pairs_mut()
            .append_pair("identifier", identity);
        Ok(request)
    }
}

struct LiveUpdates {
    stream: EventStream,
    cancel: CancellationToken,
    handler: Arc<Mutex<Option<EventHandler>>>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use flagsync::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_api_key("api-key"));
    /// ```
    pub fn new(config: ClientConfig) -> Self {
        let transport = config
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(config.request_timeout)));
        let settings = Arc::new(RwLock::new(Settings {
            api_key: config.api_key,
            base_url: config.base_url,
            realtime_url: config.realtime_url,
            default_flags: config.default_flags,
            cache_policy: config.cache_policy,
            stream_idle_timeout: config.stream_idle_timeout,
            backoff: config.backoff,
        }));
        let analytics = AnalyticsBatcher::new(
            config.ledger_store,
            Arc::new(AnalyticsEndpoint {
                settings: settings.clone(),
                transport: transport.clone(),
            }),
            config.analytics_enabled,
            config.analytics_flush_period,
        );

        Client {
            settings,
            requests: RequestLayer::new(transport),
            analytics,
            snapshots: Arc::new(SnapshotStore::new()),
            live: Mutex::new(None),
        }
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .expect("thread holding settings lock should not panic")
            .clone()
    }

    fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self
            .settings
            .write()
            .expect("thread holding settings lock should not panic"));
    }

    /// Get all flags, for `identity` if given, or for the environment otherwise.
    ///
    /// Falls back to a cached response and then to the default flags when the service cannot be
    /// reached. Fails only if all three are unavailable.
    pub async fn get_flags(&self, identity: Option<&str>) -> Result<Arc<FlagSnapshot>> {
        Ok(self.get_flags_with_provenance(identity).await?.snapshot)
    }

    /// Same as [`Client::get_flags`], but also tells where the flags came from.
    pub async fn get_flags_with_provenance(&self, identity: Option<&str>) -> Result<Resolution> {
        self.query(&FlagQuery::for_identity(identity)).await
    }

    /// Resolve `query`.
    ///
    /// With [`FlagQuery::flag_name`] set, the resolved snapshot holds at most that flag, and only
    /// that flag is counted for analytics (even when resolution fails). Otherwise every returned
    /// flag is counted.
    pub async fn query(&self, query: &FlagQuery) -> Result<Resolution> {
        let Some(flag_name) = &query.flag_name else {
            let resolution = self.resolve(query.identity.as_deref()).await?;
            for name in resolution.snapshot.names() {
                self.analytics.track_query(name);
            }
            return Ok(resolution);
        };

        self.analytics.track_query(flag_name);
        let resolution = self.resolve(query.identity.as_deref()).await?;
        Ok(Resolution {
            snapshot: Arc::new(resolution.snapshot.get(flag_name).cloned().into_iter().collect()),
            provenance: resolution.provenance,
        })
    }

    /// Returns `true` if the flag is present and enabled. An absent flag is not enabled.
    pub async fn is_enabled(&self, flag_name: &str, identity: Option<&str>) -> Result<bool> {
        let query = FlagQuery::for_identity(identity).with_flag(flag_name);
        Ok(self.query(&query).await?.snapshot.is_enabled(flag_name))
    }

    /// Returns the value of the flag, or `None` if the flag is absent or has no value.
    pub async fn get_value(
        &self,
        flag_name: &str,
        identity: Option<&str>,
    ) -> Result<Option<TypedValue>> {
        let query = FlagQuery::for_identity(identity).with_flag(flag_name);
        Ok(self.query(&query).await?.snapshot.value(flag_name).cloned())
    }

    async fn resolve(&self, identity: Option<&str>) -> Result<Resolution> {
        self.analytics.ensure_running();
        let settings = self.settings();

        let ticket = self.snapshots.ticket();
        let outcome = fetch_flags(&self.requests, &settings, identity, CacheMode::Default).await;
        let resolution = fallback::resolve(outcome, &settings.default_flags).inspect_err(|err| {
            log::warn!(target: "flagsync", identity; "failed to resolve flags: {err}");
        })?;

        log::trace!(target: "flagsync",
                    identity,
                    provenance:? = resolution.provenance,
                    flags = resolution.snapshot.len();
                    "resolved flags");

        if identity.is_none() && resolution.provenance == fallback::Provenance::Fresh {
            self.snapshots.set_snapshot(ticket, resolution.snapshot.clone());
        }
        Ok(resolution)
    }

    /// Get flags and traits of `identity`.
    ///
    /// Default flags do not apply here: on failure the error is returned.
    pub async fn get_identity(&self, identity: &str) -> Result<Identity> {
        let settings = self.settings();
        let request = settings.identity_request(identity)?;
        self.requests
            .fetch(request, &settings.cache_policy, CacheMode::Default)
            .await
            .into_result()
    }

    /// Get traits of `identity`, optionally only those with the given `keys`.
    pub async fn get_traits(&self, identity: &str, keys: Option<&[&str]>) -> Result<Vec<Trait>> {
        let traits = self.get_identity(identity).await?.traits;
        Ok(match keys {
            Some(keys) => traits
                .into_iter()
                .filter(|t| keys.contains(&t.key.as_str()))
                .collect(),
            None => traits,
        })
    }

    /// Get a single trait of `identity`.
    pub async fn get_trait(&self, key: &str, identity: &str) -> Result<Option<Trait>> {
        Ok(self
            .get_identity(identity)
            .await?
            .traits
            .into_iter()
            .find(|t| t.key == key))
    }

    /// Store `value` on the server for `identity` and return the trait as stored.
    pub async fn set_trait(&self, value: Trait, identity: &str) -> Result<Trait> {
        let key = value.key.clone();
        let stored = self.set_traits(vec![value.clone()], identity).await?;
        Ok(stored.into_iter().find(|t| t.key == key).unwrap_or(value))
    }

    /// Store `traits` on the server for `identity` and return all traits of the identity.
    pub async fn set_traits(&self, traits: Vec<Trait>, identity: &str) -> Result<Vec<Trait>> {
        #[derive(Serialize)]
        struct IdentityUpdate<'a> {
            identifier: &'a str,
            traits: &'a [Trait],
        }

        let settings = self.settings();
        let request = settings
            .request(Method::POST, "identities/")?
            .json(&IdentityUpdate {
                identifier: identity,
                traits: &traits,
            })?;

        let identity: Identity = self
            .requests
            .fetch(request, &settings.cache_policy, CacheMode::Default)
            .await
            .into_result()?;
        Ok(identity.traits)
    }

    /// Start listening for flag changes.
    ///
    /// Whenever an event announces a change newer than the last one seen, environment flags are
    /// re-fetched (bypassing the cache), stored for [`Client::latest_flags`], and published to
    /// [`Client::subscribe_flags`] receivers. Every event and every undecodable frame is then passed
    /// to `handler`, in the order received. Connection failures are retried with backoff and only
    /// logged; the handler just stops hearing about changes until the stream is back.
    ///
    /// Configuration errors are reported to `handler` right away and nothing is started. Calling
    /// this again replaces the running session.
    pub fn start_live_updates(&self, handler: EventHandler) {
        self.stop_live_updates();

        let settings = self.settings();
        if settings.api_key.is_empty() {
            handler(Err(ConfigurationError::MissingApiKey.into()));
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            handler(Err(ConfigurationError::NoRuntime.into()));
            return;
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handler = Arc::new(Mutex::new(Some(handler)));

        runtime.spawn(
            LiveRefresher {
                requests: self.requests.clone(),
                settings: self.settings.clone(),
                snapshots: self.snapshots.clone(),
                handler: handler.clone(),
                last_updated_at: None,
            }
            .run(receiver, cancel.clone()),
        );

        let mut stream = EventStream::new();
        stream.start(
            StreamConfig {
                realtime_url: settings.realtime_url,
                api_key: settings.api_key,
                idle_timeout: settings.stream_idle_timeout,
                backoff: settings.backoff,
            },
            Arc::new(move |event: Result<FlagEvent>| {
                // The receiver is gone only after the session was stopped.
                let _ = sender.send(event);
            }),
        );

        *self
            .live
            .lock()
            .expect("thread holding live updates lock should not panic") = Some(LiveUpdates {
            stream,
            cancel,
            handler,
        });
    }

    /// Stop listening for flag changes. The handler is not called after this returns.
    pub fn stop_live_updates(&self) {
        let live = self
            .live
            .lock()
            .expect("thread holding live updates lock should not panic")
            .take();
        if let Some(mut live) = live {
            live.stream.stop();
            live.cancel.cancel();
            live.handler
                .lock()
                .expect("thread holding handler lock should not panic")
                .take();
        }
    }

    /// Connection state of the live update stream.
    pub fn live_update_state(&self) -> StreamState {
        self.live
            .lock()
            .expect("thread holding live updates lock should not panic")
            .as_ref()
            .map_or(StreamState::Idle, |live| live.stream.state())
    }

    /// The most recent environment flags fetched from the service, if any.
    pub fn latest_flags(&self) -> Option<Arc<FlagSnapshot>> {
        self.snapshots.get_snapshot()
    }

    /// Receive environment flags whenever they are refreshed.
    pub fn subscribe_flags(&self) -> watch::Receiver<Option<Arc<FlagSnapshot>>> {
        self.snapshots.subscribe()
    }

    /// Upload analytics counts now instead of waiting for the timer.
    pub async fn flush_analytics(&self) -> Result<()> {
        self.analytics.flush().await
    }

    /// Counts recorded since the last successful upload.
    pub fn analytics_counts(&self) -> AnalyticsLedger {
        self.analytics.counts()
    }

    /// Replace the API key.
    pub fn set_api_key(&self, api_key: impl Into<String>) {
        let api_key = api_key.into();
        self.update_settings(|settings| settings.api_key = api_key);
    }

    /// Replace the base URL for API calls.
    pub fn set_base_url(&self, base_url: impl Into<String>) {
        let base_url = base_url.into();
        self.update_settings(|settings| settings.base_url = base_url);
    }

    /// Replace the default flags.
    pub fn set_default_flags(&self, default_flags: FlagSnapshot) {
        let default_flags = Arc::new(default_flags);
        self.update_settings(|settings| settings.default_flags = default_flags);
    }

    /// Replace the cache policy. Entries already cached keep their expiry.
    pub fn set_cache_policy(&self, cache_policy: CachePolicy) {
        self.update_settings(|settings| settings.cache_policy = cache_policy);
    }

    /// Turn analytics on or off.
    pub fn set_analytics_enabled(&self, enabled: bool) {
        self.analytics.set_enabled(enabled);
    }

    /// Change the analytics flush period.
    pub fn set_analytics_flush_period(&self, period: Duration) {
        self.analytics.set_flush_period(period);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_live_updates();
    }
}

async fn fetch_flags(
    requests: &RequestLayer,
    settings: &Settings,
    identity: Option<&str>,
    mode: CacheMode,
) -> Outcome<FlagSnapshot> {
    match identity {
        None => match settings.request(Method::GET, "flags/") {
            Ok(request) => requests.fetch(request, &settings.cache_policy, mode).await,
            Err(err) => Outcome::Failure(err),
        },
        Some(identity) => match settings.identity_request(identity) {
            Ok(request) => requests
                .fetch::<Identity>(request, &settings.cache_policy, mode)
                .await
                .map(|identity| identity.flags),
            Err(err) => Outcome::Failure(err),
        },
    }
}

/// Consumes stream events on behalf of [`Client::start_live_updates`].
struct LiveRefresher {
    requests: RequestLayer,
    settings: Arc<RwLock<Settings>>,
    snapshots: Arc<SnapshotStore>,
    handler: Arc<Mutex<Option<EventHandler>>>,
    last_updated_at: Option<f64>,
}

impl LiveRefresher {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Result<FlagEvent>>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Ok(event) = &event {
                if self.is_newer(event) {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.refresh(event) => {}
                    }
                }
            }

            if let Some(handler) = self
                .handler
                .lock()
                .expect("thread holding handler lock should not panic")
                .as_ref()
            {
                handler(event);
            }
        }
    }

    fn is_newer(&self, event: &FlagEvent) -> bool {
        self.last_updated_at
            .map_or(true, |last| event.updated_at > last)
    }

    async fn refresh(&mut self, event: &FlagEvent) {
        let settings = self
            .settings
            .read()
            .expect("thread holding settings lock should not panic")
            .clone();

        let ticket = self.snapshots.ticket();
        match fetch_flags(&self.requests, &settings, None, CacheMode::Reload).await {
            Outcome::Fresh(snapshot) | Outcome::Cached(snapshot) => {
                log::debug!(target: "flagsync", updated_at = event.updated_at; "refreshed flags after change event");
                self.last_updated_at = Some(event.updated_at);
                self.snapshots.set_snapshot(ticket, Arc::new(snapshot));
            }
            Outcome::Failure(err) => {
                log::warn!(target: "flagsync", updated_at = event.updated_at; "failed to refresh flags after change event: {err}");
            }
        }
    }
}

/// Uploads analytics to `analytics/flags/` using the current client settings.
struct AnalyticsEndpoint {
    settings: Arc<RwLock<Settings>>,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl AnalyticsUploader for AnalyticsEndpoint {
    async fn upload(&self, ledger: &AnalyticsLedger) -> Result<()> {
        let request = self
            .settings
            .read()
            .expect("thread holding settings lock should not panic")
            .request(Method::POST, "analytics/flags/")?
            .json(ledger)?;
        self.transport.perform(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use reqwest::Method;
    use serde_json::json;

    use super::*;
    use crate::{
        error::TransportError, fallback::Provenance, transport::testing::ScriptedTransport, Error,
        FlagRecord,
    };

    fn flags_json() -> serde_json::Value {
        json!([
            {"feature": {"name": "beta"}, "enabled": true, "feature_state_value": "on"},
            {"feature": {"name": "legacy"}, "enabled": false, "feature_state_value": null}
        ])
    }

    fn client(transport: &ScriptedTransport) -> Client {
        ClientConfig::from_api_key("env-key")
            .base_url("https://api.test/api/v1")
            .transport(Arc::new(transport.clone()))
            .to_client()
    }

    fn defaults() -> FlagSnapshot {
        [
            FlagRecord::new("beta", false, "default"),
            FlagRecord::new("unset", true, TypedValue::Null),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn get_flags_requests_environment_flags() {
        let transport = ScriptedTransport::new().reply_json(flags_json());
        let client = client(&transport);

        let flags = client.get_flags(None).await.unwrap();

        assert!(flags.is_enabled("beta"));
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[0].url.as_str(), "https://api.test/api/v1/flags/");
        assert_eq!(requests[0].header_value(AUTH_HEADER), Some("env-key"));
    }

    #[tokio::test]
    async fn identity_flags_use_identifier_query() {
        let transport = ScriptedTransport::new().reply_json(json!({
            "flags": flags_json(),
            "traits": []
        }));
        let client = client(&transport);

        let value = client.get_value("beta", Some("user 1")).await.unwrap();

        assert_eq!(value, Some(TypedValue::String("on".to_owned())));
        let requests = transport.requests.lock().unwrap();
        assert_eq!(
            requests[0].url.as_str(),
            "https://api.test/api/v1/identities/?identifier=user+1"
        );
    }

    #[tokio::test]
    async fn absent_flag_is_not_enabled() {
        let transport = ScriptedTransport::new().reply_json(flags_json());
        let client = client(&transport);

        assert!(!client.is_enabled("missing", None).await.unwrap());
        assert_eq!(client.get_value("legacy", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failure_serves_non_null_defaults() {
        let transport = ScriptedTransport::new().fail(TransportError::Timeout);
        let client = client(&transport);
        client.set_default_flags(defaults());

        let resolution = client.get_flags_with_provenance(None).await.unwrap();

        assert_eq!(resolution.provenance, Provenance::Default);
        assert_eq!(
            *resolution.snapshot,
            [FlagRecord::new("beta", false, "default")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn failure_without_defaults_is_an_error() {
        let transport = ScriptedTransport::new().fail(TransportError::Unauthorized);
        let client = client(&transport);

        let result = client.get_flags(None).await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Unauthorized))
        ));
    }

    #[tokio::test]
    async fn missing_api_key_is_never_hidden_by_defaults() {
        let transport = ScriptedTransport::new().reply_json(flags_json());
        let client = ClientConfig::from_api_key("")
            .default_flags(defaults())
            .transport(Arc::new(transport.clone()))
            .to_client();

        let result = client.is_enabled("beta", None).await;

        assert!(matches!(
            result,
            Err(Error::Configuration(ConfigurationError::MissingApiKey))
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn invalid_base_url_is_a_configuration_error() {
        let transport = ScriptedTransport::new();
        let client = client(&transport);
        client.set_base_url("not a url");

        let result = client.get_flags(None).await;

        assert!(matches!(
            result,
            Err(Error::Configuration(ConfigurationError::InvalidBaseUrl(_)))
        ));
    }

    #[tokio::test]
    async fn setters_apply_to_next_operation() {
        let transport = ScriptedTransport::new().reply_json(flags_json());
        let client = client(&transport);

        client.get_flags(None).await.unwrap();
        client.set_api_key("other-key");
        client.get_flags(None).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].header_value(AUTH_HEADER), Some("env-key"));
        assert_eq!(requests[1].header_value(AUTH_HEADER), Some("other-key"));
    }

    #[tokio::test]
    async fn fresh_environment_flags_become_latest() {
        let transport = ScriptedTransport::new().reply_json(flags_json());
        let client = client(&transport);
        assert!(client.latest_flags().is_none());

        client.get_flags(None).await.unwrap();

        assert!(client.latest_flags().unwrap().is_enabled("beta"));
    }

    #[tokio::test]
    async fn set_traits_posts_identity_update() {
        let transport = ScriptedTransport::new().reply_json(json!({
            "flags": [],
            "traits": [{"trait_key": "plan", "trait_value": "pro"}]
        }));
        let client = client(&transport);

        let stored = client
            .set_trait(Trait::new("plan", "pro"), "user-1")
            .await
            .unwrap();

        assert_eq!(stored, Trait::new("plan", "pro"));
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].url.path(), "/api/v1/identities/");
        let body: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({"identifier": "user-1", "traits": [{"trait_key": "plan", "trait_value": "pro"}]})
        );
    }

    #[tokio::test]
    async fn get_traits_filters_by_key() {
        let transport = ScriptedTransport::new().reply_json(json!({
            "flags": [],
            "traits": [
                {"trait_key": "plan", "trait_value": "pro"},
                {"trait_key": "age", "trait_value": 42}
            ]
        }));
        let client = client(&transport);

        let traits = client.get_traits("user-1", Some(&["age"][..])).await.unwrap();
        let missing = client.get_trait("email", "user-1").await.unwrap();

        assert_eq!(traits, vec![Trait::new("age", 42i64)]);
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn queries_are_counted_and_uploaded() {
        let transport = ScriptedTransport::new().reply_json(flags_json());
        let client = ClientConfig::from_api_key("env-key")
            .base_url("https://api.test/api/v1/")
            .enable_analytics(true)
            .transport(Arc::new(transport.clone()))
            .to_client();

        client.is_enabled("beta", None).await.unwrap();
        client.get_value("beta", None).await.unwrap();
        client.flush_analytics().await.unwrap();

        let requests = transport.requests.lock().unwrap();
        let upload = requests.last().unwrap();
        assert_eq!(upload.url.path(), "/api/v1/analytics/flags/");
        let body: serde_json::Value =
            serde_json::from_slice(upload.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"beta": 2}));
        assert!(client.analytics_counts().is_empty());
    }

    #[tokio::test]
    async fn live_updates_without_api_key_report_immediately() {
        let client = client(&ScriptedTransport::new());
        client.set_api_key("");
        let received = Arc::new(Mutex::new(Vec::new()));

        client.start_live_updates({
            let received = received.clone();
            Arc::new(move |event: Result<FlagEvent>| received.lock().unwrap().push(event))
        });

        let received = received.lock().unwrap();
        assert!(matches!(
            received.as_slice(),
            [Err(Error::Configuration(ConfigurationError::MissingApiKey))]
        ));
        assert_eq!(client.live_update_state(), StreamState::Idle);
    }
}

//! Reconnecting server-sent-event stream announcing flag changes.
//!
//! The stream only tells us *that* flags changed (and when). Fetching the new flags is up to the
//! handler.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Deserialize;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    backoff::{BackoffCalculator, BackoffConfig},
    error::{ConfigurationError, TransportError},
    transport::AUTH_HEADER,
    Error, Result,
};

/// A change notification received from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FlagEvent {
    /// Seconds since epoch (fractional) of the last change in the environment.
    pub updated_at: f64,
}

impl FlagEvent {
    /// `updated_at` as a timestamp. `None` if it is out of range.
    pub fn updated_at_utc(&self) -> Option<DateTime<Utc>> {
        if !self.updated_at.is_finite() {
            return None;
        }
        let secs = self.updated_at.floor();
        let nanos = ((self.updated_at - secs) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

/// Callback receiving stream events and per-frame errors. Connection failures are logged, not
/// delivered.
///
/// The handler is called on the stream task, in wire order. It must not call
/// [`EventStream::stop`] (or [`Client::stop_live_updates`](crate::Client::stop_live_updates))
/// itself: `stop()` waits for an in-flight handler call to return.
pub type EventHandler = Arc<dyn Fn(Result<FlagEvent>) + Send + Sync>;

/// Connection state of an [`EventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped.
    Idle,
    /// Opening a connection.
    Connecting,
    /// Connected and receiving bytes.
    Streaming,
    /// Waiting before the next connection attempt.
    Reconnecting,
}

/// Settings of a single stream session.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base URL of the real-time service.
    pub realtime_url: String,
    #[allow(missing_docs)]
    pub api_key: String,
    /// If no bytes arrive for this long, the connection is dropped and reopened.
    pub idle_timeout: Duration,
    #[allow(missing_docs)]
    pub backoff: BackoffConfig,
}

impl StreamConfig {
    /// Full URL of the environment's event stream.
    pub fn stream_url(&self) -> std::result::Result<Url, ConfigurationError> {
        let base = if self.realtime_url.ends_with('/') {
            Url::parse(&self.realtime_url)
        } else {
            Url::parse(&format!("{}/", self.realtime_url))
        };
        base.and_then(|base| base.join(&format!("sse/environments/{}/stream", self.api_key)))
            .map_err(ConfigurationError::InvalidBaseUrl)
    }
}

/// A long-lived, self-reconnecting connection to the event stream.
///
/// Call [`EventStream::start`] to connect. The stream retries forever until [`EventStream::stop`]
/// is called or the value is dropped.
pub struct EventStream {
    client: reqwest::Client,
    session: Option<Session>,
}

struct Session {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared between a session and its task.
struct Shared {
    state: Mutex<StreamState>,
    handler: Mutex<Option<EventHandler>>,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
    }

    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    /// Call the handler unless the session has been stopped.
    fn deliver(&self, event: Result<FlagEvent>) {
        if let Some(handler) = lock(&self.handler).as_ref() {
            handler(event);
        }
    }
}

// A panicking handler poisons the lock. That must not turn `stop()` (called from `Drop`) into a
// panic, so poisoning is ignored here.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventStream {
    #[allow(missing_docs)]
    pub fn new() -> EventStream {
        EventStream::with_client(reqwest::Client::new())
    }

    /// Create a stream reusing an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client) -> EventStream {
        EventStream {
            client,
            session: None,
        }
    }

    /// Connect and start delivering events to `handler`, replacing any running session.
    ///
    /// Configuration problems (empty API key, invalid URL, no tokio runtime) are reported to
    /// `handler` immediately and no connection is made.
    pub fn start(&mut self, config: StreamConfig, handler: EventHandler) {
        self.stop();

        if config.api_key.is_empty() {
            handler(Err(ConfigurationError::MissingApiKey.into()));
            return;
        }
        let url = match config.stream_url() {
            Ok(url) => url,
            Err(err) => {
                handler(Err(err.into()));
                return;
            }
        };
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                handler(Err(ConfigurationError::NoRuntime.into()));
                return;
            }
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState::Connecting),
            handler: Mutex::new(Some(handler)),
        });
        let cancel = CancellationToken::new();

        let task = runtime.spawn(run(
            Connection {
                client: self.client.clone(),
                url,
                api_key: config.api_key,
                idle_timeout: config.idle_timeout,
                shared: shared.clone(),
            },
            BackoffCalculator::new(config.backoff),
            cancel.clone(),
        ));

        log::debug!(target: "flagsync", "event stream started");
        self.session = Some(Session {
            shared,
            cancel,
            task,
        });
    }

    /// Stop the stream. No handler call happens after this returns.
    ///
    /// If the handler is running on the stream task, this waits for it to return.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.cancel.cancel();
        // Taking the handler waits for an in-flight delivery and prevents new ones.
        lock(&session.shared.handler).take();
        session.shared.set_state(StreamState::Idle);
        session.task.abort();
        log::debug!(target: "flagsync", "event stream stopped");
    }

    /// Current connection state.
    pub fn state(&self) -> StreamState {
        self.session
            .as_ref()
            .map_or(StreamState::Idle, |session| session.shared.state())
    }
}

impl Default for EventStream {
    fn default() -> Self {
        EventStream::new()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a connection ended.
#[derive(Debug)]
pub(crate) enum Disconnect {
    /// The server closed the stream.
    Closed,
    /// Nothing arrived within the idle timeout, or the request timed out.
    TimedOut,
    Failed(Error),
}

impl Disconnect {
    fn from_transport(err: TransportError) -> Disconnect {
        match err {
            TransportError::Timeout => Disconnect::TimedOut,
            err => Disconnect::Failed(err.into()),
        }
    }
}

/// Delay before reconnecting after `disconnect`.
///
/// A routine drop (clean close or timeout) right after receiving data reconnects immediately; the
/// attempt is still counted, so repeated drops without data back off.
pub(crate) fn reconnect_delay(backoff: &mut BackoffCalculator, disconnect: &Disconnect) -> Duration {
    let routine = matches!(disconnect, Disconnect::Closed | Disconnect::TimedOut);
    if routine && backoff.attempt_count() == 0 {
        backoff.record_attempt();
        Duration::ZERO
    } else {
        backoff.next_delay()
    }
}

struct Connection {
    client: reqwest::Client,
    url: Url,
    api_key: String,
    idle_timeout: Duration,
    shared: Arc<Shared>,
}

async fn run(connection: Connection, mut backoff: BackoffCalculator, cancel: CancellationToken) {
    loop {
        connection.shared.set_state(StreamState::Connecting);

        let disconnect = tokio::select! {
            _ = cancel.cancelled() => return,
            disconnect = connection.connect_once(&mut backoff) => disconnect,
        };

        let delay = reconnect_delay(&mut backoff, &disconnect);
        match disconnect {
            Disconnect::Closed => {
                log::debug!(target: "flagsync", delay:? = delay; "event stream closed by server, reconnecting");
            }
            Disconnect::TimedOut => {
                log::debug!(target: "flagsync", delay:? = delay; "event stream timed out, reconnecting");
            }
            Disconnect::Failed(err) => {
                log::warn!(target: "flagsync", delay:? = delay, attempt = backoff.attempt_count(); "event stream failed: {err}");
            }
        }

        connection.shared.set_state(StreamState::Reconnecting);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

impl Connection {
    async fn connect_once(&self, backoff: &mut BackoffCalculator) -> Disconnect {
        let request = self
            .client
            .get(self.url.clone())
            .header(AUTH_HEADER, &self.api_key)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();

        let response = match tokio::time::timeout(self.idle_timeout, request).await {
            Err(_) => return Disconnect::TimedOut,
            Ok(Err(err)) => return Disconnect::from_transport(err.into()),
            Ok(Ok(response)) => response,
        };
        if !response.status().is_success() {
            return Disconnect::Failed(TransportError::from_status(response.status().as_u16()).into());
        }

        let mut body = std::pin::pin!(response.bytes_stream());
        let mut parser = FrameParser::default();
        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Err(_) => return Disconnect::TimedOut,
                Ok(None) => return Disconnect::Closed,
                Ok(Some(Err(err))) => return Disconnect::from_transport(err.into()),
                Ok(Some(Ok(chunk))) => chunk,
            };
            self.shared.set_state(StreamState::Streaming);

            for frame in parser.push(&chunk) {
                let event = frame.and_then(|payload| {
                    serde_json::from_str::<FlagEvent>(&payload).map_err(|err| {
                        log::warn!(target: "flagsync", payload = payload.as_str(); "failed to decode event frame: {err}");
                        Error::from(err)
                    })
                });
                if let Ok(event) = &event {
                    log::trace!(target: "flagsync", updated_at = event.updated_at; "received flag event");
                    backoff.reset();
                }
                self.shared.deliver(event);
            }
        }
    }
}

/// Longest line the stream accepts. Longer lines are dropped and reported as decode errors.
pub(crate) const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits the byte stream into lines and extracts `data:` payloads.
///
/// Chunks may end mid-line; the partial line stays buffered until its newline arrives.
#[derive(Debug, Default)]
pub(crate) struct FrameParser {
    buffer: Vec<u8>,
    // Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl FrameParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > MAX_LINE_LENGTH {
                frames.push(Err(oversized_line(line.len())));
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');

            match line.strip_prefix("data:").map(str::trim) {
                Some("") => {}
                Some(data) => frames.push(Ok(data.to_owned())),
                None => {
                    log::trace!(target: "flagsync", line = line; "skipping non-data line");
                }
            }
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            if !self.discarding {
                self.discarding = true;
                frames.push(Err(oversized_line(self.buffer.len())));
            }
            self.buffer.clear();
        }
        frames
    }
}

fn oversized_line(length: usize) -> Error {
    log::warn!(target: "flagsync", length = length; "dropping oversized event stream line");
    <serde_json::Error as serde::de::Error>::custom(format!(
        "event stream line longer than {MAX_LINE_LENGTH} bytes"
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn payloads(frames: Vec<Result<String>>) -> Vec<String> {
        frames.into_iter().map(|frame| frame.unwrap()).collect()
    }

    type Received = Arc<Mutex<Vec<Result<FlagEvent>>>>;

    fn recording_shared() -> (Received, Arc<Shared>) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let handler: EventHandler = {
            let received = received.clone();
            Arc::new(move |event: Result<FlagEvent>| received.lock().unwrap().push(event))
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState::Connecting),
            handler: Mutex::new(Some(handler)),
        });
        (received, shared)
    }

    async fn serve_stream(body: &'static str) -> (MockServer, Url) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse/environments/env-key/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        let url = StreamConfig {
            realtime_url: server.uri(),
            api_key: "env-key".to_owned(),
            idle_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
        .stream_url()
        .unwrap();
        (server, url)
    }

    fn connection(url: Url, shared: Arc<Shared>) -> Connection {
        Connection {
            client: reqwest::Client::new(),
            url,
            api_key: "env-key".to_owned(),
            idle_timeout: Duration::from_secs(5),
            shared,
        }
    }

    fn backoff_after_attempts(attempts: usize) -> BackoffCalculator {
        let mut backoff = BackoffCalculator::new(BackoffConfig::default());
        for _ in 0..attempts {
            backoff.record_attempt();
        }
        backoff
    }

    #[tokio::test]
    async fn heartbeat_only_connection_keeps_attempt_count() {
        let (_server, url) = serve_stream("ping: 1689172000\n\n: keep-alive\n\nping: 1689172010\n\n").await;
        let (received, shared) = recording_shared();
        let mut backoff = backoff_after_attempts(2);

        let disconnect = connection(url, shared).connect_once(&mut backoff).await;

        assert!(matches!(disconnect, Disconnect::Closed));
        assert_eq!(backoff.attempt_count(), 2);
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn decoded_frame_resets_attempt_count() {
        let (_server, url) = serve_stream("data: {\"updated_at\": 1.0}\n\n").await;
        let (received, shared) = recording_shared();
        let mut backoff = backoff_after_attempts(3);

        connection(url, shared).connect_once(&mut backoff).await;

        assert_eq!(backoff.attempt_count(), 0);
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_and_attempt_count() {
        let (server, url) = serve_stream("data: bad\n\ndata: {\"updated_at\": 1.0}\n\n").await;
        let (received, shared) = recording_shared();
        let mut backoff = backoff_after_attempts(2);
        let (bad_only_server, bad_only_url) = serve_stream("data: bad\n\n").await;
        let (_, bad_only_shared) = recording_shared();
        let mut bad_only_backoff = backoff_after_attempts(2);

        let disconnect = connection(url, shared).connect_once(&mut backoff).await;
        connection(bad_only_url, bad_only_shared)
            .connect_once(&mut bad_only_backoff)
            .await;

        assert!(matches!(disconnect, Disconnect::Closed));
        {
            let received = received.lock().unwrap();
            assert_eq!(received.len(), 2);
            assert!(matches!(received[0], Err(Error::Decode(_))));
            assert_eq!(received[1].as_ref().unwrap().updated_at, 1.0);
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(backoff.attempt_count(), 0);

        assert_eq!(bad_only_server.received_requests().await.unwrap().len(), 1);
        assert_eq!(bad_only_backoff.attempt_count(), 2);
    }

    #[tokio::test]
    async fn error_status_fails_without_handler_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let (received, shared) = recording_shared();
        let url = Url::parse(&format!("{}/sse/environments/env-key/stream", server.uri())).unwrap();

        let disconnect = connection(url, shared)
            .connect_once(&mut BackoffCalculator::new(BackoffConfig::default()))
            .await;

        assert!(matches!(
            disconnect,
            Disconnect::Failed(Error::Transport(TransportError::Status { status: 502 }))
        ));
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn parses_data_frame() {
        let mut parser = FrameParser::default();

        let payloads = payloads(parser.push(b"data: {\"updated_at\": 1689172003.899101}\n\n"));

        assert_eq!(payloads, vec!["{\"updated_at\": 1689172003.899101}"]);
        let event: FlagEvent = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(event.updated_at, 1689172003.899101);
    }

    #[test]
    fn skips_non_data_lines() {
        let mut parser = FrameParser::default();

        assert!(parser.push(b"ping: 1689172003\n").is_empty());
        assert!(parser.push(b"event: environment_updated\r\n").is_empty());
        assert!(parser.push(b": comment\n\n").is_empty());
        assert!(parser.push(b"data:\n").is_empty());
    }

    #[test]
    fn keeps_partial_lines_between_chunks() {
        let mut parser = FrameParser::default();

        assert!(parser.push(b"data: {\"updated_").is_empty());
        assert_eq!(
            payloads(parser.push(b"at\": 1}\r\ndata: {\"updated_at\": 2}\n")),
            vec!["{\"updated_at\": 1}", "{\"updated_at\": 2}"]
        );
    }

    #[test]
    fn oversized_line_is_dropped_once_and_parsing_resumes() {
        let mut parser = FrameParser::default();
        let filler = vec![b'x'; MAX_LINE_LENGTH / 2 + 1];

        assert!(parser.push(b"data: ").is_empty());
        assert!(parser.push(&filler).is_empty());
        let frames = parser.push(&filler);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(Error::Decode(_))));
        assert!(parser.push(&filler).is_empty());

        let frames = parser.push(b"tail\ndata: {\"updated_at\": 3}\n");
        assert_eq!(payloads(frames), vec!["{\"updated_at\": 3}"]);
    }

    #[test]
    fn oversized_complete_line_is_reported() {
        let mut parser = FrameParser::default();
        let mut line = b"data: ".to_vec();
        line.extend(vec![b'x'; MAX_LINE_LENGTH]);
        line.extend_from_slice(b"\ndata: {\"updated_at\": 4}\n");

        let frames = parser.push(&line);

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(Error::Decode(_))));
        assert_eq!(frames[1].as_ref().unwrap(), "{\"updated_at\": 4}");
    }

    #[test]
    fn event_time_conversion() {
        let event = FlagEvent {
            updated_at: 1689172003.5,
        };

        let time = event.updated_at_utc().unwrap();

        assert_eq!(time.timestamp(), 1689172003);
        assert_eq!(time.timestamp_subsec_millis(), 500);
        assert_eq!(FlagEvent { updated_at: f64::NAN }.updated_at_utc(), None);
    }

    #[test]
    fn routine_drop_reconnects_immediately_once() {
        let mut backoff = BackoffCalculator::new(BackoffConfig::default());

        assert_eq!(reconnect_delay(&mut backoff, &Disconnect::Closed), Duration::ZERO);
        assert_eq!(backoff.attempt_count(), 1);
        assert_eq!(
            reconnect_delay(&mut backoff, &Disconnect::TimedOut),
            Duration::from_secs(2)
        );
        assert_eq!(
            reconnect_delay(&mut backoff, &Disconnect::Closed),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn failures_back_off_from_the_start() {
        let mut backoff = BackoffCalculator::new(BackoffConfig::default());
        let failed = || Disconnect::Failed(TransportError::Status { status: 502 }.into());

        assert_eq!(reconnect_delay(&mut backoff, &failed()), Duration::from_secs(1));
        assert_eq!(reconnect_delay(&mut backoff, &failed()), Duration::from_secs(2));

        backoff.reset();
        assert_eq!(reconnect_delay(&mut backoff, &Disconnect::Closed), Duration::ZERO);
    }

    #[test]
    fn stream_url_includes_api_key() {
        let config = StreamConfig {
            realtime_url: "https://realtime.example.com".to_owned(),
            api_key: "env-key".to_owned(),
            idle_timeout: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        };

        assert_eq!(
            config.stream_url().unwrap().as_str(),
            "https://realtime.example.com/sse/environments/env-key/stream"
        );
    }

    #[test]
    fn empty_api_key_is_reported_without_connecting() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler: EventHandler = {
            let received = received.clone();
            Arc::new(move |event: Result<FlagEvent>| received.lock().unwrap().push(event))
        };
        let mut stream = EventStream::new();

        stream.start(
            StreamConfig {
                realtime_url: "https://realtime.example.com/".to_owned(),
                api_key: String::new(),
                idle_timeout: Duration::from_secs(60),
                backoff: BackoffConfig::default(),
            },
            handler,
        );

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            received[0],
            Err(Error::Configuration(ConfigurationError::MissingApiKey))
        ));
        assert_eq!(stream.state(), StreamState::Idle);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut stream = EventStream::new();
        stream.stop();
        assert_eq!(stream.state(), StreamState::Idle);
    }
}

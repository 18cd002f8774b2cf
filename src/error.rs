use std::sync::Arc;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while resolving flags.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The client is misconfigured. These errors are never retried and never hidden behind default
    /// flags.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The request did not produce a successful response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server (or an event frame) sent a payload we could not decode.
    #[error("failed to decode payload")]
    Decode(#[source] Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Whether default flags may be served instead of this error.
    ///
    /// Transport and decode errors describe an unreliable network or server, so the caller still
    /// gets an answer if defaults are configured. Configuration errors always surface.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Decode(_))
    }

    /// Whether the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Timeout))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.into())
    }
}

/// Errors in client configuration.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConfigurationError {
    /// API key is missing or empty.
    #[error("api_key is missing")]
    MissingApiKey,
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),
    /// Background work (live updates) was requested outside of a tokio runtime.
    #[error("live updates require a tokio runtime")]
    NoRuntime,
}

/// Errors produced by a [`Transport`](crate::Transport).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// The request or the stream read timed out.
    #[error("request timed out")]
    Timeout,
    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,
    /// Server responded with a non-2xx status.
    #[error("server responded with status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },
    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return TransportError::Timeout;
        }
        if let Some(status) = value.status() {
            return TransportError::from_status(status.as_u16());
        }
        TransportError::Network(Arc::new(value.without_url()))
    }
}

impl TransportError {
    pub(crate) fn from_status(status: u16) -> TransportError {
        if status == 401 {
            TransportError::Unauthorized
        } else {
            TransportError::Status { status }
        }
    }
}

/// Errors reading or writing the response cache. These never reach the caller: a broken entry is
/// treated as a cache miss.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CacheError {
    /// The cache store is unavailable (e.g., poisoned lock, storage failure).
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    /// The entry exists but its contents cannot be used.
    #[error("corrupted cache entry")]
    Corrupted(#[source] Arc<serde_json::Error>),
}

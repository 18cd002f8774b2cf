//! A resilient client for a remote feature flag and remote configuration service.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that answers flag queries ("get all flags", "is flag X
//! enabled", "what is the value of Y") for the environment or for a single identity. Answers come
//! from the service when it is reachable, from a response cache (see [`CachePolicy`]) when it is
//! not, and from caller-supplied default flags as the last resort. [`Resolution`] tells which of
//! the three was used.
//!
//! [`Client::start_live_updates`] keeps a standing connection to the real-time event stream and
//! refreshes flags whenever the service announces a change. The connection reconnects on its own
//! with exponential backoff (see [`BackoffCalculator`]).
//!
//! Optionally, the client counts flag queries and uploads the counts periodically. Counts are kept
//! until an upload succeeds and, with a [`FileLedgerStore`], survive restarts.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! A flag query fails only when the network, the cache and the default flags are all unavailable,
//! or when the client is misconfigured ([`ConfigurationError`]). Configuration errors are never
//! hidden behind default flags.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with the `flagsync` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into client operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod analytics;
mod backoff;
mod cache;
mod client;
mod config;
mod error;
mod event_stream;
mod fallback;
mod flags;
mod request;
mod snapshot_store;
mod transport;

pub use analytics::{
    AnalyticsBatcher, AnalyticsLedger, AnalyticsUploader, FileLedgerStore, LedgerStore,
    MemoryLedgerStore,
};
pub use backoff::{BackoffCalculator, BackoffConfig};
pub use cache::{override_cache_headers, CacheKey, CacheStore, CachedResponse, MemoryCacheStore};
pub use client::Client;
pub use config::{CachePolicy, ClientConfig};
pub use error::{CacheError, ConfigurationError, Error, Result, TransportError};
pub use event_stream::{EventHandler, EventStream, FlagEvent, StreamConfig, StreamState};
pub use fallback::{resolve, Provenance, Resolution};
pub use flags::{FlagQuery, FlagRecord, FlagSnapshot, Identity, Trait, TypedValue};
pub use request::{CacheMode, Outcome, RequestLayer};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, AUTH_HEADER};

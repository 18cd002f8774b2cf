//! The HTTP transport the request layer sends requests through.
//!
//! [`Transport`] is the seam between flag resolution and the network. [`HttpTransport`] is the
//! production implementation on top of `reqwest`; tests plug in fakes.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Method};
use serde::Serialize;
use url::Url;

use crate::{error::TransportError, Result};

/// Header carrying the API key on every request.
pub const AUTH_HEADER: &str = "X-Environment-Key";

/// A request to the flag service.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    #[allow(missing_docs)]
    pub method: Method,
    /// Full URL including query parameters.
    pub url: Url,
    #[allow(missing_docs)]
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    /// Create a request without headers and body.
    pub fn new(method: Method, url: Url) -> ApiRequest {
        ApiRequest {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> ApiRequest {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a JSON-encoded body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<ApiRequest> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Returns the value of the header `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    #[allow(missing_docs)]
    pub status: u16,
    #[allow(missing_docs)]
    pub headers: Vec<(String, String)>,
    #[allow(missing_docs)]
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Returns the value of the header `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Performs a single HTTP request.
///
/// Implementations must map any non-2xx status to an error, so callers only ever see successful
/// responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform `request` and return the response body with headers.
    async fn perform(&self, request: ApiRequest) -> std::result::Result<ApiResponse, TransportError>;
}

/// [`Transport`] on top of `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with a per-request `timeout`.
    pub fn new(timeout: Duration) -> HttpTransport {
        HttpTransport::with_client(reqwest::Client::new(), timeout)
    }

    /// Create a transport reusing an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> HttpTransport {
        HttpTransport { client, timeout }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn perform(&self, request: ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        log::debug!(target: "flagsync", method = request.method.as_str(), path = request.url.path(); "sending request");

        let mut builder = self
            .client
            .request(request.method, request.url)
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagsync", status = status.as_u16(); "received non-2xx response");
            return Err(TransportError::from_status(status.as_u16()));
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(ApiResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request = ApiRequest::new(Method::GET, Url::parse("https://example.com/").unwrap())
            .header(AUTH_HEADER, "key");

        assert_eq!(request.header_value("x-environment-key"), Some("key"));
        assert_eq!(request.header_value("authorization"), None);
    }

    #[test]
    fn json_body_is_encoded() {
        let request = ApiRequest::new(Method::POST, Url::parse("https://example.com/").unwrap())
            .json(&serde_json::json!({"a": 1}))
            .unwrap();

        assert_eq!(request.body.as_deref(), Some(&b"{\"a\":1}"[..]));
    }
}

//! Origin fetch boundary.
//!
//! The registry client that actually talks to the package feed implements
//! [`Origin`]. The cache only needs raw status + body + ETag back; request
//! construction, pagination and JSON shaping stay on the client side.
//!
//! [`HttpOrigin`] is a plain reqwest implementation that is enough for
//! feeds needing nothing beyond a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};

use crate::types::Body;
use crate::{CacheError, Result};

/// Credential value meaning "the environment authenticates transparently".
///
/// It still scopes cache keys like any other credential, but is never sent
/// as a bearer token.
pub const AMBIENT_CREDENTIAL: &str = "ambient";

/// One origin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub credential: Option<String>,
    /// Prior ETag, sent as `If-None-Match` when present.
    pub etag: Option<String>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            credential: None,
            etag: None,
            timeout,
        }
    }

    pub fn credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    pub fn etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Token to send as `Authorization: Bearer`, if any.
    ///
    /// `None` for anonymous requests and for [`AMBIENT_CREDENTIAL`].
    pub fn bearer_token(&self) -> Option<&str> {
        match self.credential.as_deref() {
            Some(AMBIENT_CREDENTIAL) | None => None,
            Some(token) => Some(token),
        }
    }
}

/// Raw origin answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub body: String,
    pub status_code: u16,
    pub etag: Option<String>,
}

impl FetchResponse {
    pub fn new(body: impl Into<String>, status_code: u16) -> Self {
        Self {
            body: body.into(),
            status_code,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// HTTP 304.
    pub fn not_modified() -> Self {
        Self::new("", 304)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status_code == 304
    }

    /// HTTP 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// HTTP 5xx: never cached, surfaced as an error.
    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }

    pub fn into_body(self) -> Body {
        Body::new(self.body, self.status_code)
    }
}

/// Supplier of fresh data for a URL.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch `request.url`.
    ///
    /// Non-success statuses are returned as responses, not errors; only
    /// transport failures (connect, timeout, body read) are `Err`.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// [`Origin`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
}

impl HttpOrigin {
    /// Create an origin with a default client.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("regcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (connection pool, proxies, TLS settings).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        if let Some(etag) = &request.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(token) = request.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CacheError::Timeout(request.timeout)
            } else {
                CacheError::Http(format!("failed to fetch {}: {e}", request.url))
            }
        })?;

        let status_code = response.status().as_u16();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| {
            CacheError::Http(format!("failed to read response body from {}: {e}", request.url))
        })?;

        Ok(FetchResponse {
            body,
            status_code,
            etag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambient_credential_is_not_a_bearer_token() {
        let request = FetchRequest::new("http://a", Duration::from_secs(1))
            .credential(Some(AMBIENT_CREDENTIAL.into()));
        assert_eq!(request.bearer_token(), None);
    }

    #[test]
    fn explicit_credential_is_a_bearer_token() {
        let request =
            FetchRequest::new("http://a", Duration::from_secs(1)).credential(Some("pat".into()));
        assert_eq!(request.bearer_token(), Some("pat"));
    }

    #[test]
    fn anonymous_request_has_no_token() {
        let request = FetchRequest::new("http://a", Duration::from_secs(1));
        assert_eq!(request.bearer_token(), None);
    }

    #[test]
    fn status_classification() {
        assert!(FetchResponse::not_modified().is_not_modified());
        assert!(FetchResponse::new("", 503).is_server_error());
        assert!(!FetchResponse::new("", 404).is_server_error());
        assert!(FetchResponse::new("", 204).is_success());
        assert!(!FetchResponse::new("", 429).is_success());
        assert!(!FetchResponse::not_modified().is_success());
        assert_eq!(
            FetchResponse::new("x", 200).with_etag("\"1\"").into_body(),
            Body::ok("x")
        );
    }
}

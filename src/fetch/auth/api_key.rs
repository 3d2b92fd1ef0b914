use crate::error::ConfigError;
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that sends the feed API key as a request header.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: HeaderValue,
}

impl<C> ApiKey<C> {
    /// Checks the header name and value once, up front, so a bad setting
    /// fails at start-up instead of on every tick.
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self, ConfigError> {
        let header_name =
            HeaderName::from_bytes(header_name.as_bytes()).map_err(|e| ConfigError::Invalid {
                name: "feed-api-key-header",
                reason: e.to_string(),
            })?;
        let mut key = HeaderValue::from_str(key).map_err(|e| ConfigError::Invalid {
            name: "feed-api-key",
            reason: e.to_string(),
        })?;
        key.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            key,
        })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.key.clone());
        self.inner.execute(req).await
    }
}

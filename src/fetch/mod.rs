mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{ConfigError, FetchError};
use auth::{ApiKey, UrlParam};

/// How the feed endpoint expects its API key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedAuth {
    #[default]
    None,
    /// Appended as `?<name>=<key>`.
    UrlParam { name: String, key: String },
    /// Sent as the `<name>: <key>` request header.
    Header { name: String, key: String },
}

/// Builds the client stack for a feed: a timeout-bound [`BasicClient`]
/// wrapped in whatever authentication the feed needs.
pub fn build_client(auth: FeedAuth, timeout: Duration) -> Result<Box<dyn HttpClient>, ConfigError> {
    let basic = BasicClient::with_timeout(timeout).map_err(|e| ConfigError::Invalid {
        name: "fetch-timeout-seconds",
        reason: e.to_string(),
    })?;

    Ok(match auth {
        FeedAuth::None => Box::new(basic),
        FeedAuth::UrlParam { name, key } => Box::new(UrlParam {
            inner: basic,
            param_name: name,
            key,
        }),
        FeedAuth::Header { name, key } => Box::new(ApiKey::new(basic, &name, &key)?),
    })
}

/// GETs `url` and returns the body, treating any non-success status as an
/// error.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes, FetchError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client.execute(req).await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }
    let body = resp.bytes().await?;
    debug!(url, bytes = body.len(), "Fetched feed");
    Ok(body)
}

/// Reads a feed from a local file or, for `http(s)://` sources, over HTTP.
pub async fn load_feed<C: HttpClient + ?Sized>(client: &C, source: &str) -> Result<Bytes, FetchError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes(client, source).await
    } else {
        Ok(Bytes::from(tokio::fs::read(Path::new(source)).await?))
    }
}

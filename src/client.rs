//! This module provides a client to download feeds over HTTP

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::traits::{BoxError, FeedFetcher, FetchedFeed};

/// Downloads feeds with plain `GET` requests.
///
/// `webcal://` and `webcals://` URLs are fetched over `http://` and `https://`.
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl HttpFeedFetcher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new(), timeout: None }
    }

    /// Give up a request after `timeout`.
    /// Registries already bound every fetch with [`Config::fetch_timeout_secs`](crate::config::Config), this is useful when the fetcher is used by itself
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), timeout: Some(timeout) }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// The URL that should actually be requested for a subscription URL
pub fn http_url(url: &Url) -> Result<Url, BoxError> {
    let scheme = match url.scheme() {
        "webcal" => "http",
        "webcals" => "https",
        "http" | "https" => return Ok(url.clone()),
        other => return Err(format!("Unsupported URL scheme {:?} in {}", other, url).into()),
    };

    // `Url::set_scheme` refuses to turn a non-special scheme into a special one
    let rewritten = format!("{}{}", scheme, &url.as_str()[url.scheme().len()..]);
    Ok(Url::parse(&rewritten)?)
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedFeed, BoxError> {
        let url = http_url(url)?;

        let mut request = self.client
            .get(url.as_str())
            .header(USER_AGENT, crate::config::user_agent())
            .header(ACCEPT, "text/calendar, */*;q=0.8");
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let res = request.send().await?;
        let status = res.status().as_u16();
        let bytes = res.bytes().await?;
        log::trace!("{} replied {} ({} bytes)", url, status, bytes.len());

        Ok(FetchedFeed { status, bytes: bytes.to_vec() })
    }
}

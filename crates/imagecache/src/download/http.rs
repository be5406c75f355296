//! Support to download images from HTTP servers.

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, header};
use url::Url;

use crate::caching::{CacheEntry, CacheError};
use crate::config::Config;
use crate::utils::futures::{m, measure};
use crate::utils::http::{self, DownloadTimeouts};

use super::{FetchResponse, Fetcher, USER_AGENT};

/// Fetcher implementation using a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Creates a fetcher with a client configured from the given [`Config`].
    pub fn from_config(config: &Config) -> CacheEntry<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = http::create_client(&timeouts)?;
        Ok(Self::new(client, timeouts))
    }

    async fn fetch_inner(&self, url: &Url) -> CacheEntry<FetchResponse> {
        tracing::debug!("Fetching image from `{}`", url);

        let response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        tracing::trace!(%status, size = body.len(), "Fetched `{}`", url);

        Ok(FetchResponse { status, body })
    }

    fn map_error(&self, error: reqwest::Error) -> CacheError {
        if error.is_timeout() {
            self.timeout_error(error.is_connect())
        } else {
            error.into()
        }
    }

    /// The timeout that expired, depending on whether the connection was established.
    fn timeout_error(&self, during_connect: bool) -> CacheError {
        if during_connect {
            CacheError::Timeout(self.timeouts.connect)
        } else {
            CacheError::Timeout(self.timeouts.max_download)
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheEntry<FetchResponse>> {
        let timeout = self.timeouts.max_download;
        let job = tokio::time::timeout(timeout, self.fetch_inner(url));
        let job = measure("service.download", m::timed_result, job);

        async move {
            match job.await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(timeout)),
            }
        }
        .boxed()
    }
}

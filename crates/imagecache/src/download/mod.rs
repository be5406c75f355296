//! Fetching image bytes from the network.
//!
//! The [`ImageCache`](crate::service::ImageCache) only talks to the network through the
//! [`Fetcher`] trait, so that tests can substitute a fake implementation. [`HttpFetcher`] is the
//! production implementation on top of `reqwest`.

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use url::Url;

use crate::caching::CacheEntry;

mod http;

pub use http::HttpFetcher;

/// HTTP User-Agent string to use.
const USER_AGENT: &str = concat!("imagecache/", env!("CARGO_PKG_VERSION"));

/// The response to a single `GET` request.
///
/// The status is not interpreted by the fetcher, non-success responses are returned just like
/// successful ones.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Performs a `GET` request for an image.
///
/// Errors are reserved for transport problems, which are reported as
/// [`CacheError::DownloadError`](crate::caching::CacheError::DownloadError) or
/// [`CacheError::Timeout`](crate::caching::CacheError::Timeout).
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheEntry<FetchResponse>>;
}

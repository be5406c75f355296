use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use imagecache::caching::{CacheEntry, CacheError};
use imagecache::config::Config;
use imagecache::download::{FetchResponse, Fetcher};
use imagecache::service::ImageCache;
use imagecache::types::ResourceKey;
use imagecache_test as test;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use url::Url;

pub use test::{ImageServer, TempDir, png_bytes};

/// How a [`MockFetcher`] responds to every request.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// A `200 OK` with the given body.
    Ok(Bytes),
    /// The given status code with an empty body.
    Status(StatusCode),
    /// A transport failure.
    Unreachable,
    /// Panics inside the fetch.
    Panic,
}

/// A [`Fetcher`] that counts its calls and never touches the network.
///
/// A gated fetcher holds every request until [`release`](Self::release) is called.
#[derive(Debug, Clone)]
pub struct MockFetcher {
    inner: Arc<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    response: MockResponse,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl MockFetcher {
    pub fn new(response: MockResponse) -> Self {
        Self::build(response, None)
    }

    pub fn gated(response: MockResponse) -> Self {
        Self::build(response, Some(Semaphore::new(0)))
    }

    /// Serves a small PNG.
    pub fn image() -> Self {
        Self::new(MockResponse::Ok(png_bytes(4, 4).into()))
    }

    /// Fails every request, for tests where the network must not be used.
    pub fn unreachable() -> Self {
        Self::new(MockResponse::Unreachable)
    }

    fn build(response: MockResponse, gate: Option<Semaphore>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                response,
                calls: AtomicUsize::new(0),
                gate,
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Lets all pending and future requests of a gated fetcher through.
    pub fn release(&self) {
        if let Some(gate) = &self.inner.gate {
            gate.close();
        }
    }

    /// Waits until the fetcher has been called `n` times.
    pub async fn wait_for_calls(&self, n: usize) {
        wait_until(|| self.calls() >= n).await;
    }
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, CacheEntry<FetchResponse>> {
        async move {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.inner.gate {
                // a closed semaphore fails all acquires, which is our signal to continue
                let _ = gate.acquire().await;
            }

            match &self.inner.response {
                MockResponse::Ok(body) => Ok(FetchResponse {
                    status: StatusCode::OK,
                    body: body.clone(),
                }),
                MockResponse::Status(status) => Ok(FetchResponse {
                    status: *status,
                    body: Bytes::new(),
                }),
                MockResponse::Unreachable => {
                    Err(CacheError::DownloadError("connection refused".into()))
                }
                MockResponse::Panic => panic!("fetcher exploded"),
            }
        }
        .boxed()
    }
}

/// Setup tests and create an [`ImageCache`] backed by the given fetcher.
///
/// Returns the cache together with its temporary cache directory. The directory is cleaned up
/// when the [`TempDir`] instance is dropped, keep it as guard until the test has finished.
pub fn setup_cache(
    fetcher: &MockFetcher,
    update_config: impl FnOnce(&mut Config),
) -> (ImageCache, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    update_config(&mut config);

    (ImageCache::new(&config, fetcher.clone()), cache_dir)
}

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::from(format!("https://images.test/{name}"))
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not met in time");
}

/// Waits until the background write to disk has produced `path`.
pub async fn wait_for_file(path: &Path) -> Vec<u8> {
    wait_until(|| path.exists()).await;
    std::fs::read(path).unwrap()
}

//! The [`ImageCache`], resolving images through the memory, disk and network layers.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::caching::{CacheEntry, CacheError, DiskCache, MemoryCache};
use crate::config::Config;
use crate::download::{Fetcher, HttpFetcher};
use crate::types::{Image, ResourceKey};
use crate::utils::futures::CallOnDrop;

/// A download that is currently running, shared by every caller waiting for it.
type InFlightRequest = Shared<BoxFuture<'static, CacheEntry<Arc<Image>>>>;

type Registry = Mutex<HashMap<ResourceKey, InFlightRequest>>;

/// Resolves [`ResourceKey`]s to decoded [`Image`]s.
///
/// See the [`caching`](crate::caching) module for an overview of the layers involved. Cloning is
/// cheap, all clones share the same stores and the same set of running downloads.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

struct Inner {
    memory: MemoryCache,
    disk: DiskCache,
    fetcher: Arc<dyn Fetcher>,
    /// At most one entry per key, present exactly while a download for that key is running.
    in_flight: Arc<Registry>,
    promote_disk_hits: bool,
}

enum Lookup {
    Cached(Arc<Image>),
    Pending(InFlightRequest),
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .field("in_flight", &self.in_flight_count())
            .field("promote_disk_hits", &self.inner.promote_disk_hits)
            .finish()
    }
}

impl ImageCache {
    /// Creates a cache that downloads images with the given [`Fetcher`].
    pub fn new(config: &Config, fetcher: impl Fetcher) -> Self {
        let inner = Inner {
            memory: MemoryCache::new(),
            disk: DiskCache::new(config.cache_dir()),
            fetcher: Arc::new(fetcher),
            in_flight: Default::default(),
            promote_disk_hits: config.promote_disk_hits,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a cache that downloads images over HTTP.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::from_config(config)?;
        Ok(Self::new(config, fetcher))
    }

    /// Resolves the image for `key`.
    ///
    /// Equivalent to [`resolve_with`](Self::resolve_with) with a token that is never cancelled.
    pub async fn resolve(&self, key: &ResourceKey) -> CacheEntry<Arc<Image>> {
        self.resolve_with(key, &CancellationToken::new()).await
    }

    /// Resolves the image for `key`, giving up when `cancel` fires.
    ///
    /// This tries the following things in order:
    /// 1. Looks the image up in memory.
    /// 2. Looks the image up on disk.
    /// 3. Joins a running download for the same key, or starts a new one.
    ///
    /// Cancelling only affects this caller. A download that other callers are waiting for, or
    /// that nobody is waiting for anymore, runs to completion and populates the caches.
    ///
    /// # Errors
    ///
    /// A cache file that fails to decode is reported as [`CacheError::Corrupt`], without falling
    /// back to the network. Errors are not cached, the next call for the same key tries again.
    pub async fn resolve_with(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> CacheEntry<Arc<Image>> {
        metric!(counter("caches.access") += 1);

        if let Some(image) = self.inner.memory.get(key) {
            metric!(counter("caches.memory.hit") += 1);
            tracing::trace!("Memory hit for {}", key);
            return Ok(image);
        }

        match self.inner.disk.get(key, cancel).await {
            Ok(Some(image)) => {
                metric!(counter("caches.file.hit") += 1);
                tracing::trace!("File hit for {}", key);
                let image = Arc::new(image);
                if self.inner.promote_disk_hits {
                    self.inner.memory.put(key.clone(), Arc::clone(&image));
                }
                return Ok(image);
            }
            Ok(None) => {
                metric!(counter("caches.file.miss") += 1);
                tracing::trace!("File miss for {}", key);
            }
            Err(CacheError::Cancelled) => {
                metric!(counter("caches.cancelled") += 1);
                return Err(CacheError::Cancelled);
            }
            Err(err) => {
                if let CacheError::Corrupt(_) = err {
                    metric!(counter("caches.file.corrupt") += 1);
                }
                return Err(err);
            }
        }

        if cancel.is_cancelled() {
            metric!(counter("caches.cancelled") += 1);
            return Err(CacheError::Cancelled);
        }

        let request = match self.join_or_start(key)? {
            Lookup::Cached(image) => return Ok(image),
            Lookup::Pending(request) => request,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metric!(counter("caches.cancelled") += 1);
                tracing::trace!("Stopped waiting for {}", key);
                Err(CacheError::Cancelled)
            }
            result = request => result,
        }
    }

    /// Whether a download for `key` is currently running.
    pub fn in_flight(&self, key: &ResourceKey) -> bool {
        self.registry().contains_key(key)
    }

    /// The number of downloads currently running.
    pub fn in_flight_count(&self) -> usize {
        self.registry().len()
    }

    /// The number of callers waiting on the running download for `key`.
    pub fn waiters(&self, key: &ResourceKey) -> usize {
        self.registry()
            .get(key)
            .and_then(Shared::strong_count)
            // the registry holds one handle itself
            .map_or(0, |count| count.saturating_sub(1))
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.inner.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.inner.disk
    }

    /// Drops all images held in memory. Persisted images are kept.
    pub fn clear_memory(&self) {
        self.inner.memory.remove_all();
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, InFlightRequest>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the running download for `key`, or registers and spawns a new one.
    ///
    /// The lookup and the registration happen under the same lock, so there is never more than
    /// one download per key.
    fn join_or_start(&self, key: &ResourceKey) -> CacheEntry<Lookup> {
        let mut in_flight = self.registry();

        if let Some(request) = in_flight.get(key) {
            metric!(counter("caches.coalesced") += 1);
            tracing::trace!("Joining running download for {}", key);
            return Ok(Lookup::Pending(request.clone()));
        }

        // a download may have finished between the memory lookup and taking the lock
        if let Some(image) = self.inner.memory.get(key) {
            metric!(counter("caches.memory.hit") += 1);
            return Ok(Lookup::Cached(image));
        }

        let url = key.url()?;

        let (sender, receiver) = oneshot::channel();
        let request = receiver
            .map(|result| result.unwrap_or(Err(CacheError::InternalError)))
            .boxed()
            .shared();

        let done_token = {
            let key = key.clone();
            let registry = Arc::clone(&self.inner.in_flight);
            CallOnDrop::new(move || {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
            })
        };

        in_flight.insert(key.clone(), request.clone());
        drop(in_flight);

        tracing::debug!("Spawning download for {}", key);

        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        let span = tracing::debug_span!("fetch_image", key = %key);
        let task = async move {
            let result = inner.fetch(&key, url).await;
            // the registry is cleared before any waiter observes the result
            drop(done_token);
            sender.send(result).ok();
        };
        tokio::spawn(task.instrument(span).bind_hub(Hub::new_from_top(Hub::current())));

        Ok(Lookup::Pending(request))
    }
}

impl Inner {
    /// Downloads and decodes the image, populating the memory cache and scheduling the write
    /// to disk.
    async fn fetch(&self, key: &ResourceKey, url: Url) -> CacheEntry<Arc<Image>> {
        metric!(counter("caches.computation") += 1);

        let result = self.download(key, url).await;
        match &result {
            Ok(image) => tracing::debug!(?image, "Downloaded {}", key),
            Err(err) => {
                metric!(
                    counter("service.download.failure") += 1,
                    "reason" => err.metrics_tag(),
                );
                tracing::debug!(error = err as &dyn Error, "Failed to download {}", key);
            }
        }
        result
    }

    async fn download(&self, key: &ResourceKey, url: Url) -> CacheEntry<Arc<Image>> {
        let response = self.fetcher.fetch(&url).await?;
        if !response.status.is_success() {
            return Err(CacheError::BadResponse(response.status));
        }

        let body = response.body;
        let image = tokio::task::spawn_blocking(move || Image::decode(body))
            .await
            .map_err(|_| CacheError::InternalError)?
            .map_err(|e| CacheError::Malformed(e.to_string()))?;
        let image = Arc::new(image);

        self.memory.put(key.clone(), Arc::clone(&image));
        self.spawn_persist(key.clone(), image.data().clone());

        Ok(image)
    }

    /// Writes the downloaded bytes to disk in the background.
    ///
    /// This is best-effort, failures are logged and otherwise ignored.
    fn spawn_persist(&self, key: ResourceKey, data: Bytes) {
        let disk = self.disk.clone();
        let task = async move {
            match disk.put(&key, data, &CancellationToken::new()).await {
                Ok(()) => {
                    metric!(counter("caches.file.write") += 1);
                }
                Err(err) => {
                    metric!(counter("caches.file.write_failed") += 1);
                    tracing::error!(
                        error = &err as &dyn Error,
                        key = %key,
                        "Failed to persist image",
                    );
                }
            }
        };
        tokio::spawn(task.in_current_span());
    }
}

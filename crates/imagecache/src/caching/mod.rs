//! # Image caching infrastructure
//!
//! This module contains the storage layers backing the [`ImageCache`](crate::service::ImageCache),
//! our central [`CacheError`] type, and the codec that maps keys to file names.
//!
//! ## Cache Layers
//!
//! An image is resolved through the following layers, in order:
//!
//! - The [`MemoryCache`], holding decoded images for the lifetime of the process.
//! - The [`DiskCache`], persisting the encoded bytes of downloaded images in a flat directory.
//! - The network, via a [`Fetcher`](crate::download::Fetcher).
//!
//! Concurrent requests for the same key that miss both caches are coalesced, so that there is at
//! most one download running per key at any time.
//!
//! A freshly downloaded image is put into the memory layer right away, and persisted to disk in
//! the background. Failing to persist is logged and otherwise ignored, as the disk layer is only
//! an optimization.
//!
//! Errors are never cached. A failed request is retried from scratch the next time it is made.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.coalesced`: Accesses that joined an already running request.
//! - `caches.file.hit` / `caches.file.miss`: Outcome of the file-system lookup.
//! - `caches.file.corrupt`: Cache files that exist but do not decode.
//! - `caches.computation`: Actual downloads, not served by any of the caching layers.
//! - `caches.file.write` / `caches.file.write_failed`: Outcome of persisting a download.
//! - `caches.cancelled`: Callers that gave up waiting.

mod cache_error;
pub mod codec;
pub mod fs;
pub mod memory;

pub use cache_error::{CacheEntry, CacheError};
pub use fs::DiskCache;
pub use memory::MemoryCache;

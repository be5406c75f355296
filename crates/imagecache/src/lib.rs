//! A tiered cache for remotely fetched images.
//!
//! The entry point is [`ImageCache`](service::ImageCache), which resolves a
//! [`ResourceKey`](types::ResourceKey) through an in-memory cache, an on-disk cache and finally
//! the network, coalescing concurrent downloads of the same image.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod phase;
pub mod service;
pub mod types;
pub mod utils;

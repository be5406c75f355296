use std::sync::Arc;

use crate::types::{Image, ResourceKey};

type InMemoryCache = moka::sync::Cache<ResourceKey, Arc<Image>>;

/// A thread-safe in-memory cache of decoded images.
///
/// The cache is unbounded, entries stay until [`remove_all`](Self::remove_all) is called or the
/// process ends. Clones share the same storage.
#[derive(Clone)]
pub struct MemoryCache {
    cache: InMemoryCache,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        let cache = InMemoryCache::builder().name("images").build();
        Self { cache }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<Image>> {
        self.cache.get(key)
    }

    pub fn put(&self, key: ResourceKey, image: Arc<Image>) {
        self.cache.insert(key, image);
    }

    /// Whether an image for `key` is currently cached.
    ///
    /// This is meant for diagnostics, a subsequent [`get`](Self::get) may still miss if
    /// [`remove_all`](Self::remove_all) runs concurrently.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn remove_all(&self) {
        self.cache.invalidate_all();
    }
}

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::types::{Image, ResourceKey};

use super::codec;
use super::{CacheEntry, CacheError};

/// Prefix of the temporary files that are atomically renamed into place.
const TEMP_PREFIX: &str = ".tmp";

/// A flat directory of persisted images, one file per [`ResourceKey`].
///
/// Writes go to a temporary file in the same directory which is then atomically renamed onto
/// the final path, so readers never observe a partially written file. Reads are tolerant: a
/// missing or unreadable file is a cache miss, only a file that exists but does not decode is
/// reported as [`CacheError::Corrupt`].
///
/// All I/O happens on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: Arc<Path>,
}

impl DiskCache {
    /// Creates a cache rooted at `dir`, creating the directory if necessary.
    ///
    /// Failing to create the directory is not fatal. The cache then misses on every read and
    /// fails every write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %dir.display(),
                "Failed to create cache directory",
            );
        }
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path of the cache file for `key`.
    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        self.dir.join(codec::file_name(key))
    }

    /// Reads and decodes the cached image for `key`.
    ///
    /// Returns `Ok(None)` on a cache miss.
    pub async fn get(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> CacheEntry<Option<Image>> {
        let path = self.path_for(key);
        run_cancellable(cancel, move || load_file(&path)).await
    }

    /// Atomically writes `data` as the cache file for `key`, replacing any previous file.
    pub async fn put(
        &self,
        key: &ResourceKey,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> CacheEntry {
        let dir = Arc::clone(&self.dir);
        let path = self.path_for(key);
        let token = cancel.clone();
        run_cancellable(cancel, move || {
            let mut temp_file = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&dir)?;
            temp_file.write_all(&data)?;
            temp_file.as_file().sync_data()?;

            // dropping the temp file removes it again
            if token.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            persist_tempfile(temp_file, &path)?;
            tracing::trace!("Persisted image to {}", path.display());
            Ok(())
        })
        .await
    }
}

/// Runs blocking I/O on the blocking thread pool, giving up early if `cancel` fires.
///
/// An operation that is already running on the pool is not interrupted, but its result is
/// discarded.
async fn run_cancellable<T, F>(cancel: &CancellationToken, f: F) -> CacheEntry<T>
where
    F: FnOnce() -> CacheEntry<T> + Send + 'static,
    T: Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }
    let task = tokio::task::spawn_blocking(f);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CacheError::Cancelled),
        result = task => result.unwrap_or(Err(CacheError::InternalError)),
    }
}

fn load_file(path: &Path) -> CacheEntry<Option<Image>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to read cache file",
            );
            return Ok(None);
        }
    };

    match Image::decode(data.into()) {
        Ok(image) => Ok(Some(image)),
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Cache file is not a valid image",
            );
            Err(CacheError::Corrupt(format!("{}: {e}", path.display())))
        }
    }
}

fn persist_tempfile(temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

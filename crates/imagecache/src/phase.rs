//! Load lifecycle of a single image consumer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::caching::CacheError;
use crate::service::ImageCache;
use crate::types::{Image, ResourceKey};

/// The state of an [`ImageLoader`].
#[derive(Debug, Clone, Default)]
pub enum LoadPhase {
    /// Nothing was requested yet, or the last request was cancelled.
    #[default]
    Idle,
    Loading,
    Loaded(Arc<Image>),
    Failed(CacheError),
}

impl LoadPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        match self {
            Self::Loaded(image) => Some(image),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Loads one image through an [`ImageCache`] on behalf of one consumer.
///
/// The loader starts out [`Idle`](LoadPhase::Idle). [`load`](Self::load) kicks off a request in
/// the background, and the outcome is published as a new [`LoadPhase`]. A cancelled request
/// returns to `Idle`, so it can be started again later. Dropping the loader cancels any pending
/// request.
///
/// Loading requires a tokio runtime.
#[derive(Debug)]
pub struct ImageLoader {
    cache: ImageCache,
    key: Option<ResourceKey>,
    phase: Arc<watch::Sender<LoadPhase>>,
    receiver: watch::Receiver<LoadPhase>,
    /// Parent of the tokens handed to individual loads.
    root: CancellationToken,
    current: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ImageLoader {
    /// Creates a loader for `key`.
    ///
    /// A loader without a key fails with [`CacheError::InvalidKey`] when loaded.
    pub fn new(cache: ImageCache, key: Option<ResourceKey>) -> Self {
        let (phase, receiver) = watch::channel(LoadPhase::Idle);
        Self {
            cache,
            key,
            phase: Arc::new(phase),
            receiver,
            root: CancellationToken::new(),
            current: None,
        }
    }

    pub fn key(&self) -> Option<&ResourceKey> {
        self.key.as_ref()
    }

    /// Returns the current phase.
    pub fn phase(&self) -> LoadPhase {
        self.phase.borrow().clone()
    }

    /// Waits until the phase changes and returns the new phase.
    ///
    /// Returns right away if there was a change since the last call.
    pub async fn changed(&mut self) -> LoadPhase {
        // the sender lives as long as `self`, so this never fails
        self.receiver.changed().await.ok();
        self.receiver.borrow_and_update().clone()
    }

    /// Returns a receiver that observes all phase changes.
    pub fn subscribe(&self) -> watch::Receiver<LoadPhase> {
        self.phase.subscribe()
    }

    /// Starts loading the image.
    ///
    /// Does nothing unless the loader is [`Idle`](LoadPhase::Idle).
    pub fn load(&mut self) {
        if !self.phase.borrow().is_idle() {
            return;
        }

        let Some(key) = self.key.clone() else {
            self.phase.send_replace(LoadPhase::Failed(CacheError::InvalidKey(
                "missing url".into(),
            )));
            return;
        };

        self.phase.send_replace(LoadPhase::Loading);

        let token = self.root.child_token();
        let task = {
            let cache = self.cache.clone();
            let phase = Arc::clone(&self.phase);
            let token = token.clone();
            async move {
                let result = cache.resolve_with(&key, &token).await;
                let next = match result {
                    Ok(image) => LoadPhase::Loaded(image),
                    Err(CacheError::Cancelled) => LoadPhase::Idle,
                    Err(error) => LoadPhase::Failed(error),
                };
                // a cancelled load must not overwrite the phase of a newer one
                phase.send_if_modified(|current| {
                    if token.is_cancelled() {
                        return false;
                    }
                    *current = next;
                    true
                });
            }
        };
        let handle = tokio::spawn(task);

        self.current = Some((token, handle));
    }

    /// Cancels a pending load and resets the loader to [`Idle`](LoadPhase::Idle).
    ///
    /// Also resets a loader that already finished, so the image can be loaded again.
    pub fn cancel(&mut self) {
        if let Some((token, _handle)) = self.current.take() {
            token.cancel();
        }
        self.phase.send_if_modified(|current| {
            if current.is_idle() {
                return false;
            }
            *current = LoadPhase::Idle;
            true
        });
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

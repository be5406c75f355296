use std::error::Error;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// An error that happens when resolving an image.
///
/// All the callers that wait on the same download receive a clone of the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The key does not denote a locator that can be downloaded.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The image could not be fetched due to a transport problem, like connection loss or DNS
    /// resolution.
    ///
    /// The attached string contains the underlying error message.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The image could not be fetched from the remote source due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The remote source responded with a non-success status code.
    #[error("bad response: {0}")]
    BadResponse(StatusCode),
    /// The image was downloaded successfully, but its contents are not a valid image.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An image exists in the on-disk cache, but its contents are not a valid image.
    #[error("corrupt cache file: {0}")]
    Corrupt(String),
    /// Writing to the on-disk cache failed.
    #[error("io error: {0}")]
    Io(String),
    /// The request was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the image cache itself, like a panicking download task.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Whether this error means the image bytes could not be decoded.
    ///
    /// This is true for both downloaded and on-disk bytes.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Corrupt(_))
    }

    /// Whether this error means the network transport failed.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::DownloadError(_) | Self::Timeout(_))
    }

    /// The tag used when reporting this error in metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "invalidkey",
            Self::DownloadError(_) => "downloaderror",
            Self::Timeout(_) => "timeout",
            Self::BadResponse(_) => "badresponse",
            Self::Malformed(_) => "malformed",
            Self::Corrupt(_) => "corrupt",
            Self::Io(_) => "io",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internalerror",
        }
    }

    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why an
/// image could not be resolved.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use url::Url;

use crate::caching::CacheError;

/// Identifies a cacheable resource.
///
/// In practice this is the URL the image is downloaded from, but the caches treat it as an
/// opaque string. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses this key as a locator that can be downloaded.
    ///
    /// Only absolute `http` and `https` URLs are fetchable.
    pub fn url(&self) -> Result<Url, CacheError> {
        let url = Url::parse(&self.0).map_err(|e| CacheError::InvalidKey(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(CacheError::InvalidKey(format!(
                "unsupported url scheme `{scheme}`"
            ))),
        }
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceKey({:?})", &*self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<Url> for ResourceKey {
    fn from(url: Url) -> Self {
        Self::new(String::from(url))
    }
}

impl From<&Url> for ResourceKey {
    fn from(url: &Url) -> Self {
        Self::new(url.as_str())
    }
}

/// A decoded image, together with the encoded bytes it was decoded from.
///
/// Images are immutable, and are shared as `Arc<Image>` between all the callers that resolved
/// the same key.
#[derive(Clone)]
pub struct Image {
    data: Bytes,
    format: ImageFormat,
    pixels: DynamicImage,
}

impl Image {
    /// Decodes the given encoded image bytes.
    ///
    /// This is CPU bound and should be run on the blocking thread pool.
    pub fn decode(data: Bytes) -> Result<Self, image::ImageError> {
        let format = image::guess_format(&data)?;
        let pixels = image::load_from_memory_with_format(&data, format)?;
        Ok(Self {
            data,
            format,
            pixels,
        })
    }

    /// The encoded bytes, exactly as fetched from the network or read from disk.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("size", &self.data.len())
            .finish()
    }
}

//! Maps [`ResourceKey`]s to file system safe names and back.
//!
//! Every byte that is not an ASCII alphanumeric character is percent-escaped, so the
//! resulting names never contain path separators, dots or other characters with a special
//! meaning to the file system.

use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::types::ResourceKey;

/// The file extension used for persisted images.
pub const FILE_EXTENSION: &str = "img";

/// Encodes the key into a file system safe identifier.
pub fn encode(key: &ResourceKey) -> String {
    utf8_percent_encode(key.as_str(), NON_ALPHANUMERIC).to_string()
}

/// Decodes an identifier created by [`encode`].
///
/// Returns `None` if the input is not exactly what [`encode`] produces for some key. This rejects
/// escaped alphanumerics, lower-case hex digits and malformed escapes, so every key has exactly
/// one identifier.
pub fn decode(identifier: &str) -> Option<ResourceKey> {
    let decoded = percent_decode_str(identifier).decode_utf8().ok()?;
    let key = ResourceKey::new(decoded.as_ref());
    (encode(&key) == identifier).then_some(key)
}

/// The name of the cache file for the given key.
pub fn file_name(key: &ResourceKey) -> String {
    format!("{}.{FILE_EXTENSION}", encode(key))
}

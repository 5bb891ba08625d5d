//! JSON Pointer parsing per RFC 6901.

use crate::error::RegistryError;

/// Splits a pointer into unescaped segments.
///
/// The empty string and `"/"` both address the root (empty segment
/// list); any other pointer must start with `/`. Escapes are resolved
/// `~1` before `~0`.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, RegistryError> {
    if pointer.is_empty() || pointer == "/" {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(RegistryError::InvalidPointer(pointer.to_owned()));
    }
    Ok(pointer[1..].split('/').map(unescape).collect())
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Parses a segment as a zero-based sequence index.
pub fn parse_index(segment: &str) -> Result<usize, RegistryError> {
    segment
        .parse::<usize>()
        .map_err(|_| RegistryError::InvalidIndex(segment.to_owned()))
}

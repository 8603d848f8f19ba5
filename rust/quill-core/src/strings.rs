//! Explicit-length byte buffer backing runtime string values.
//!
//! A `ByteString` is length + raw bytes with no hidden terminator, so
//! values may contain embedded NUL bytes and arbitrary multi-byte
//! sequences. Ordering is plain byte-wise lexicographic, not
//! locale-aware.

use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteString {
    bytes: Vec<u8>,
}

impl ByteString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        ByteString { bytes: bytes.to_vec() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn concat(&self, other: &ByteString) -> ByteString {
        let mut bytes = self.bytes.clone();
        bytes.extend_from_slice(&other.bytes);
        ByteString { bytes }
    }

    /// `length` bytes starting at `offset`, clamped to the buffer.
    pub fn substring(&self, offset: usize, length: usize) -> ByteString {
        let start = offset.min(self.bytes.len());
        let end = offset.saturating_add(length).min(self.bytes.len());
        ByteString { bytes: self.bytes[start..end].to_vec() }
    }

    /// Replace `length` bytes at `offset` with `replacement`.
    pub fn splice(&self, replacement: &ByteString, offset: usize, length: usize) -> ByteString {
        let start = offset.min(self.bytes.len());
        let end = offset.saturating_add(length).min(self.bytes.len());
        let mut bytes = self.bytes[..start].to_vec();
        bytes.extend_from_slice(&replacement.bytes);
        bytes.extend_from_slice(&self.bytes[end..]);
        ByteString { bytes }
    }

    /// Terminator-appended copy for text-based external APIs. The
    /// terminator is interop only, never part of the logical content;
    /// fails if the content itself contains a NUL byte.
    pub fn to_c_string(&self) -> Option<CString> {
        CString::new(self.bytes.clone()).ok()
    }
}

impl From<&str> for ByteString {
    fn from(s: &str) -> Self {
        ByteString { bytes: s.as_bytes().to_vec() }
    }
}

impl From<String> for ByteString {
    fn from(s: String) -> Self {
        ByteString { bytes: s.into_bytes() }
    }
}

impl fmt::Display for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_bytewise() {
        assert_eq!(ByteString::from("abc"), ByteString::from_bytes(b"abc"));
        assert_ne!(ByteString::from("abc"), ByteString::from("abd"));
        // Embedded NUL bytes are ordinary content.
        let nul = ByteString::from_bytes(b"a\0b");
        assert_eq!(nul.len(), 3);
        assert_ne!(nul, ByteString::from("ab"));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(ByteString::from("abc") < ByteString::from("abd"));
        // A shorter non-conflicting prefix sorts first.
        assert!(ByteString::from("ab") < ByteString::from("abc"));
        assert!(ByteString::from("b") > ByteString::from("azzz"));
    }

    #[test]
    fn test_substring_and_splice() {
        let s = ByteString::from("hello world");
        assert_eq!(s.substring(6, 5), ByteString::from("world"));
        assert_eq!(s.substring(6, 100), ByteString::from("world"));
        let spliced = s.splice(&ByteString::from("there"), 6, 5);
        assert_eq!(spliced, ByteString::from("hello there"));
    }

    #[test]
    fn test_usable_as_hash_map_key() {
        let mut slots = std::collections::HashMap::new();
        slots.insert(ByteString::from("argv"), 0usize);
        slots.insert(ByteString::from("env"), 1usize);
        assert_eq!(slots.get(&ByteString::from("argv")), Some(&0));
        assert_eq!(slots.get(&ByteString::from_bytes(b"env")), Some(&1));
        assert_eq!(slots.get(&ByteString::from("missing")), None);
    }

    #[test]
    fn test_c_string_interop() {
        let s = ByteString::from("abc");
        assert_eq!(s.to_c_string().unwrap().as_bytes(), b"abc");
        // Logical length is unchanged by the interop terminator.
        assert_eq!(s.len(), 3);
        assert!(ByteString::from_bytes(b"a\0b").to_c_string().is_none());
    }
}

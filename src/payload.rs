// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Opaque node payloads.
//!
//! A [`Payload`] is the value a tree node carries: a small dictionary of
//! named byte fields. The replication layer treats it as opaque — all it
//! needs is byte-flattening (for the wire and for archives) and a stable
//! 32-bit checksum (for the running database checksum). Interpretation of
//! the fields is entirely up to the application.
//!
//! Fields are kept in a `BTreeMap` so flattening is deterministic: two
//! payloads with the same fields flatten to the same bytes on every peer.

use crate::checksum::{bytes_checksum, combine, str_checksum};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque key→bytes dictionary carried by a tree node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    fields: BTreeMap<String, Vec<u8>>,
}

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set a raw byte field, replacing any previous value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set a UTF-8 string field.
    pub fn put_str(&mut self, key: impl Into<String>, value: &str) -> &mut Self {
        self.put(key, value.as_bytes().to_vec())
    }

    /// Set a little-endian i64 field.
    pub fn put_i64(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.put(key, value.to_le_bytes().to_vec())
    }

    /// Get a raw byte field.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    /// Get a field as UTF-8, if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Get a field as a little-endian i64, if it is exactly 8 bytes.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(i64::from_le_bytes)
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.fields.remove(key)
    }

    /// Iterate fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Stable 32-bit checksum over all fields.
    ///
    /// Per field: `str_checksum(key) + bytes_checksum(value)`, combined with
    /// wrapping add. The empty payload is 0. Field order cannot affect the
    /// sum (the combine is commutative), so this matches the flattened form
    /// on every peer regardless of insertion history.
    pub fn checksum(&self) -> u32 {
        self.fields.iter().fold(0u32, |acc, (k, v)| {
            combine(acc, str_checksum(k).wrapping_add(bytes_checksum(v)))
        })
    }

    /// Flatten to bytes for the wire or an archive.
    pub fn flatten(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::codec(format!("payload flatten: {e}")))
    }

    /// Restore from flattened bytes.
    pub fn unflatten(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| Error::codec(format!("payload unflatten: {e}")))
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>, const N: usize> From<[(K, V); N]> for Payload {
    fn from(entries: [(K, V); N]) -> Self {
        let mut p = Payload::new();
        for (k, v) in entries {
            p.put(k, v);
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_checksum_zero() {
        assert_eq!(Payload::new().checksum(), 0);
    }

    #[test]
    fn test_known_checksum() {
        // Empty key contributes 0, single byte [7] contributes 7.
        let p = Payload::from([("", vec![7u8])]);
        assert_eq!(p.checksum(), 7);
    }

    #[test]
    fn test_checksum_order_independent() {
        let mut a = Payload::new();
        a.put_str("name", "fridge").put_i64("count", 3);
        let mut b = Payload::new();
        b.put_i64("count", 3).put_str("name", "fridge");
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a, b);
    }

    #[test]
    fn test_checksum_changes_on_value_change() {
        let mut p = Payload::new();
        p.put_str("k", "v1");
        let cs1 = p.checksum();
        p.put_str("k", "v2");
        assert_ne!(cs1, p.checksum());
    }

    #[test]
    fn test_typed_accessors() {
        let mut p = Payload::new();
        p.put_str("s", "hello").put_i64("n", -42).put("b", vec![1, 2]);

        assert_eq!(p.get_str("s"), Some("hello"));
        assert_eq!(p.get_i64("n"), Some(-42));
        assert_eq!(p.get("b"), Some(&[1u8, 2][..]));
        assert_eq!(p.get("missing"), None);
        assert_eq!(p.get_i64("s"), None); // wrong width
    }

    #[test]
    fn test_flatten_roundtrip() {
        let mut p = Payload::new();
        p.put_str("name", "magnet").put_i64("x", 120).put("raw", vec![0, 255, 3]);

        let bytes = p.flatten().unwrap();
        let restored = Payload::unflatten(&bytes).unwrap();
        assert_eq!(restored, p);
        assert_eq!(restored.checksum(), p.checksum());
    }

    #[test]
    fn test_flatten_deterministic() {
        let mut a = Payload::new();
        a.put_str("z", "1").put_str("a", "2");
        let mut b = Payload::new();
        b.put_str("a", "2").put_str("z", "1");
        assert_eq!(a.flatten().unwrap(), b.flatten().unwrap());
    }

    #[test]
    fn test_unflatten_garbage_fails() {
        assert!(Payload::unflatten(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_remove_field() {
        let mut p = Payload::from([("a", vec![1u8]), ("b", vec![2u8])]);
        assert_eq!(p.remove("a"), Some(vec![1u8]));
        assert_eq!(p.len(), 1);
        assert_eq!(p.remove("a"), None);
    }
}

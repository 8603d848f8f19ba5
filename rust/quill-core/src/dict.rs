//! Sorted key/value container backing `Cell::Dictionary`.
//!
//! Entries are kept contiguously in ascending byte-wise key order, so
//! lookup can use binary search and iteration is always sorted. There
//! is no delete operation; the runtime's dictionaries only ever grow.

use crate::cell::Cell;
use crate::strings::ByteString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderedDict {
    entries: Vec<(ByteString, Cell)>,
}

impl OrderedDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `value` under `key`, keeping the entries sorted. An
    /// existing key is overwritten in place; duplicates are never
    /// created.
    pub fn insert(&mut self, key: ByteString, value: Cell) {
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(idx) => self.entries[idx].1 = value,
            Err(idx) => self.entries.insert(idx, (key, value)),
        }
    }

    pub fn get(&self, key: &ByteString) -> Option<&Cell> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, key: &ByteString) -> Option<&mut Cell> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => Some(&mut self.entries[idx].1),
            Err(_) => None,
        }
    }

    /// Mutable reference to the value under `key`, inserting a default
    /// `Nothing` cell in sorted position if the key is absent.
    pub fn entry(&mut self, key: &ByteString) -> &mut Cell {
        let idx = match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => idx,
            Err(idx) => {
                self.entries.insert(idx, (key.clone(), Cell::Nothing));
                idx
            }
        };
        &mut self.entries[idx].1
    }

    pub fn contains_key(&self, key: &ByteString) -> bool {
        self.entries.binary_search_by(|(k, _)| k.cmp(key)).is_ok()
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &ByteString> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ByteString, &Cell)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;

    fn num(v: i64) -> Cell {
        Cell::Number(Number::from_i64(v))
    }

    #[test]
    fn test_iteration_is_sorted() {
        let mut d = OrderedDict::new();
        d.insert("b".into(), num(1));
        d.insert("a".into(), num(2));
        d.insert("c".into(), num(3));
        let keys: Vec<String> = d.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn test_reinsert_overwrites_in_place() {
        let mut d = OrderedDict::new();
        d.insert("x".into(), num(1));
        d.insert("x".into(), num(2));
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&"x".into()), Some(&num(2)));
    }

    #[test]
    fn test_entry_inserts_default_once() {
        let mut d = OrderedDict::new();
        assert_eq!(*d.entry(&"k".into()), Cell::Nothing);
        *d.entry(&"k".into()) = num(9);
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&"k".into()), Some(&num(9)));
    }

    #[test]
    fn test_lookup_miss() {
        let d = OrderedDict::new();
        assert_eq!(d.get(&"missing".into()), None);
        assert!(!d.contains_key(&"missing".into()));
    }

    #[test]
    fn test_byte_order_not_locale() {
        let mut d = OrderedDict::new();
        d.insert("Z".into(), num(1));
        d.insert("a".into(), num(2));
        // 'Z' (0x5a) sorts before 'a' (0x61) byte-wise.
        let keys: Vec<String> = d.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["Z", "a"]);
    }
}

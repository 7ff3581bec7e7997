//! The 64-byte key-value record and the packed per-node record array.
//!
//! An entry stores the key length big-endian at `[0..8)`, the key
//! zero-padded at `[8..56)` and the 8-byte value at `[56..64)`. A node's
//! entries live in one contiguous buffer: a 64-byte head whose first word
//! is the record count, followed by the record slots. The buffer doubles
//! as the on-disk node body, so persisting a node is a single copy.

use crate::error::{Error, Result};

use super::{MAX_ITEMS, MAX_KEY_LEN};

pub(crate) const ENTRY_SIZE: usize = 64;
pub(crate) const ENTRIES_HEAD_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry([u8; ENTRY_SIZE]);

impl Entry {
    /// Builds an entry from a key of at most [`MAX_KEY_LEN`] bytes and an
    /// 8-byte value. Key length is validated by the callers.
    pub(crate) fn new(key: &[u8], value: [u8; 8]) -> Entry {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&(key.len() as u64).to_be_bytes());
        buf[8..8 + key.len()].copy_from_slice(key);
        buf[56..64].copy_from_slice(&value);
        Entry(buf)
    }

    pub(crate) fn key(&self) -> &[u8] {
        let len = read_key_len(&self.0);
        &self.0[8..8 + len]
    }

    pub(crate) fn value(&self) -> [u8; 8] {
        let mut value = [0u8; 8];
        value.copy_from_slice(&self.0[56..64]);
        value
    }

    pub(crate) fn as_bytes(&self) -> &[u8; ENTRY_SIZE] {
        &self.0
    }
}

// Corrupt lengths are clamped to the key area.
fn read_key_len(slot: &[u8]) -> usize {
    let mut word = [0u8; 8];
    word.copy_from_slice(&slot[0..8]);
    (u64::from_be_bytes(word) as usize).min(MAX_KEY_LEN)
}

/// The packed record array of one node, head included.
#[derive(Clone, PartialEq)]
pub(crate) struct Entries(Vec<u8>);

impl Entries {
    /// On-disk width: the head plus every record slot.
    pub(crate) const BYTES: usize = ENTRIES_HEAD_LEN + MAX_ITEMS * ENTRY_SIZE;

    pub(crate) fn new() -> Entries {
        Entries(vec![0u8; Self::BYTES])
    }

    pub(crate) fn from_body(body: &[u8]) -> Result<Entries> {
        if body.len() != Self::BYTES {
            return Err(Error::invariant(format!(
                "node body of {} bytes, expected {}",
                body.len(),
                Self::BYTES
            )));
        }
        Ok(Entries(body.to_vec()))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn len(&self) -> usize {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[0..8]);
        u64::from_be_bytes(word) as usize
    }

    fn set_len(&mut self, n: usize) {
        self.0[0..8].copy_from_slice(&(n as u64).to_be_bytes());
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == MAX_ITEMS
    }

    fn slot(idx: usize) -> usize {
        ENTRIES_HEAD_LEN + idx * ENTRY_SIZE
    }

    pub(crate) fn key_at(&self, idx: usize) -> &[u8] {
        let start = Self::slot(idx);
        let len = read_key_len(&self.0[start..start + ENTRY_SIZE]);
        &self.0[start + 8..start + 8 + len]
    }

    pub(crate) fn value_at(&self, idx: usize) -> [u8; 8] {
        let start = Self::slot(idx);
        let mut value = [0u8; 8];
        value.copy_from_slice(&self.0[start + 56..start + 64]);
        value
    }

    pub(crate) fn entry_at(&self, idx: usize) -> Entry {
        let start = Self::slot(idx);
        let mut buf = [0u8; ENTRY_SIZE];
        buf.copy_from_slice(&self.0[start..start + ENTRY_SIZE]);
        Entry(buf)
    }

    /// Inserts at `idx`, shifting later records one slot right. The array
    /// must not be full and `idx` must not exceed the current count.
    pub(crate) fn insert(&mut self, idx: usize, entry: &Entry) {
        debug_assert!(!self.is_full());
        debug_assert!(idx <= self.len());
        let start = Self::slot(idx);
        self.0.copy_within(start..Self::BYTES - ENTRY_SIZE, start + ENTRY_SIZE);
        self.0[start..start + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        let count = self.len();
        self.set_len(count + 1);
    }

    pub(crate) fn replace(&mut self, idx: usize, entry: &Entry) {
        let start = Self::slot(idx);
        self.0[start..start + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
    }

    /// Splits a full array around its median: records left of the median,
    /// the median itself, and the records right of it.
    pub(crate) fn split(&self) -> (Entries, Entry, Entries) {
        let count = self.len();
        let mid = count / 2;
        let left_len = count - mid - 1;
        let right_len = count - left_len - 1;
        let median = self.entry_at(left_len);

        let mut left = Entries::new();
        left.set_len(left_len);
        left.0[ENTRIES_HEAD_LEN..Self::slot(left_len)]
            .copy_from_slice(&self.0[ENTRIES_HEAD_LEN..Self::slot(left_len)]);

        let mut right = Entries::new();
        right.set_len(right_len);
        right.0[ENTRIES_HEAD_LEN..Self::slot(right_len)]
            .copy_from_slice(&self.0[Self::slot(left_len + 1)..Self::slot(left_len + 1 + right_len)]);

        (left, median, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_entry(i: u64) -> Entry {
        Entry::new(&i.to_be_bytes(), i.to_be_bytes())
    }

    #[test]
    fn entry_round_trip() {
        let entry = Entry::new(b"tape/42", 7u64.to_be_bytes());
        assert_eq!(entry.key(), b"tape/42");
        assert_eq!(entry.value(), 7u64.to_be_bytes());
        // Key padded with zeros up to the value area.
        assert_eq!(&entry.as_bytes()[8 + 7..56], &[0u8; 41][..]);
    }

    #[test]
    fn insert_shifts_later_records() {
        let mut entries = Entries::new();
        for i in [0u64, 2, 3] {
            let at = entries.len();
            entries.insert(at, &int_entry(i));
        }
        entries.insert(1, &int_entry(1));
        assert_eq!(entries.len(), 4);
        for i in 0u64..4 {
            assert_eq!(entries.key_at(i as usize), &i.to_be_bytes());
            assert_eq!(entries.value_at(i as usize), i.to_be_bytes());
        }
    }

    #[test]
    fn replace_overwrites_in_place() {
        let mut entries = Entries::new();
        entries.insert(0, &int_entry(1));
        entries.replace(0, &Entry::new(&1u64.to_be_bytes(), 9u64.to_be_bytes()));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.value_at(0), 9u64.to_be_bytes());
    }

    #[test]
    fn split_keeps_every_record_once() {
        let mut entries = Entries::new();
        for i in 0u64..6 {
            let at = entries.len();
            entries.insert(at, &int_entry(i));
        }
        let (left, median, right) = entries.split();
        assert_eq!(left.len(), 2);
        assert_eq!(median.key(), &2u64.to_be_bytes());
        assert_eq!(right.len(), 3);
        assert_eq!(left.key_at(0), &0u64.to_be_bytes());
        assert_eq!(left.key_at(1), &1u64.to_be_bytes());
        for (slot, i) in (3u64..6).enumerate() {
            assert_eq!(right.key_at(slot), &i.to_be_bytes());
        }
    }

    #[test]
    fn body_round_trip() {
        let mut entries = Entries::new();
        entries.insert(0, &int_entry(5));
        let copy = Entries::from_body(entries.as_bytes()).unwrap();
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.key_at(0), &5u64.to_be_bytes());
        assert!(Entries::from_body(&[0u8; 16]).is_err());
    }
}

//! A single on-disk list node.
//!
//! 256 bytes: four big-endian header words (own id, item count, previous
//! id, next id) followed by fourteen 16-byte item slots. Ids are 1-based;
//! zero links terminate the chain.

use deku::prelude::*;

use crate::blocks::{POSITION_LEN, Position};
use crate::error::Error;

pub(crate) const ITEM_SIZE: usize = POSITION_LEN;
pub(crate) const MAX_ITEMS: usize = 14;
pub(crate) const LIST_HEAD_LEN: usize = 32;
pub(crate) const LIST_SIZE: usize = LIST_HEAD_LEN + ITEM_SIZE * MAX_ITEMS;

const ITEMS_LEN: usize = ITEM_SIZE * MAX_ITEMS;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(crate) struct List {
    no: u64,
    count: u64,
    prev: u64,
    next: u64,
    items: [u8; ITEMS_LEN],
}

impl List {
    pub(crate) fn new(no: u64) -> List {
        List {
            no,
            count: 0,
            prev: 0,
            next: 0,
            items: [0u8; ITEMS_LEN],
        }
    }

    pub(crate) fn decode(raw: &[u8]) -> crate::error::Result<List> {
        let (_rest, list) = List::from_bytes((raw, 0))
            .map_err(|err| Error::invariant(format!("list node: {err}")))?;
        Ok(list)
    }

    pub(crate) fn encode(&self) -> crate::error::Result<Vec<u8>> {
        let raw = self
            .to_bytes()
            .map_err(|err| Error::invariant(format!("list node: {err}")))?;
        debug_assert_eq!(raw.len(), LIST_SIZE);
        Ok(raw)
    }

    pub(crate) fn no(&self) -> u64 {
        self.no
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn next(&self) -> u64 {
        self.next
    }

    pub(crate) fn set_prev(&mut self, prev: u64) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: u64) {
        self.next = next;
    }

    /// Appends one item. Returns false when every slot is taken.
    pub(crate) fn push(&mut self, item: Position) -> bool {
        let n = self.count as usize;
        if n >= MAX_ITEMS {
            return false;
        }
        self.items[n * ITEM_SIZE..(n + 1) * ITEM_SIZE].copy_from_slice(item.as_bytes());
        self.count += 1;
        true
    }

    /// The items from slot `offset` through the last occupied slot, in
    /// append order.
    pub(crate) fn items_from(&self, offset: usize) -> Vec<Position> {
        let n = self.count as usize;
        (offset.min(n)..n)
            .map(|i| {
                let mut raw = [0u8; ITEM_SIZE];
                raw.copy_from_slice(&self.items[i * ITEM_SIZE..(i + 1) * ITEM_SIZE]);
                Position::from_bytes(raw)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(i: u64) -> Position {
        Position::new(i, 0)
    }

    #[test]
    fn push_fills_the_slots_in_order() {
        let mut list = List::new(1);
        for i in 0..MAX_ITEMS as u64 {
            assert!(list.push(pos(i)));
        }
        assert!(!list.push(pos(99)));
        assert_eq!(list.count(), MAX_ITEMS as u64);
        let items = list.items_from(0);
        assert_eq!(items.len(), MAX_ITEMS);
        assert_eq!(items[0], pos(0));
        assert_eq!(items[13], pos(13));
    }

    #[test]
    fn items_from_clamps_to_the_count() {
        let mut list = List::new(1);
        list.push(pos(1));
        list.push(pos(2));
        assert_eq!(list.items_from(0).len(), 2);
        assert_eq!(list.items_from(1), vec![pos(2)]);
        assert!(list.items_from(2).is_empty());
        assert!(list.items_from(9).is_empty());
    }

    #[test]
    fn disk_image_round_trip() {
        let mut list = List::new(3);
        list.set_prev(2);
        list.set_next(4);
        list.push(pos(7));
        let raw = list.encode().unwrap();
        assert_eq!(raw.len(), LIST_SIZE);
        // Big-endian header words: id, count, prev, next.
        assert_eq!(&raw[0..8], &3u64.to_be_bytes());
        assert_eq!(&raw[8..16], &1u64.to_be_bytes());
        assert_eq!(&raw[16..24], &2u64.to_be_bytes());
        assert_eq!(&raw[24..32], &4u64.to_be_bytes());
        assert_eq!(&raw[32..48], pos(7).as_bytes());
        assert_eq!(List::decode(&raw).unwrap(), list);
    }
}

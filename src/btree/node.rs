//! In-memory node skeletons and their on-disk layout.
//!
//! A node occupies a fixed slot: a child table of big-endian ids (zero
//! terminates the list; a leaf has none) followed by the packed entries
//! array. Entry buffers are loaded lazily through the node cache and
//! dropped again after every mutation, so a skeleton holds only its id,
//! its children and a copy-on-write token.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::file::DataFile;
use crate::lru::Lru;

use super::MAX_ITEMS;
use super::entry::Entries;

/// Reserved file header ahead of the node array.
pub(crate) const HEAD_SIZE: u64 = 4096;
pub(crate) const NODE_HEAD_LEN: usize = 8 * (MAX_ITEMS + 1);
pub(crate) const NODE_SIZE: usize = NODE_HEAD_LEN + Entries::BYTES;

pub(crate) const MAX_HINT_DEPTH: usize = 8;

pub(crate) type NodeCache = Mutex<Lru<u64, Arc<Entries>>>;

/// Remembers the slot followed at each descent depth so that repeated
/// lookups with nearby keys can skip most of the binary search. One hint
/// belongs to one operation; sharing would just thrash it.
#[derive(Default)]
pub(crate) struct PathHint {
    pub(crate) used: [bool; MAX_HINT_DEPTH],
    pub(crate) path: [u16; MAX_HINT_DEPTH],
}

pub(crate) struct Node {
    pub(crate) idx: u64,
    pub(crate) cow: u64,
    pub(crate) dirty: bool,
    pub(crate) items: Option<Arc<Entries>>,
    pub(crate) children: Vec<Node>,
}

impl Node {
    pub(crate) fn new(idx: u64, cow: u64) -> Node {
        Node {
            idx,
            cow,
            dirty: false,
            items: None,
            children: Vec::new(),
        }
    }

    pub(crate) fn leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn offset(idx: u64) -> u64 {
        HEAD_SIZE + (idx - 1) * NODE_SIZE as u64
    }

    /// Marks the node as owned by the current mutation pass. Entry buffers
    /// still shared with the cache are detached lazily on first write.
    pub(crate) fn refresh(&mut self, cow: u64) {
        if self.cow != cow {
            self.cow = cow;
        }
    }

    /// Entries for a read-only descent; the buffer is not retained on the
    /// skeleton.
    pub(crate) fn entries(&self, file: &DataFile, cache: &NodeCache) -> Result<Arc<Entries>> {
        match &self.items {
            Some(items) => Ok(items.clone()),
            None => load_entries(self.idx, file, cache),
        }
    }

    /// Entries for a mutation pass, loaded once and held on the skeleton
    /// until the commit releases them.
    pub(crate) fn entries_held(&mut self, file: &DataFile, cache: &NodeCache) -> Result<&Entries> {
        self.ensure_items(file, cache)?;
        match &self.items {
            Some(items) => Ok(items),
            None => Err(Error::invariant("node entries vanished while held")),
        }
    }

    /// Mutable entries, detached from any buffer the cache still shares.
    pub(crate) fn entries_mut(&mut self, file: &DataFile, cache: &NodeCache) -> Result<&mut Entries> {
        self.ensure_items(file, cache)?;
        match &mut self.items {
            Some(items) => Ok(Arc::make_mut(items)),
            None => Err(Error::invariant("node entries vanished while held")),
        }
    }

    fn ensure_items(&mut self, file: &DataFile, cache: &NodeCache) -> Result<()> {
        if self.items.is_none() {
            self.items = Some(load_entries(self.idx, file, cache)?);
        }
        Ok(())
    }

    /// Serializes the child table and entry buffer into the node's slot
    /// and refreshes the cache.
    pub(crate) fn write(&self, file: &DataFile, cache: &NodeCache) -> Result<()> {
        let Some(items) = &self.items else {
            return Err(Error::invariant(format!(
                "node {} written without loaded entries",
                self.idx
            )));
        };
        let mut page = vec![0u8; NODE_SIZE];
        for (i, child) in self.children.iter().enumerate() {
            page[i * 8..(i + 1) * 8].copy_from_slice(&child.idx.to_be_bytes());
        }
        page[NODE_HEAD_LEN..].copy_from_slice(items.as_bytes());
        file.write_at(Node::offset(self.idx), &page)?;
        cache.lock().add(self.idx, items.clone());
        Ok(())
    }
}

fn load_entries(idx: u64, file: &DataFile, cache: &NodeCache) -> Result<Arc<Entries>> {
    if let Some(items) = cache.lock().get(&idx) {
        return Ok(items.clone());
    }
    trace!("btree node {idx} not cached, reading from disk");
    let region = file.read_region(Node::offset(idx), NODE_SIZE as u64)?;
    let body = region
        .bytes()
        .get(NODE_HEAD_LEN..)
        .ok_or_else(|| Error::invariant(format!("node {idx} region is truncated")))?;
    let items = Arc::new(Entries::from_body(body)?);
    region.close();
    cache.lock().add(idx, items.clone());
    Ok(items)
}

//! Persistent copy-on-write B-tree mapping short keys to 8-byte values.
//!
//! The tree of degree 256 lives in one file: an 8-byte big-endian root id
//! and a clean-shutdown marker in the reserved header, then fixed-size
//! node slots addressed by 1-based id. Lookups descend under the shared
//! lock with a per-operation path hint; mutations run under the exclusive
//! lock, accumulate dirty nodes and persist them all before returning.
//! Entry buffers flow through an LRU cache shared by readers and writers.

mod entry;
mod node;

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::file::{DataFile, SyncTask, byte_size, read_be_u64};
use crate::lru::Lru;

use entry::{Entries, Entry};
use node::{MAX_HINT_DEPTH, NODE_SIZE, Node, NodeCache, PathHint};

/// Longest accepted key.
pub const MAX_KEY_LEN: usize = 48;

const DEGREE: usize = 256;
pub(crate) const MAX_ITEMS: usize = DEGREE * 2 - 1;

const DEFAULT_MAX_CACHE_NODES: usize = 2048;
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

const ROOT_OFFSET: u64 = 0;
const MARKER_OFFSET: u64 = 8;
const CLEAN: u64 = 1;

/// Total order over keys; [`Ordering::Less`] means the first key sorts
/// first.
pub type Comparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

pub struct Options {
    pub path: PathBuf,
    /// Cached decoded nodes; 0 means the default of 2048 (roughly 64 MB).
    pub max_cache_nodes: usize,
    /// Key order; lexicographic when absent.
    pub comparator: Option<Comparator>,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Options {
        Options {
            path: path.into(),
            max_cache_nodes: 0,
            comparator: None,
        }
    }
}

struct Tree {
    root: Option<Node>,
    size: u64,
    cow: u64,
}

pub struct BTree {
    tree: RwLock<Tree>,
    cache: NodeCache,
    file: Arc<DataFile>,
    comparator: Option<Comparator>,
    sync_task: SyncTask,
}

impl BTree {
    /// Opens the tree file, recovering the persisted root. Fails with
    /// [`Error::NotSafelyClosed`] when the previous instance did not close.
    pub fn open(options: Options) -> Result<BTree> {
        let file = Arc::new(DataFile::open(&options.path)?);
        let cache_nodes = if options.max_cache_nodes == 0 {
            DEFAULT_MAX_CACHE_NODES
        } else {
            options.max_cache_nodes
        };
        let cache = Mutex::new(Lru::new(cache_nodes, None));
        let mut tree = Tree {
            root: None,
            size: 0,
            cow: 1,
        };
        Self::load(&file, &cache, &mut tree)?;
        debug!(
            "opened btree at {}, caching up to {} nodes ({})",
            options.path.display(),
            cache_nodes,
            byte_size((cache_nodes * NODE_SIZE) as u64),
        );
        let sync_task = SyncTask::spawn("btree", file.clone(), SYNC_INTERVAL)?;
        Ok(BTree {
            tree: RwLock::new(tree),
            cache,
            file,
            comparator: options.comparator,
            sync_task,
        })
    }

    /// Inserts or replaces `key`. Every node touched on the way down is
    /// written back before the call returns.
    pub fn set(&self, key: &[u8], value: [u8; 8]) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLarge(key.len()));
        }
        let mut tree = self.tree.write();
        tree.cow += 1;
        let entry = Entry::new(key, value);
        let mut hint = PathHint::default();
        self.set_root(&mut tree, entry, &mut hint)?;
        if let Some(root) = tree.root.as_mut() {
            Self::commit(root, &self.file, &self.cache)?;
        }
        Ok(())
    }

    /// Looks `key` up under the shared lock.
    pub fn get(&self, key: &[u8]) -> Result<Option<[u8; 8]>> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLarge(key.len()));
        }
        let tree = self.tree.read();
        let Some(mut current) = tree.root.as_ref() else {
            return Ok(None);
        };
        let mut hint = PathHint::default();
        let mut depth = 0;
        loop {
            let items = current.entries(&self.file, &self.cache)?;
            let (idx, found) = self.search(&items, key, &mut hint, depth, current.leaf());
            if found {
                return Ok(Some(items.value_at(idx)));
            }
            if current.leaf() {
                return Ok(None);
            }
            current = current.children.get(idx).ok_or_else(|| {
                Error::invariant(format!("node {} lacks child {idx}", current.idx))
            })?;
            depth += 1;
        }
    }

    /// Stops the background sync, persists the root id and the
    /// clean-shutdown marker, and syncs the file.
    pub fn close(self) -> Result<()> {
        let BTree {
            tree,
            cache: _,
            file,
            comparator: _,
            sync_task,
        } = self;
        sync_task.stop();
        let tree = tree.into_inner();
        let root_idx = tree.root.as_ref().map_or(0, |node| node.idx);
        file.write_at(ROOT_OFFSET, &root_idx.to_be_bytes())?;
        file.write_at(MARKER_OFFSET, &CLEAN.to_be_bytes())?;
        file.sync()?;
        debug!("closed btree, root {root_idx}, {} nodes", tree.size);
        Ok(())
    }

    fn less(&self, a: &[u8], b: &[u8]) -> bool {
        match &self.comparator {
            Some(cmp) => cmp(a, b) == Ordering::Less,
            None => a < b,
        }
    }

    /// Binary search within one node, short-circuited by the path hint:
    /// the slot taken at this depth last time is probed first, and a miss
    /// narrows the remaining range and drops the deeper hints.
    fn search(
        &self,
        items: &Entries,
        key: &[u8],
        hint: &mut PathHint,
        depth: usize,
        leaf: bool,
    ) -> (usize, bool) {
        let size = items.len();
        if size == 0 {
            return (0, false);
        }
        let mut low = 0usize;
        let mut high = size as i64 - 1;
        let mut outcome: Option<(usize, bool)> = None;
        if depth < MAX_HINT_DEPTH && hint.used[depth] {
            let mut idx = hint.path[depth] as usize;
            if idx >= size {
                if self.less(items.key_at(size - 1), key) {
                    outcome = Some((size, false));
                } else {
                    idx = size - 1;
                }
            }
            if outcome.is_none() {
                if self.less(key, items.key_at(idx)) {
                    if idx == 0 || self.less(items.key_at(idx - 1), key) {
                        outcome = Some((idx, false));
                    } else {
                        high = idx as i64 - 1;
                    }
                } else if self.less(items.key_at(idx), key) {
                    low = idx + 1;
                } else {
                    outcome = Some((idx, true));
                }
            }
        }
        let (idx, found) = match outcome {
            Some(result) => result,
            None => {
                let mut low = low as i64;
                while low <= high {
                    let mid = low + ((high + 1) - low) / 2;
                    if !self.less(key, items.key_at(mid as usize)) {
                        low = mid + 1;
                    } else {
                        high = mid - 1;
                    }
                }
                let low = low as usize;
                if low > 0 && !self.less(items.key_at(low - 1), key) {
                    (low - 1, true)
                } else {
                    (low, false)
                }
            }
        };
        if depth < MAX_HINT_DEPTH {
            hint.used[depth] = true;
            let path_index = if leaf && found { (idx + 1) as u16 } else { idx as u16 };
            if path_index != hint.path[depth] {
                hint.path[depth] = path_index;
                for slot in depth + 1..MAX_HINT_DEPTH {
                    hint.used[slot] = false;
                }
            }
        }
        (idx, found)
    }

    fn set_root(&self, tree: &mut Tree, entry: Entry, hint: &mut PathHint) -> Result<()> {
        let Tree { root, size, cow } = tree;
        let Some(node) = root else {
            *size += 1;
            let mut fresh = Node::new(*size, *cow);
            let mut items = Entries::new();
            items.insert(0, &entry);
            fresh.items = Some(Arc::new(items));
            fresh.dirty = true;
            *root = Some(fresh);
            return Ok(());
        };
        let split = self.set_node(node, entry, hint, 0, size, *cow)?;
        if !split {
            return Ok(());
        }
        // The root is full: split it and grow a new root over the halves.
        let Some(mut left) = root.take() else {
            return Err(Error::invariant("root vanished during split"));
        };
        let (right, median) = self.split_node(&mut left, size, *cow)?;
        *size += 1;
        let mut grown = Node::new(*size, *cow);
        let mut items = Entries::new();
        items.insert(0, &median);
        grown.items = Some(Arc::new(items));
        grown.children = vec![left, right];
        grown.dirty = true;
        *root = Some(grown);
        self.set_root(tree, entry, hint)
    }

    fn set_node(
        &self,
        node: &mut Node,
        entry: Entry,
        hint: &mut PathHint,
        depth: usize,
        size: &mut u64,
        cow: u64,
    ) -> Result<bool> {
        node.refresh(cow);
        let leaf = node.leaf();
        let (idx, found) = {
            let items = node.entries_held(&self.file, &self.cache)?;
            self.search(items, entry.key(), hint, depth, leaf)
        };
        if found {
            node.entries_mut(&self.file, &self.cache)?.replace(idx, &entry);
            node.dirty = true;
            return Ok(false);
        }
        if leaf {
            if node.entries_held(&self.file, &self.cache)?.is_full() {
                return Ok(true);
            }
            node.entries_mut(&self.file, &self.cache)?.insert(idx, &entry);
            node.dirty = true;
            return Ok(false);
        }
        if node.children.get(idx).is_none() {
            return Err(Error::invariant(format!(
                "node {} lacks child {idx}",
                node.idx
            )));
        }
        let split = self.set_node(&mut node.children[idx], entry, hint, depth + 1, size, cow)?;
        if !split {
            return Ok(false);
        }
        if node.entries_held(&self.file, &self.cache)?.is_full() {
            return Ok(true);
        }
        let (right, median) = self.split_node(&mut node.children[idx], size, cow)?;
        node.children.insert(idx + 1, right);
        node.entries_mut(&self.file, &self.cache)?.insert(idx, &median);
        node.dirty = true;
        self.set_node(node, entry, hint, depth, size, cow)
    }

    /// Splits a full node: the left half keeps the id, the right half gets
    /// a fresh one, and the median moves up to the caller.
    fn split_node(&self, node: &mut Node, size: &mut u64, cow: u64) -> Result<(Node, Entry)> {
        node.refresh(cow);
        let (left_items, median, right_items) =
            node.entries_held(&self.file, &self.cache)?.split();
        *size += 1;
        let mut right = Node::new(*size, cow);
        right.items = Some(Arc::new(right_items));
        if !node.leaf() {
            right.children = node.children.split_off(MAX_ITEMS / 2 + 1);
        }
        right.dirty = true;
        node.items = Some(Arc::new(left_items));
        node.dirty = true;
        Ok((right, median))
    }

    /// Writes every dirty node to its slot, then drops all in-memory entry
    /// buffers so nothing unwritten lingers.
    fn commit(node: &mut Node, file: &DataFile, cache: &NodeCache) -> Result<()> {
        if node.dirty {
            node.write(file, cache)?;
            node.dirty = false;
        }
        node.items = None;
        for child in &mut node.children {
            Self::commit(child, file, cache)?;
        }
        Ok(())
    }

    fn load(file: &Arc<DataFile>, cache: &NodeCache, tree: &mut Tree) -> Result<()> {
        if file.is_empty()? {
            return Ok(());
        }
        if read_be_u64(file, MARKER_OFFSET)? != CLEAN {
            return Err(Error::NotSafelyClosed);
        }
        let root_idx = read_be_u64(file, ROOT_OFFSET)?;
        if root_idx > 0 {
            let Tree { root, size, cow } = tree;
            *root = Some(Self::read_node(file, cache, size, *cow, root_idx)?);
        }
        // Mark open; the marker returns to clean only through close.
        file.write_at(MARKER_OFFSET, &0u64.to_be_bytes())?;
        file.sync()?;
        debug!("recovered btree root {root_idx}, {} nodes reachable", tree.size);
        Ok(())
    }

    /// Reads the node at `idx` and all of its descendants into skeletons,
    /// seeding the cache with their entry buffers.
    fn read_node(
        file: &DataFile,
        cache: &NodeCache,
        size: &mut u64,
        cow: u64,
        idx: u64,
    ) -> Result<Node> {
        let raw = file.read_at(Node::offset(idx), NODE_SIZE)?;
        if raw.len() != NODE_SIZE {
            return Err(Error::invariant(format!("node {idx} is truncated on disk")));
        }
        let mut children_ids = Vec::new();
        for i in 0..=MAX_ITEMS {
            let mut word = [0u8; 8];
            word.copy_from_slice(&raw[i * 8..(i + 1) * 8]);
            let child = u64::from_be_bytes(word);
            if child == 0 {
                break;
            }
            children_ids.push(child);
        }
        let items = Arc::new(Entries::from_body(&raw[node::NODE_HEAD_LEN..])?);
        cache.lock().add(idx, items);
        let mut skeleton = Node::new(idx, cow);
        for child in children_ids {
            skeleton
                .children
                .push(Self::read_node(file, cache, size, cow, child)?);
        }
        *size += 1;
        Ok(skeleton)
    }
}

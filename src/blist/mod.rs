//! Persistent singly-linked chains of fixed-capacity item arrays.
//!
//! Every chain starts at an allocated head node and grows by appending;
//! items are never reordered or removed. Nodes occupy fixed 256-byte slots
//! addressed by 1-based id, behind a 4096-byte file header holding the
//! clean-shutdown marker. Appends run under the exclusive lock and write
//! every touched node before returning; reads walk the chain under the
//! shared lock through an LRU node cache.

mod list;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::blocks::Position;
use crate::error::{Error, Result};
use crate::file::{DataFile, SyncTask, byte_size, read_be_u64};
use crate::lru::Lru;

use list::{LIST_SIZE, List, MAX_ITEMS};

const HEAD_SIZE: u64 = 4096;
const MARKER_OFFSET: u64 = 0;
const CLEAN: u64 = 1;

const DEFAULT_MAX_CACHE_LISTS: usize = 262_144;
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

pub struct Options {
    pub path: PathBuf,
    /// Cached decoded list nodes; 0 means the default of 262 144 (64 MB).
    pub max_cache_lists: usize,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Options {
        Options {
            path: path.into(),
            max_cache_lists: 0,
        }
    }
}

struct Chain {
    num: u64,
}

pub struct BList {
    chain: RwLock<Chain>,
    cache: Mutex<Lru<u64, List>>,
    file: Arc<DataFile>,
    sync_task: SyncTask,
}

impl BList {
    /// Opens the list file. Fails with [`Error::NotSafelyClosed`] when the
    /// previous instance did not close.
    pub fn open(options: Options) -> Result<BList> {
        let file = Arc::new(DataFile::open(&options.path)?);
        let cache_lists = if options.max_cache_lists == 0 {
            DEFAULT_MAX_CACHE_LISTS
        } else {
            options.max_cache_lists
        };
        let mut chain = Chain { num: 0 };
        Self::load(&file, &mut chain)?;
        debug!(
            "opened blist at {}, caching up to {} lists ({})",
            options.path.display(),
            cache_lists,
            byte_size((cache_lists * LIST_SIZE) as u64),
        );
        let sync_task = SyncTask::spawn("blist", file.clone(), SYNC_INTERVAL)?;
        Ok(BList {
            chain: RwLock::new(chain),
            cache: Mutex::new(Lru::new(cache_lists, None)),
            file,
            sync_task,
        })
    }

    /// Allocates a fresh one-node chain and returns its head id.
    pub fn alloc(&self) -> Result<u64> {
        let mut chain = self.chain.write();
        let list = self.alloc_list(&mut chain)?;
        Ok(list.no())
    }

    /// Appends `items` to the chain headed by `head`, spilling into newly
    /// allocated nodes as tails fill up. Every touched node is written
    /// before the call returns.
    pub fn add(&self, head: u64, items: &[Position]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut chain = self.chain.write();
        let mut work = self.tail(head)?;
        let mut dirty: Vec<List> = Vec::new();
        for &item in items {
            if work.push(item) {
                continue;
            }
            let mut spill = self.alloc_list(&mut chain)?;
            work.set_next(spill.no());
            spill.set_prev(work.no());
            dirty.push(work);
            work = spill;
            if !work.push(item) {
                return Err(Error::invariant("fresh list node rejected an item"));
            }
        }
        dirty.push(work);
        for list in &dirty {
            self.write_list(list)?;
        }
        Ok(())
    }

    /// Returns the items of the chain headed by `head` from `offset`
    /// onward, in append order. An offset equal to the item count yields
    /// an empty vector; a larger one fails with [`Error::OutOfRange`].
    pub fn get(&self, head: u64, offset: u64) -> Result<Vec<Position>> {
        let _chain = self.chain.read();
        let mut list = self.read_list(head)?;
        let mut start = offset;
        while start > list.count() {
            let next = list.next();
            if next == 0 {
                return Err(Error::OutOfRange);
            }
            // Every node but the tail is full.
            start = start
                .checked_sub(MAX_ITEMS as u64)
                .ok_or_else(|| Error::invariant(format!("list node {} is underfull mid-chain", list.no())))?;
            list = self.read_list(next)?;
        }
        let mut items = list.items_from(start as usize);
        loop {
            let next = list.next();
            if next == 0 {
                break;
            }
            list = self.read_list(next)?;
            items.extend(list.items_from(0));
        }
        Ok(items)
    }

    /// Stops the background sync, persists the clean-shutdown marker and
    /// syncs the file.
    pub fn close(self) -> Result<()> {
        let BList {
            chain,
            cache: _,
            file,
            sync_task,
        } = self;
        sync_task.stop();
        file.write_at(MARKER_OFFSET, &CLEAN.to_be_bytes())?;
        file.sync()?;
        debug!("closed blist, {} nodes", chain.into_inner().num);
        Ok(())
    }

    fn load(file: &DataFile, chain: &mut Chain) -> Result<()> {
        let size = file.len()?;
        if size == 0 {
            return Ok(());
        }
        if read_be_u64(file, MARKER_OFFSET)? != CLEAN {
            return Err(Error::NotSafelyClosed);
        }
        chain.num = size.saturating_sub(HEAD_SIZE) / LIST_SIZE as u64;
        // Mark open; the marker returns to clean only through close.
        file.write_at(MARKER_OFFSET, &0u64.to_be_bytes())?;
        file.sync()?;
        debug!("recovered blist, {} nodes", chain.num);
        Ok(())
    }

    fn alloc_list(&self, chain: &mut Chain) -> Result<List> {
        chain.num += 1;
        let list = List::new(chain.num);
        self.write_list(&list)?;
        Ok(list)
    }

    fn tail(&self, head: u64) -> Result<List> {
        let mut list = self.read_list(head)?;
        loop {
            let next = list.next();
            if next == 0 {
                return Ok(list);
            }
            list = self.read_list(next)?;
        }
    }

    fn read_list(&self, no: u64) -> Result<List> {
        if no == 0 {
            return Err(Error::invariant("list id must be positive"));
        }
        if let Some(list) = self.cache.lock().get(&no) {
            return Ok(list.clone());
        }
        trace!("list node {no} not cached, reading from disk");
        let region = self.file.read_region(Self::offset(no), LIST_SIZE as u64)?;
        let list = List::decode(region.bytes())?;
        region.close();
        self.cache.lock().add(no, list.clone());
        Ok(list)
    }

    fn write_list(&self, list: &List) -> Result<()> {
        let raw = list.encode()?;
        self.file.write_at(Self::offset(list.no()), &raw)?;
        self.cache.lock().add(list.no(), list.clone());
        Ok(())
    }

    fn offset(no: u64) -> u64 {
        HEAD_SIZE + (no - 1) * LIST_SIZE as u64
    }
}

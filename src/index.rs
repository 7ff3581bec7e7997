//! The key index: an ordered key map composed with per-key position
//! chains.
//!
//! The B-tree maps each key to the head id of a blist chain holding that
//! key's positions in append order. A write appends to the chain before
//! the key is inserted into the tree, so an interrupted write can leave an
//! orphaned chain but never a key pointing at missing items.

use log::debug;
use parking_lot::RwLock;

use crate::blist::{self, BList};
use crate::blocks::Position;
use crate::btree::{self, BTree};
use crate::error::{Error, Result};

pub struct Indexer {
    btree: BTree,
    blist: BList,
    lock: RwLock<()>,
}

impl Indexer {
    /// Opens both index files. Either file failing to open (including a
    /// missing clean-shutdown marker) fails the whole index.
    pub fn open(tree_options: btree::Options, list_options: blist::Options) -> Result<Indexer> {
        let btree = BTree::open(tree_options)?;
        let blist = match BList::open(list_options) {
            Ok(blist) => blist,
            Err(err) => {
                // Leave the tree reopenable instead of half-open.
                let _ = btree.close();
                return Err(err);
            }
        };
        debug!("index open");
        Ok(Indexer {
            btree,
            blist,
            lock: RwLock::new(()),
        })
    }

    /// Appends `positions` to the key's chain, allocating the chain and
    /// indexing the key on first use.
    pub fn set(&self, key: &[u8], positions: &[Position]) -> Result<()> {
        let _guard = self.lock.write();
        let (head, fresh) = match self.btree.get(key)? {
            Some(value) => (u64::from_be_bytes(value), false),
            None => (self.blist.alloc()?, true),
        };
        // The chain grows before the key points at it.
        self.blist.add(head, positions)?;
        if fresh {
            self.btree.set(key, head.to_be_bytes())?;
        }
        Ok(())
    }

    /// Replays the key's positions from `offset` onward. A key that was
    /// never recorded fails with [`Error::NotFound`].
    pub fn get(&self, key: &[u8], offset: u64) -> Result<Vec<Position>> {
        let _guard = self.lock.read();
        let Some(value) = self.btree.get(key)? else {
            return Err(Error::NotFound);
        };
        self.blist.get(u64::from_be_bytes(value), offset)
    }

    /// Closes both structures, writing their clean-shutdown markers.
    pub fn close(self) -> Result<()> {
        let Indexer {
            btree,
            blist,
            lock: _,
        } = self;
        btree.close()?;
        blist.close()?;
        debug!("index closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pos(i: u64) -> Position {
        Position::new(i, i * 7)
    }

    fn open_at(dir: &tempfile::TempDir) -> Indexer {
        Indexer::open(
            btree::Options::new(dir.path().join("keys.reel")),
            blist::Options::new(dir.path().join("positions.reel")),
        )
        .expect("open indexer")
    }

    #[test]
    fn fresh_index_has_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_at(&dir);
        assert!(matches!(index.get(b"anything", 0), Err(Error::NotFound)));
        index.close().unwrap();
        // A clean close leaves both files reopenable.
        let index = open_at(&dir);
        assert!(matches!(index.get(b"anything", 0), Err(Error::NotFound)));
        index.close().unwrap();
    }

    #[test]
    fn appends_accumulate_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_at(&dir);
        index.set(b"k", &[pos(1), pos(2)]).unwrap();
        index.set(b"k", &[pos(3)]).unwrap();
        assert_eq!(index.get(b"k", 0).unwrap(), vec![pos(1), pos(2), pos(3)]);
        assert_eq!(index.get(b"k", 2).unwrap(), vec![pos(3)]);
        index.close().unwrap();
    }

    #[test]
    fn keys_do_not_share_chains() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_at(&dir);
        index.set(b"a", &[pos(1)]).unwrap();
        index.set(b"b", &[pos(2), pos(3)]).unwrap();
        index.set(b"a", &[pos(4)]).unwrap();
        assert_eq!(index.get(b"a", 0).unwrap(), vec![pos(1), pos(4)]);
        assert_eq!(index.get(b"b", 0).unwrap(), vec![pos(2), pos(3)]);
        index.close().unwrap();
    }

    #[test]
    fn recorded_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_at(&dir);
        for i in 0u64..64 {
            index.set(&i.to_be_bytes(), &[pos(i)]).unwrap();
        }
        index.close().unwrap();

        let index = open_at(&dir);
        for i in 0u64..64 {
            assert_eq!(index.get(&i.to_be_bytes(), 0).unwrap(), vec![pos(i)]);
        }
        index.close().unwrap();
    }

    #[test]
    fn crash_before_close_blocks_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_at(&dir);
        index.set(b"k", &[pos(1)]).unwrap();
        drop(index);
        match Indexer::open(
            btree::Options::new(dir.path().join("keys.reel")),
            blist::Options::new(dir.path().join("positions.reel")),
        ) {
            Err(Error::NotSafelyClosed) => {}
            other => panic!("expected NotSafelyClosed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(open_at(&dir));
        let mut workers = Vec::new();
        for worker in 0u64..4 {
            let index = index.clone();
            workers.push(std::thread::spawn(move || {
                let key = worker.to_be_bytes();
                for i in 0..50u64 {
                    index.set(&key, &[Position::new(worker, i)]).unwrap();
                    // Readers may see items appended after their lookup,
                    // never fewer than they had observed.
                    let items = index.get(&key, 0).unwrap();
                    assert!(items.len() as u64 >= i + 1);
                    for (n, item) in items.iter().enumerate() {
                        assert_eq!(item.block_no(), worker);
                        assert_eq!(item.record_no(), n as u64);
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        for worker in 0u64..4 {
            assert_eq!(index.get(&worker.to_be_bytes(), 0).unwrap().len(), 50);
        }
        match Arc::try_unwrap(index) {
            Ok(index) => index.close().unwrap(),
            Err(_) => panic!("worker still holds the index"),
        }
    }
}

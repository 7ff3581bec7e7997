//! Append-oriented embedded key-value index.
//!
//! Each key names a growable sequence of 16-byte [`Position`] records. An
//! [`Indexer`] composes two persistent structures: a copy-on-write B-tree
//! mapping keys to chain ids, and a singly-linked chain store ("blist")
//! holding each key's positions in append order. Both live in their own
//! file with a clean-shutdown marker, an LRU node cache and a background
//! sync thread; a file left behind by a crash refuses to open.
//!
//! The [`blocks`] module carries the pure block/segment codec used by the
//! surrounding value store to frame variable-length payloads.

#![deny(unsafe_code)]

pub mod blist;
pub mod blocks;
pub mod btree;
pub mod error;
pub mod file;
pub mod index;
pub mod lru;

pub use blocks::{Position, Segment};
pub use error::{Error, Result};
pub use index::Indexer;

//! Crate-wide error type.
//!
//! Errors are cloneable so that a coalesced read can hand the same failure
//! to every waiter; io sources are therefore held behind an [`Arc`].

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The file's shutdown marker was not set on open: the previous process
    /// exited without closing the structure.
    #[error("file was not safely closed")]
    NotSafelyClosed,

    /// Keys are limited to 48 bytes.
    #[error("key is too large: {0} bytes, limit is 48")]
    KeyTooLarge(usize),

    /// A list read walked past the tail of the chain.
    #[error("offset is out of range")]
    OutOfRange,

    /// The key has no list.
    #[error("key was not recorded")]
    NotFound,

    /// A segment block carried a sequence number other than its ordinal.
    #[error("incomplete segment: found block {found} where block {expected} was expected")]
    IncompleteSegment { expected: u16, found: u16 },

    /// The requested range lies beyond the end of the file.
    #[error("file has no region [{offset}, {offset}+{len})")]
    NoSuchRegion { offset: u64, len: u64 },

    /// The requested capacity does not fit the platform's address space.
    #[error("region capacity {0} is too large")]
    CapacityTooLarge(u64),

    /// An operating-system failure without a byte range, e.g. open or sync.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        source: Arc<io::Error>,
    },

    /// An operating-system failure at a known byte range.
    #[error("{op} at offset {offset} (len {len}) failed: {source}")]
    IoAt {
        op: &'static str,
        offset: u64,
        len: u64,
        source: Arc<io::Error>,
    },

    /// A broken internal assumption. The structure may be closed but must
    /// not be trusted further.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Error::Io {
            op,
            source: Arc::new(source),
        }
    }

    pub(crate) fn io_at(op: &'static str, offset: u64, len: u64, source: io::Error) -> Self {
        Error::IoAt {
            op,
            offset,
            len,
            source: Arc::new(source),
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant(message.into())
    }
}

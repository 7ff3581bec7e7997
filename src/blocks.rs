//! Fixed-capacity block codec.
//!
//! A payload is packed into a run of fixed-size blocks called a segment.
//! Every block starts with an 8-byte header (payload length, 1-based block
//! number within the segment, segment size in blocks) and carries its slice
//! of the payload right-justified in the remaining space. A segment is
//! self-describing: the segment size is read back from the first block.
//!
//! The codec performs no I/O.

use std::fmt;
use std::str::FromStr;

use deku::prelude::*;
use itertools::Itertools;
use thiserror::Error;

use crate::error::Error;

/// Bytes reserved at the front of every block.
pub const BLOCK_HEADER_LEN: usize = 8;

/// Width of one position record.
pub const POSITION_LEN: usize = 16;

/// Per-block header. The payload length occupies four bytes on disk but
/// only the low 16 bits are meaningful: a block never holds more than
/// `capacity - 8 <= 65535` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct BlockHeader {
    payload_len: u32,
    block_no: u16,
    segment_len: u16,
}

impl BlockHeader {
    fn parse(block: &[u8]) -> crate::error::Result<BlockHeader> {
        let (_rest, header) = BlockHeader::from_bytes((&block[..BLOCK_HEADER_LEN], 0))
            .map_err(|err| Error::invariant(format!("block header: {err}")))?;
        Ok(header)
    }
}

/// A run of blocks jointly holding one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment(Vec<u8>);

impl Segment {
    /// Packs `payload` into blocks of `block_capacity` bytes each.
    ///
    /// The capacity must leave room for the header, and both the per-block
    /// payload share and the block count must fit 16 bits.
    pub fn new(payload: &[u8], block_capacity: usize) -> crate::error::Result<Segment> {
        if block_capacity <= BLOCK_HEADER_LEN {
            return Err(Error::invariant(format!(
                "block capacity {block_capacity} leaves no payload space"
            )));
        }
        let room = block_capacity - BLOCK_HEADER_LEN;
        if room > u16::MAX as usize {
            return Err(Error::invariant(format!(
                "block capacity {block_capacity} exceeds the 16-bit payload length"
            )));
        }
        let count = payload.len().div_ceil(room);
        if count > u16::MAX as usize {
            return Err(Error::invariant(format!(
                "payload of {} bytes exceeds the 16-bit block count",
                payload.len()
            )));
        }
        let mut buf = vec![0u8; block_capacity * count];
        for (i, (chunk, block)) in payload
            .chunks(room)
            .zip_eq(buf.chunks_mut(block_capacity))
            .enumerate()
        {
            let header = BlockHeader {
                payload_len: chunk.len() as u32,
                block_no: (i + 1) as u16,
                segment_len: count as u16,
            };
            let head = header
                .to_bytes()
                .map_err(|err| Error::invariant(format!("block header: {err}")))?;
            block[..BLOCK_HEADER_LEN].copy_from_slice(&head);
            block[block_capacity - chunk.len()..].copy_from_slice(chunk);
        }
        Ok(Segment(buf))
    }

    /// Wraps raw bytes previously produced by [`Segment::new`].
    pub fn from_bytes(raw: Vec<u8>) -> Segment {
        Segment(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Segment size in blocks, as recorded in the first block.
    pub fn blocks(&self) -> crate::error::Result<usize> {
        if self.0.len() < BLOCK_HEADER_LEN {
            return Err(Error::invariant("segment is shorter than one header"));
        }
        Ok(BlockHeader::parse(&self.0)?.segment_len as usize)
    }

    /// Reassembles the payload, walking blocks `1..=len` and checking that
    /// every block carries its own ordinal.
    pub fn payload(&self) -> crate::error::Result<Vec<u8>> {
        let count = self.blocks()?;
        if count == 0 || self.0.len() % count != 0 {
            return Err(Error::invariant(format!(
                "segment of {} bytes cannot hold {count} blocks",
                self.0.len()
            )));
        }
        let capacity = self.0.len() / count;
        if capacity <= BLOCK_HEADER_LEN {
            return Err(Error::invariant(format!(
                "segment declares {count} blocks of {capacity} bytes each"
            )));
        }
        let mut payload = Vec::with_capacity(self.0.len());
        for (i, block) in (1..=count as u16).zip_eq(self.0.chunks(capacity)) {
            let header = BlockHeader::parse(block)?;
            if header.block_no != i {
                return Err(Error::IncompleteSegment {
                    expected: i,
                    found: header.block_no,
                });
            }
            let len = header.payload_len as usize;
            if len > capacity - BLOCK_HEADER_LEN {
                return Err(Error::invariant(format!(
                    "block {i} declares {len} payload bytes in a {capacity}-byte block"
                )));
            }
            payload.extend_from_slice(&block[capacity - len..]);
        }
        Ok(payload)
    }
}

/// A 16-byte pointer to a recorded value: big-endian block number at
/// `[0..8)`, big-endian record number at `[8..16)`. The index itself never
/// inspects the contents; positions are appended and replayed as opaque
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position([u8; POSITION_LEN]);

impl Position {
    pub fn new(block_no: u64, record_no: u64) -> Position {
        let mut buf = [0u8; POSITION_LEN];
        buf[0..8].copy_from_slice(&block_no.to_be_bytes());
        buf[8..16].copy_from_slice(&record_no.to_be_bytes());
        Position(buf)
    }

    pub fn from_bytes(raw: [u8; POSITION_LEN]) -> Position {
        Position(raw)
    }

    pub fn block_no(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[0..8]);
        u64::from_be_bytes(word)
    }

    pub fn record_no(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[8..16]);
        u64::from_be_bytes(word)
    }

    pub fn as_bytes(&self) -> &[u8; POSITION_LEN] {
        &self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_no(), self.record_no())
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.block_no(), self.record_no()).cmp(&(other.block_no(), other.record_no()))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Failure to parse a `"block:record"` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid position: {0}")]
pub struct ParsePositionError(String);

impl FromStr for Position {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> std::result::Result<Position, ParsePositionError> {
        let Some((block, record)) = s.split_once(':') else {
            return Err(ParsePositionError(s.to_string()));
        };
        let block_no = block
            .parse::<u64>()
            .map_err(|_| ParsePositionError(s.to_string()))?;
        let record_no = record
            .parse::<u64>()
            .map_err(|_| ParsePositionError(s.to_string()))?;
        Ok(Position::new(block_no, record_no))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn single_block_layout() {
        let payload = b"2024-01-02T03:04:05Z";
        let segment = Segment::new(payload, 32).unwrap();
        let raw = segment.as_bytes();
        assert_eq!(raw.len(), 32);
        // Little-endian header: 20 payload bytes, block 1 of 1.
        assert_eq!(&raw[0..4], &[20, 0, 0, 0]);
        assert_eq!(&raw[4..6], &[1, 0]);
        assert_eq!(&raw[6..8], &[1, 0]);
        // Zero padding, then the payload right-justified.
        assert_eq!(&raw[8..12], &[0, 0, 0, 0]);
        assert_eq!(&raw[12..32], payload);
        assert_eq!(segment.payload().unwrap(), payload);
    }

    #[test]
    fn multi_block_round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let segment = Segment::new(&payload, 32).unwrap();
        assert_eq!(segment.blocks().unwrap(), 256usize.div_ceil(24));
        assert_eq!(segment.payload().unwrap(), payload);
    }

    #[test]
    fn random_round_trips() {
        let mut rng = rand::thread_rng();
        for capacity in [16, 32, 64, 4096] {
            for _ in 0..32 {
                let len = rng.gen_range(1..4096);
                let mut payload = vec![0u8; len];
                rng.fill_bytes(&mut payload);
                let segment = Segment::new(&payload, capacity).unwrap();
                assert_eq!(segment.as_bytes().len() % capacity, 0);
                assert_eq!(segment.payload().unwrap(), payload, "capacity {capacity}");
            }
        }
    }

    #[test]
    fn empty_payload_is_an_empty_segment() {
        let segment = Segment::new(&[], 32).unwrap();
        assert!(segment.as_bytes().is_empty());
        assert!(segment.payload().is_err());
    }

    #[test]
    fn mismatched_block_number_fails() {
        let payload = vec![7u8; 100];
        let segment = Segment::new(&payload, 32).unwrap();
        let mut raw = segment.as_bytes().to_vec();
        // Third block claims to be block nine.
        raw[2 * 32 + 4] = 9;
        let err = Segment::from_bytes(raw).payload().unwrap_err();
        match err {
            Error::IncompleteSegment { expected, found } => {
                assert_eq!(expected, 3);
                assert_eq!(found, 9);
            }
            other => panic!("expected IncompleteSegment, got {other}"),
        }
    }

    #[test]
    fn undersized_capacity_is_rejected() {
        assert!(Segment::new(b"x", 8).is_err());
    }

    #[test]
    fn position_round_trip() {
        let pos = Position::new(3, 1201);
        assert_eq!(pos.block_no(), 3);
        assert_eq!(pos.record_no(), 1201);
        assert_eq!(pos.to_string(), "3:1201");
        assert_eq!("3:1201".parse::<Position>().unwrap(), pos);
        assert!("3".parse::<Position>().is_err());
        assert!("a:b".parse::<Position>().is_err());
    }

    #[test]
    fn position_orders_by_block_then_record() {
        assert!(Position::new(1, 9) < Position::new(2, 0));
        assert!(Position::new(2, 1) < Position::new(2, 2));
    }
}

//! Offset-addressed data files.
//!
//! [`DataFile`] wraps an on-disk file behind a reader-writer lock: reads
//! and region mappings run under the shared mode, writes, syncs and close
//! under the exclusive mode. Identical concurrent [`DataFile::read_region`]
//! calls are coalesced through a single-flight barrier so one underlying
//! read serves every caller.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, OnceLock, mpsc};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, Result};

/// A contiguous range of file bytes with explicit lifetime.
///
/// Page-aligned ranges are served as private read-only memory maps, other
/// ranges as heap copies. Handles are cheaply cloneable; a mapped range is
/// unmapped when the last handle goes away. Callers must not hold a mapped
/// region past the owning file's close.
#[derive(Clone)]
pub struct Region {
    kind: Arc<RegionKind>,
}

enum RegionKind {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl Region {
    fn mapped(map: Mmap) -> Region {
        Region {
            kind: Arc::new(RegionKind::Mapped(map)),
        }
    }

    fn heap(data: Vec<u8>) -> Region {
        Region {
            kind: Arc::new(RegionKind::Heap(data)),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self.kind.as_ref() {
            RegionKind::Mapped(map) => map,
            RegionKind::Heap(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.kind.as_ref(), RegionKind::Mapped(_))
    }

    /// Releases this handle. The backing map or buffer is freed once every
    /// clone has been closed or dropped.
    pub fn close(self) {}
}

#[derive(Default)]
struct Flight {
    done: Mutex<Option<Result<Region>>>,
    arrived: Condvar,
}

/// An offset-addressed file shared by the readers and the writer of one
/// on-disk structure.
pub struct DataFile {
    file: RwLock<fs::File>,
    flights: Mutex<HashMap<(u64, u64), Arc<Flight>>>,
}

impl DataFile {
    /// Opens `path` read-write, creating the file and its parent
    /// directories as needed. A freshly created file is made durable by
    /// syncing its directory.
    pub fn open(path: impl AsRef<Path>) -> Result<DataFile> {
        let path = path.as_ref();
        let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|err| Error::io("create data directory", err))?;
            }
        }
        let fresh = !path.exists();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| Error::io("open data file", err))?;
        if fresh {
            if let Some(dir) = parent {
                sync_dir(dir)?;
            }
        }
        debug!("opened data file {}", path.display());
        Ok(DataFile {
            file: RwLock::new(file),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Current file size in bytes.
    pub fn len(&self) -> Result<u64> {
        let file = self.file.read();
        let meta = file
            .metadata()
            .map_err(|err| Error::io("stat data file", err))?;
        Ok(meta.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads up to `len` bytes starting at `offset`, looping until the
    /// buffer is full or the end of the file cuts the last read short.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.file.read();
        read_full(&file, offset, len).map_err(|err| Error::io_at("read", offset, len as u64, err))
    }

    /// Returns a region handle for `[offset, offset + len)`.
    ///
    /// Concurrent callers asking for the identical range share one
    /// underlying read: the first caller performs it and every waiter
    /// receives a clone of the resulting handle (or of the failure). The
    /// range must lie entirely inside the file.
    pub fn read_region(&self, offset: u64, len: u64) -> Result<Region> {
        let key = (offset, len);
        let (flight, leader) = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    flights.insert(key, flight.clone());
                    (flight, true)
                }
            }
        };
        if leader {
            let result = self.read_region_inner(offset, len);
            *flight.done.lock() = Some(result.clone());
            flight.arrived.notify_all();
            // Forget the key no matter how the read went; the next caller
            // starts a fresh flight.
            self.flights.lock().remove(&key);
            result
        } else {
            let mut done = flight.done.lock();
            while done.is_none() {
                flight.arrived.wait(&mut done);
            }
            match done.as_ref() {
                Some(result) => result.clone(),
                None => Err(Error::invariant("read barrier woke without a result")),
            }
        }
    }

    fn read_region_inner(&self, offset: u64, len: u64) -> Result<Region> {
        if len > isize::MAX as u64 {
            return Err(Error::CapacityTooLarge(len));
        }
        if len == 0 {
            return Ok(Region::heap(Vec::new()));
        }
        let file = self.file.read();
        let size = file
            .metadata()
            .map_err(|err| Error::io("stat data file", err))?
            .len();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(Error::NoSuchRegion { offset, len });
        }
        if offset % page_size() == 0 {
            Ok(Region::mapped(map_region(&file, offset, len as usize)?))
        } else {
            let data = read_full(&file, offset, len as usize)
                .map_err(|err| Error::io_at("read region", offset, len, err))?;
            Ok(Region::heap(data))
        }
    }

    /// Writes all of `data` at `offset` under the exclusive lock.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file.write();
        file.write_all_at(data, offset)
            .map_err(|err| Error::io_at("write", offset, data.len() as u64, err))
    }

    /// Flushes file content and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.write();
        file.sync_all().map_err(|err| Error::io("sync data file", err))
    }
}

fn read_full(file: &fs::File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[allow(unsafe_code)]
fn map_region(file: &fs::File, offset: u64, len: usize) -> Result<Mmap> {
    // SAFETY: the mapping is private and read-only, and the file is never
    // truncated while a structure holds it open.
    unsafe { MmapOptions::new().offset(offset).len(len).map_copy_read_only(file) }
        .map_err(|err| Error::io_at("map region", offset, len as u64, err))
}

fn sync_dir(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir).map_err(|err| Error::io("open data directory", err))?;
    handle
        .sync_all()
        .map_err(|err| Error::io("sync data directory", err))
}

#[allow(unsafe_code)]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as u64 } else { 4096 }
    })
}

/// Periodic background sync for one data file.
///
/// A single thread flushes the file at every interval until stopped; sync
/// failures are logged and retried at the next tick.
pub(crate) struct SyncTask {
    stop: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SyncTask {
    pub(crate) fn spawn(
        name: &'static str,
        file: Arc<DataFile>,
        interval: Duration,
    ) -> Result<SyncTask> {
        let (stop, ticks) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("{name}-sync"))
            .spawn(move || {
                loop {
                    match ticks.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Err(err) = file.sync() {
                                warn!("{name}: background sync failed: {err}");
                            }
                        }
                        _ => break,
                    }
                }
            })
            .map_err(|err| Error::io("spawn sync thread", err))?;
        Ok(SyncTask {
            stop,
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to exit.
    pub(crate) fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Reads one big-endian word from a file header.
pub(crate) fn read_be_u64(file: &DataFile, offset: u64) -> Result<u64> {
    let raw = file.read_at(offset, 8)?;
    if raw.len() != 8 {
        return Err(Error::invariant(format!(
            "header word at offset {offset} is truncated"
        )));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw);
    Ok(u64::from_be_bytes(word))
}

/// Renders a byte count with a binary unit suffix for log lines.
pub(crate) fn byte_size(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> (tempfile::TempDir, DataFile) {
        let dir = tempfile::tempdir().expect("scratch dir");
        let file = DataFile::open(dir.path().join(name)).expect("open data file");
        (dir, file)
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/data.reel");
        let file = DataFile::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(file.len().unwrap(), 0);
    }

    #[test]
    fn read_at_stops_at_end_of_file() {
        let (_dir, file) = scratch("data.reel");
        file.write_at(0, b"0123456789").unwrap();
        assert_eq!(file.read_at(0, 10).unwrap(), b"0123456789");
        assert_eq!(file.read_at(4, 3).unwrap(), b"456");
        // Partial tail read.
        assert_eq!(file.read_at(8, 16).unwrap(), b"89");
        // Entirely past the end.
        assert!(file.read_at(32, 4).unwrap().is_empty());
    }

    #[test]
    fn aligned_regions_are_mapped() {
        let (_dir, file) = scratch("data.reel");
        let page = page_size();
        file.write_at(0, &vec![7u8; 2 * page as usize]).unwrap();
        let mapped = file.read_region(page, 64).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.bytes(), &[7u8; 64]);
        let heap = file.read_region(page + 1, 64).unwrap();
        assert!(!heap.is_mapped());
        assert_eq!(heap.bytes(), &[7u8; 64]);
        mapped.close();
        heap.close();
    }

    #[test]
    fn missing_region_is_reported() {
        let (_dir, file) = scratch("data.reel");
        file.write_at(0, &[1, 2, 3, 4]).unwrap();
        let err = file.read_region(0, 5).map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::NoSuchRegion { offset: 0, len: 5 }));
    }

    #[test]
    fn concurrent_region_reads_agree() {
        let (_dir, file) = scratch("data.reel");
        let page = page_size() as usize;
        let pattern: Vec<u8> = (0..4 * page).map(|i| (i % 251) as u8).collect();
        file.write_at(0, &pattern).unwrap();
        let file = Arc::new(file);
        let mut workers = Vec::new();
        for _ in 0..8 {
            let file = file.clone();
            let expect = pattern[page..2 * page].to_vec();
            workers.push(std::thread::spawn(move || {
                for _ in 0..64 {
                    let region = file.read_region(page as u64, page as u64).unwrap();
                    assert_eq!(region.bytes(), expect.as_slice());
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn byte_size_renders_binary_units() {
        assert_eq!(byte_size(512), "512B");
        assert_eq!(byte_size(2048), "2.0KB");
        assert_eq!(byte_size(64 * 1024 * 1024), "64.0MB");
    }
}

//! Resident file (C5): composes the range-lock manager (C3) and segment
//! index (C4), plus cached POSIX attributes, into the public read/write/
//! append/truncate/allocate/unload contract.

use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{EchoFsError, Result};
use crate::index::SegmentIndex;
use crate::pool::PmemPool;
use crate::rangelock::{LockKind, RangeLockManager};
use crate::segment::Segment;

/// Whether a resident file's contents are written back to the backing
/// store on unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Persistent,
    Temporary,
}

/// Cached `struct stat`-equivalent fields. Owner/mode/times are kept
/// in-memory only and persisted via writeback, never separately.
#[derive(Debug, Clone)]
pub struct Attr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub ctime: u64,
    pub atime: u64,
    pub nlink: u32,
}

impl Attr {
    fn new(mode: u32) -> Self {
        let now = now_secs();
        Self {
            mode,
            uid: 0,
            gid: 0,
            mtime: now,
            ctime: now,
            atime: now,
            nlink: 1,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A file staged into the PMEM tier: the composition of a segment index,
/// a range-lock manager, and cached attributes.
pub struct ResidentFile {
    pool: Arc<PmemPool>,
    kind: FileKind,
    index: SegmentIndex,
    locks: RangeLockManager,
    used_offset: AtomicU64,
    attr: Mutex<Attr>,
}

impl ResidentFile {
    pub fn new_empty(pool: Arc<PmemPool>, kind: FileKind, mode: u32) -> Self {
        Self {
            pool,
            kind,
            index: SegmentIndex::new(),
            locks: RangeLockManager::new(),
            used_offset: AtomicU64::new(0),
            attr: Mutex::new(Attr::new(mode)),
        }
    }

    /// Stages `src` (opened at offset 0) into freshly-allocated segments,
    /// one per slot-size chunk, used by bulk `load`.
    pub fn load_from_file(
        pool: Arc<PmemPool>,
        kind: FileKind,
        mode: u32,
        src: &mut File,
        total_len: u64,
    ) -> Result<Self> {
        let file = Self::new_empty(pool.clone(), kind, mode);
        let slot_size = pool.slot_size();
        let mut remaining = total_len;
        let mut offset = 0u64;
        while remaining > 0 {
            // Every segment is a full slot, even the tail one: the short
            // read at end-of-file is handled by `Segment::new_from_file`
            // itself, which zero-fills whatever the read didn't cover and
            // records `used_bytes` accordingly.
            let seg = Segment::new_from_file(pool.clone(), offset, slot_size, src)?;
            remaining -= seg.used_bytes.min(remaining);
            offset += slot_size;
            file.index.insert_back(seg);
        }
        file.used_offset.store(total_len, Ordering::SeqCst);
        {
            let mut attr = file.attr.lock().unwrap();
            attr.mtime = now_secs();
        }
        Ok(file)
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn used_offset(&self) -> u64 {
        self.used_offset.load(Ordering::SeqCst)
    }

    pub fn alloc_offset(&self) -> u64 {
        self.index.alloc_offset()
    }

    pub fn attr(&self) -> Attr {
        self.attr.lock().unwrap().clone()
    }

    pub fn set_mode(&self, mode: u32) {
        let mut attr = self.attr.lock().unwrap();
        attr.mode = mode;
        attr.ctime = now_secs();
    }

    pub fn set_owner(&self, uid: u32, gid: u32) {
        let mut attr = self.attr.lock().unwrap();
        attr.uid = uid;
        attr.gid = gid;
        attr.ctime = now_secs();
    }

    /// Extends allocation to cover `[alloc_offset(), write_end)`. The
    /// region preceding `write_start` (the hole skipped by a write that
    /// starts past the current high-water mark) is filled with explicit
    /// gap segments; the region `[write_start, write_end)` — the part
    /// about to receive real data — is filled with freshly allocated,
    /// zero-filled segments.
    fn extend_allocation(&self, write_start: u64, write_end: u64) -> Result<()> {
        let mut cursor = self.index.alloc_offset();
        if write_end <= cursor {
            return Ok(());
        }
        let slot_size = self.pool.slot_size();
        let gap_end = write_start.min(write_end).max(cursor);
        while cursor < gap_end {
            let len = (gap_end - cursor).min(slot_size);
            self.index.insert_back(Segment::new_gap(cursor, len));
            cursor += len;
        }
        while cursor < write_end {
            let len = (write_end - cursor).min(slot_size);
            let seg = Segment::new_empty(self.pool.clone(), cursor, len)?;
            self.index.insert_back(seg);
            cursor += len;
        }
        Ok(())
    }

    /// Reads up to `len` bytes starting at `off` into `dst`, clamped to
    /// the current EOF. Returns the number of bytes produced.
    pub fn read(&self, off: u64, len: u64, dst: &mut [u8]) -> u64 {
        let eof = self.used_offset();
        let clamped_end = (off + len).min(eof);
        if off >= clamped_end {
            return 0;
        }
        let n = clamped_end - off;

        let handle = self.locks.lock(off, off + n, LockKind::Reader);
        self.index.scan(off, off + n, |slices| {
                for slice in slices {
                    let out_start = (slice.segment.file_offset + slice.seg_local_start - off) as usize;
                    let out = &mut dst[out_start..out_start + slice.seg_local_len as usize];
                    if slice.segment.is_gap() {
                        out.fill(0);
                        continue;
                    }
                    let real = slice
                        .seg_local_len
                        .min(slice.segment.used_bytes.saturating_sub(slice.seg_local_start));
                    if real > 0 {
                        slice.segment.read_at(slice.seg_local_start, &mut out[..real as usize]);
                    }
                    if (real as usize) < out.len() {
                        out[real as usize..].fill(0);
                    }
                }
        });
        self.locks.unlock(handle);

        {
            let mut attr = self.attr.lock().unwrap();
            attr.atime = now_secs();
        }
        n
    }

    /// Copies `src` into the index starting at `off`, promoting gap
    /// segments as it goes. Walks segment-by-segment with
    /// `with_segment_mut` rather than `scan`, so each step takes and
    /// releases its own exclusive index access instead of nesting a
    /// mutable borrow inside `scan`'s shared one.
    fn copy_in(&self, off: u64, src: &[u8]) {
        let mut cursor = off;
        let end = off + src.len() as u64;
        while cursor < end {
            let advance = self.index.with_segment_mut(cursor, |seg| {
                    let seg = seg.expect("copy_in: no segment covers offset after extend_allocation");
                    if seg.is_gap() {
                        seg.promote(self.pool.clone()).expect("pool exhausted mid-write");
                    }
                    let local = cursor - seg.file_offset;
                    let n = (seg.logical_size - local).min(end - cursor);
                    let src_start = (cursor - off) as usize;
                    seg.write_at(local, &src[src_start..src_start + n as usize]);
                    seg.drain();
                    n
            });
            cursor += advance;
        }
    }

    /// Writes `src` at `off`, extending allocation and EOF as needed.
    pub fn write(&self, off: u64, src: &[u8]) -> Result<u64> {
        let len = src.len() as u64;
        if len == 0 {
            return Ok(0);
        }
        let end = off + len;

        let handle = self.locks.lock(off, end, LockKind::Writer);
        self.extend_allocation(off, end)?;
        self.copy_in(off, src);
        self.locks.unlock(handle);

        self.used_offset.fetch_max(end, Ordering::SeqCst);
        {
            let mut attr = self.attr.lock().unwrap();
            attr.mtime = now_secs();
            attr.ctime = attr.mtime;
        }
        Ok(len)
    }

    /// Appends `src` at the current EOF, atomic against concurrent
    /// appenders.
    pub fn append(&self, src: &[u8]) -> Result<u64> {
        let len = src.len() as u64;
        loop {
            let off = self.used_offset();
            let handle = self.locks.lock(off, off + len, LockKind::Writer);
            if self.used_offset() != off {
                self.locks.unlock(handle);
                continue;
            }
            self.extend_allocation(off, off + len)?;
            self.copy_in(off, src);
            self.locks.unlock(handle);
            self.used_offset.fetch_max(off + len, Ordering::SeqCst);
            {
                let mut attr = self.attr.lock().unwrap();
                attr.mtime = now_secs();
                attr.ctime = attr.mtime;
            }
            return Ok(len);
        }
    }

    /// Shrinks or grows the file to `new_size`.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let eof = self.used_offset();
        let lock_start = new_size.min(eof);
        let lock_end = new_size.max(eof).max(lock_start + 1);
        let handle = self.locks.lock(lock_start, lock_end, LockKind::Writer);

        if new_size < self.index.alloc_offset() {
            self.index.truncate(new_size, &self.pool);
        } else if new_size > self.index.alloc_offset() {
            // Pure growth with no data to place: the whole extension is a
            // hole, zero-filled by construction.
            self.extend_allocation(new_size, new_size)?;
        }
        self.used_offset.store(new_size, Ordering::SeqCst);

        self.locks.unlock(handle);
        {
            let mut attr = self.attr.lock().unwrap();
            attr.mtime = now_secs();
            attr.ctime = attr.mtime;
        }
        Ok(())
    }

    /// Ensures segments exist covering `[off, off+len)` without changing
    /// `used_offset`.
    pub fn allocate(&self, off: u64, len: u64) -> Result<()> {
        let end = off + len;
        let handle = self.locks.lock(off, end, LockKind::Writer);
        self.extend_allocation(off, end)?;
        self.locks.unlock(handle);
        Ok(())
    }

    /// Writes the live byte range `[0, used_offset)` to `dst_path`.
    /// Returns an error if the file is [`FileKind::Temporary`].
    pub fn unload(&self, dst_path: &Path) -> Result<()> {
        if self.kind == FileKind::Temporary {
            return Err(EchoFsError::invalid_arguments(
                    "cannot unload a temporary resident file",
            ));
        }
        let eof = self.used_offset();
        let handle = self.locks.lock(0, eof.max(1), LockKind::Reader);

        let result = (|| -> Result<()> {
                let mut out = File::create(dst_path).map_err(|e| EchoFsError::Internal {
                        message: format!("creating {}: {e}", dst_path.display()),
                })?;
                self.index.scan(0, eof, |slices| -> Result<()> {
                        for slice in slices {
                            if slice.segment.is_gap() {
                                let zeros = vec![0u8; slice.seg_local_len as usize];
                                out.write_all(&zeros).map_err(|e| EchoFsError::Internal {
                                        message: format!("writing {}: {e}", dst_path.display()),
                                })?;
                                continue;
                            }
                            let real = slice
                                .seg_local_len
                                .min(slice.segment.used_bytes.saturating_sub(slice.seg_local_start));
                            let mut buf = vec![0u8; real as usize];
                            slice.segment.read_at(slice.seg_local_start, &mut buf);
                            out.write_all(&buf).map_err(|e| EchoFsError::Internal {
                                    message: format!("writing {}: {e}", dst_path.display()),
                            })?;
                            if real < slice.seg_local_len {
                                let zeros = vec![0u8; (slice.seg_local_len - real) as usize];
                                out.write_all(&zeros).map_err(|e| EchoFsError::Internal {
                                        message: format!("writing {}: {e}", dst_path.display()),
                                })?;
                            }
                        }
                        Ok(())
                })
        })();

        self.locks.unlock(handle);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_SLOT_SIZE;

    fn pool(slots: usize) -> Arc<PmemPool> {
        Arc::new(PmemPool::open(None, slots as u64 * MIN_SLOT_SIZE, MIN_SLOT_SIZE).unwrap())
    }

    #[test]
    fn write_then_read_roundtrip() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"HELLO").unwrap();
        let mut buf = [0u8; 5];
        let n = f.read(0, 5, &mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"HELLO");
        assert_eq!(f.used_offset(), 5);
    }

    #[test]
    fn write_creating_hole_reads_as_zeros() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"A").unwrap();
        f.write(10, b"B").unwrap();
        let mut buf = [0xFFu8; 11];
        let n = f.read(0, 11, &mut buf);
        assert_eq!(n, 11);
        assert_eq!(buf[0], b'A');
        assert_eq!(&buf[1..10], &[0u8; 9]);
        assert_eq!(buf[10], b'B');
    }

    #[test]
    fn read_entirely_past_eof_returns_zero_bytes() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"hi").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(f.read(100, 4, &mut buf), 0);
    }

    #[test]
    fn read_straddling_eof_returns_only_in_range_bytes() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"hello").unwrap();
        let mut buf = [0u8; 10];
        let n = f.read(3, 10, &mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"lo");
    }

    #[test]
    fn append_is_atomic_against_concurrent_appenders() {
        let f = Arc::new(ResidentFile::new_empty(pool(16), FileKind::Persistent, 0o644));
        let mut handles = vec![];
        for _ in 0..8 {
            let f = f.clone();
            handles.push(std::thread::spawn(move || {
                        f.append(b"xx").unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(f.used_offset(), 16);
    }

    #[test]
    fn truncate_shrink_then_grow_zero_fills() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"HELLOWORLD").unwrap();
        f.truncate(5).unwrap();
        assert_eq!(f.used_offset(), 5);
        f.truncate(8).unwrap();
        let mut buf = [0xAAu8; 8];
        let n = f.read(0, 8, &mut buf);
        assert_eq!(n, 8);
        assert_eq!(&buf[..5], b"HELLO");
        assert_eq!(&buf[5..], &[0u8; 3]);
    }

    #[test]
    fn truncate_is_idempotent() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"HELLO").unwrap();
        f.truncate(3).unwrap();
        let after_first = f.used_offset();
        f.truncate(3).unwrap();
        assert_eq!(f.used_offset(), after_first);
    }

    #[test]
    fn unload_writes_live_range_to_backing_store() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644);
        f.write(0, b"HELLO").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out_a");
        f.unload(&dst).unwrap();
        let contents = std::fs::read(&dst).unwrap();
        assert_eq!(contents, b"HELLO");
    }

    #[test]
    fn unload_of_temporary_file_errors_and_creates_nothing() {
        let f = ResidentFile::new_empty(pool(4), FileKind::Temporary, 0o644);
        f.write(0, b"HELLO").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out_a");
        assert!(f.unload(&dst).is_err());
        assert!(!dst.exists());
    }

    #[test]
    fn two_threads_disjoint_writes_commute_cleanly() {
        let f = Arc::new(ResidentFile::new_empty(pool(4), FileKind::Persistent, 0o644));
        f.truncate(200).unwrap();

        let f1 = f.clone();
        let t1 = std::thread::spawn(move || f1.write(0, &[b'a'; 100]).unwrap());
        let f2 = f.clone();
        let t2 = std::thread::spawn(move || f2.write(50, &[b'b'; 100]).unwrap());
        t1.join().unwrap();
        t2.join().unwrap();

        let mut buf = [0u8; 200];
        f.read(0, 200, &mut buf);
        assert!(buf[0..50].iter().all(|&b| b == b'a'));
        assert!(buf[100..150].iter().all(|&b| b == b'b'));
        let overlap = &buf[50..100];
        assert!(overlap.iter().all(|&b| b == b'a') || overlap.iter().all(|&b| b == b'b'));
    }
}

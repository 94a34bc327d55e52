//! Segment (C2): a slot bound to a byte range of one file, or a gap that
//! holds no slot and reads as zeros.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use crate::error::Result;
use crate::pool::{NVML_TRANSFER_SIZE, PmemPool, SlotRun};

/// One entry of the per-file segment index.
pub struct Segment {
    /// Base file offset this segment covers.
    pub file_offset: u64,
    /// Logical size of the segment (slot size by construction, except for
    /// the final segment of a file which may be shorter after `truncate`).
    pub logical_size: u64,
    /// High-water mark of real data within the segment; bytes
    /// `[used_bytes, logical_size)` are guaranteed zero.
    pub used_bytes: u64,
    pool: Option<Arc<PmemPool>>,
    slot: Option<SlotRun>,
}

impl Segment {
    /// Creates a gap segment: no slot allocated, reads return zeros.
    pub fn new_gap(file_offset: u64, logical_size: u64) -> Self {
        Self {
            file_offset,
            logical_size,
            used_bytes: 0,
            pool: None,
            slot: None,
        }
    }

    /// Allocates a fresh slot and zero-fills it; used for write-beyond-EOF
    /// allocation where no source data exists yet.
    pub fn new_empty(pool: Arc<PmemPool>, file_offset: u64, logical_size: u64) -> Result<Self> {
        let run = pool.allocate(logical_size)?;
        let ptr = unsafe { pool.slot_ptr(run) };
        unsafe { std::ptr::write_bytes(ptr, 0, logical_size as usize) };
        drain();
        Ok(Self {
                file_offset,
                logical_size,
                used_bytes: 0,
                pool: Some(pool),
                slot: Some(run),
        })
    }

    /// Allocates a slot and streams up to `logical_size` bytes from `file`
    /// at its current position, using a `NVML_TRANSFER_SIZE` transfer
    /// buffer; any unused trailing bytes are zero-filled.
    ///
    /// On a short read, `used_bytes` reflects the bytes actually copied;
    /// no error is raised. A partial final segment is an expected
    /// condition at the tail of a file, not a failure.
    pub fn new_from_file(
        pool: Arc<PmemPool>,
        file_offset: u64,
        logical_size: u64,
        file: &mut File,
    ) -> Result<Self> {
        let run = pool.allocate(logical_size)?;
        let ptr = unsafe { pool.slot_ptr(run) };

        let mut buf = [0u8; NVML_TRANSFER_SIZE];
        let mut copied: u64 = 0;
        while copied < logical_size {
            let want = (logical_size - copied).min(NVML_TRANSFER_SIZE as u64) as usize;
            let n = file.read(&mut buf[..want]).map_err(|e| crate::error::EchoFsError::Internal {
                    message: format!("reading backing store: {e}"),
            })?;
            if n == 0 {
                break;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr.add(copied as usize), n);
            }
            copied += n as u64;
        }
        if copied < logical_size {
            unsafe {
                std::ptr::write_bytes(ptr.add(copied as usize), 0, (logical_size - copied) as usize);
            }
        }
        drain();

        Ok(Self {
                file_offset,
                logical_size,
                used_bytes: copied,
                pool: Some(pool),
                slot: Some(run),
        })
    }

    pub fn is_gap(&self) -> bool {
        self.slot.is_none()
    }

    /// Replaces a gap segment with a freshly allocated, zero-filled slot,
    /// preserving its offset/size. Used by [`crate::file::ResidentFile`]
    /// when a write touches a previously-unwritten hole.
    pub fn promote(&mut self, pool: Arc<PmemPool>) -> Result<()> {
        assert!(self.is_gap(), "promote() called on a non-gap segment");
        let run = pool.allocate(self.logical_size)?;
        let ptr = unsafe { pool.slot_ptr(run) };
        unsafe { std::ptr::write_bytes(ptr, 0, self.logical_size as usize) };
        drain();
        self.slot = Some(run);
        self.pool = Some(pool);
        Ok(())
    }

    /// Zero-fills `[off_in_seg, off_in_seg + n)` within this segment.
    pub fn zero_fill(&self, off_in_seg: u64, n: u64) {
        if self.is_gap() {
            return;
        }
        let ptr = self.data_ptr();
        unsafe {
            std::ptr::write_bytes(ptr.add(off_in_seg as usize), 0, n as usize);
        }
        drain();
    }

    /// Copies `src` into the segment at `off_in_seg`, using a PMEM-safe
    /// store when the slot is backed by real PMEM.
    pub fn write_at(&mut self, off_in_seg: u64, src: &[u8]) {
        assert!(!self.is_gap(), "write_at() called on a gap segment");
        let ptr = self.data_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(off_in_seg as usize), src.len());
        }
        self.used_bytes = self.used_bytes.max(off_in_seg + src.len() as u64);
    }

    /// Call once after a batch of `write_at`/`zero_fill` calls to persist
    /// them.
    pub fn drain(&self) {
        drain();
    }

    /// Copies `n` bytes starting at `off_in_seg` into `dst`. Callers must
    /// ensure `off_in_seg + n <= logical_size` and that the segment is not
    /// a gap (gaps are handled by the caller producing zeros directly).
    pub fn read_at(&self, off_in_seg: u64, dst: &mut [u8]) {
        assert!(!self.is_gap(), "read_at() called on a gap segment");
        let ptr = self.data_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(off_in_seg as usize), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Base address of this segment's slot.
    ///
    /// # Panics
    /// If this is a gap segment (gaps hold no slot by construction).
    pub fn data_ptr(&self) -> *mut u8 {
        let pool = self.pool.as_ref().expect("gap segment has no data");
        let slot = self.slot.expect("gap segment has no data");
        unsafe { pool.slot_ptr(slot) }
    }

    /// Writes this segment's live bytes `[0, used_bytes)` to `out`, used by
    /// unload.
    pub fn writeback(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        if self.is_gap() || self.used_bytes == 0 {
            let zeros = vec![0u8; self.used_bytes as usize];
            return out.write_all(&zeros);
        }
        let ptr = self.data_ptr();
        let slice = unsafe { std::slice::from_raw_parts(ptr, self.used_bytes as usize) };
        out.write_all(slice)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let (Some(pool), Some(slot)) = (self.pool.take(), self.slot.take()) {
            pool.deallocate(slot);
        }
    }
}

/// Persists pending non-temporal stores. A no-op `msync`-less drain is
/// acceptable on platforms where the backing mapping isn't true PMEM:
/// the durability property then degrades to "visible to future reads in
/// this process", which is exactly what a plain store already guarantees.
#[inline]
fn drain() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_SLOT_SIZE;

    fn pool() -> Arc<PmemPool> {
        Arc::new(PmemPool::open(None, MIN_SLOT_SIZE * 4, MIN_SLOT_SIZE).unwrap())
    }

    #[test]
    fn gap_segment_has_no_slot_and_zero_used_bytes() {
        let seg = Segment::new_gap(0, MIN_SLOT_SIZE);
        assert!(seg.is_gap());
        assert_eq!(seg.used_bytes, 0);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let pool = pool();
        let mut seg = Segment::new_empty(pool, 0, MIN_SLOT_SIZE).unwrap();
        seg.write_at(0, b"HELLO");
        seg.drain();
        let mut buf = [0u8; 5];
        seg.read_at(0, &mut buf);
        assert_eq!(&buf, b"HELLO");
        assert_eq!(seg.used_bytes, 5);
    }

    #[test]
    fn promote_allocates_zero_filled_slot() {
        let pool = pool();
        let mut seg = Segment::new_gap(0, MIN_SLOT_SIZE);
        seg.promote(pool).unwrap();
        assert!(!seg.is_gap());
        let mut buf = [0xFFu8; 16];
        seg.read_at(0, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn new_from_file_short_read_zero_fills_remainder() {
        let pool = pool();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut f = File::open(&path).unwrap();
        let seg = Segment::new_from_file(pool, 0, 16, &mut f).unwrap();
        assert_eq!(seg.used_bytes, 3);
        let mut buf = [0xAAu8; 16];
        seg.read_at(0, &mut buf);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0u8; 13]);
    }
}

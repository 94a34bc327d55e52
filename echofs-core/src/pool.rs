//! PMEM pool (C1): a single large PMEM-backed mapping partitioned into
//! fixed-size slots, handed out by a rotating-cursor first-fit bitmap
//! allocator.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{EchoFsError, Result};

/// Default slot size: 128 MiB.
pub const DEFAULT_SLOT_SIZE: u64 = 128 * 1024 * 1024;
/// Minimum configurable slot size.
pub const MIN_SLOT_SIZE: u64 = 1024 * 1024;
/// Transfer granularity used when streaming data in/out of a segment.
pub const NVML_TRANSFER_SIZE: usize = 4 * 1024;

/// A single allocated or free run of the pool, in slot units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRun {
    pub first_slot: usize,
    pub slot_count: usize,
}

impl SlotRun {
    pub fn addr(&self, slot_size: u64) -> u64 {
        self.first_slot as u64 * slot_size
    }
}

struct PoolState {
    /// One bit per slot; `true` == allocated.
    bitmap: Vec<bool>,
    cursor: usize,
}

impl PoolState {
    fn find_run(&self, k: usize) -> Option<usize> {
        let n = self.bitmap.len();
        if k == 0 || k > n {
            return None;
        }
        // First pass: starting at the cursor.
        if let Some(pos) = Self::scan_from(&self.bitmap, self.cursor, k) {
            return Some(pos);
        }
        // Restart from slot 0 on failure.
        if self.cursor != 0 {
            return Self::scan_from(&self.bitmap, 0, k);
        }
        None
    }

    /// Finds the lowest-index run of `k` free slots starting the search at
    /// `from` and wrapping to 0 — but never wrapping past `from` itself,
    /// since the caller already retries from 0 on failure. This keeps the
    /// tie-break policy "lowest index >= cursor first" honest without
    /// scanning the same prefix twice.
    fn scan_from(bitmap: &[bool], from: usize, k: usize) -> Option<usize> {
        let n = bitmap.len();
        let mut run_start = None;
        let mut run_len = 0usize;
        let mut i = from;
        let mut scanned = 0usize;
        while scanned < n {
            if !bitmap[i] {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == k {
                    return run_start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
            i = (i + 1) % n;
            scanned += 1;
        }
        None
    }
}

/// Owns the single PMEM mapping and the slot bitmap allocator.
///
/// Safety: the mapping is a raw `mmap()` region. Reads/writes into it are
/// exposed only through [`Segment`](crate::segment::Segment), which bounds
/// every access to the slot(s) it owns.
pub struct PmemPool {
    base: *mut u8,
    capacity: u64,
    slot_size: u64,
    slot_count: usize,
    state: Mutex<PoolState>,
    _backing: Option<std::fs::File>,
}

// SAFETY: `base` points at a fixed-size mmap'd region for the pool's
// lifetime; all access is mediated through `Segment`, which never aliases
// two live `&mut` views of the same slot (the per-file range lock and the
// allocator bitmap together guarantee a slot belongs to exactly one
// segment at a time).
unsafe impl Send for PmemPool {}
unsafe impl Sync for PmemPool {}

impl PmemPool {
    /// Maps `capacity` bytes from a DAX-backed file at `daxfs_path`.
    ///
    /// `slot_size` is accepted as given; the `MIN_SLOT_SIZE` floor is a
    /// configuration-layer policy (enforced in `echofs_ng::config`), not a
    /// pool-mechanism requirement, so tests can exercise the allocator at
    /// whatever slot size a scenario calls for.
    pub fn open(daxfs_path: Option<&Path>, capacity: u64, slot_size: u64) -> Result<Self> {
        if slot_size == 0 {
            return Err(EchoFsError::invalid_arguments("slot_size must be nonzero"));
        }
        if capacity < slot_size {
            return Err(EchoFsError::invalid_arguments(
                    "capacity must hold at least one slot",
            ));
        }

        let slot_count = (capacity / slot_size) as usize;
        let mapped_len = slot_count as u64 * slot_size;

        let (base, backing) = match daxfs_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(|e| EchoFsError::Internal {
                        message: format!("opening pool file {}: {e}", path.display()),
                })?;
                file.set_len(mapped_len).map_err(|e| EchoFsError::Internal {
                        message: format!("sizing pool file {}: {e}", path.display()),
                })?;
                let ptr = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        mapped_len as usize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        file.as_raw_fd(),
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(EchoFsError::Internal {
                            message: format!(
                                "mmap failed for {}: {}",
                                path.display(),
                                std::io::Error::last_os_error()
                            ),
                    });
                }
                (ptr as *mut u8, Some(file))
            }
            None => {
                let ptr = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        mapped_len as usize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(EchoFsError::Internal {
                            message: format!(
                                "anonymous mmap failed: {}",
                                std::io::Error::last_os_error()
                            ),
                    });
                }
                (ptr as *mut u8, None)
            }
        };

        Ok(Self {
                base,
                capacity: mapped_len,
                slot_size,
                slot_count,
                state: Mutex::new(PoolState {
                        bitmap: vec![false; slot_count],
                        cursor: 0,
                }),
                _backing: backing,
        })
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of slots currently allocated, for diagnostics and the
    /// bitmap invariant checks.
    pub fn allocated_slots(&self) -> usize {
        self.state.lock().unwrap().bitmap.iter().filter(|b| **b).count()
    }

    /// Rounds `bytes` up to a whole number of slots and first-fits a run,
    /// advancing the rotating cursor on success.
    pub fn allocate(&self, bytes: u64) -> Result<SlotRun> {
        let k = bytes.div_ceil(self.slot_size).max(1) as usize;
        let mut state = self.state.lock().unwrap();
        let first = state.find_run(k).ok_or(EchoFsError::PoolFull)?;
        for i in 0..k {
            state.bitmap[(first + i) % self.slot_count] = true;
        }
        state.cursor = (first + k + 1) % self.slot_count;
        Ok(SlotRun {
                first_slot: first,
                slot_count: k,
        })
    }

    /// Clears the bits for a previously-allocated run. Double-free is a
    /// programmer error — we catch the easy case (bits already clear) and panic,
    /// since silently accepting it would corrupt the invariant in.
    pub fn deallocate(&self, run: SlotRun) {
        let mut state = self.state.lock().unwrap();
        for i in 0..run.slot_count {
            let idx = (run.first_slot + i) % self.slot_count;
            assert!(state.bitmap[idx], "double-free of pool slot {idx}");
            state.bitmap[idx] = false;
        }
    }

    /// Raw pointer to the start of a slot run. Callers must stay within
    /// `run.slot_count * slot_size` bytes.
    ///
    /// # Safety
    /// `run` must have been returned by [`allocate`](Self::allocate) on
    /// this pool and not yet passed to [`deallocate`](Self::deallocate).
    pub unsafe fn slot_ptr(&self, run: SlotRun) -> *mut u8 {
        unsafe { self.base.add(run.first_slot * self.slot_size as usize) }
    }
}

impl Drop for PmemPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(slots: usize, slot_size: u64) -> PmemPool {
        PmemPool::open(None, slots as u64 * slot_size, slot_size).unwrap()
    }

    #[test]
    fn allocate_and_deallocate_roundtrip() {
        let pool = test_pool(4, MIN_SLOT_SIZE);
        let run = pool.allocate(MIN_SLOT_SIZE).unwrap();
        assert_eq!(run.slot_count, 1);
        assert_eq!(pool.allocated_slots(), 1);
        pool.deallocate(run);
        assert_eq!(pool.allocated_slots(), 0);
    }

    #[test]
    fn allocate_rounds_up_to_whole_slots() {
        let pool = test_pool(4, MIN_SLOT_SIZE);
        let run = pool.allocate(MIN_SLOT_SIZE + 1).unwrap();
        assert_eq!(run.slot_count, 2);
    }

    #[test]
    fn pool_full_when_exhausted() {
        let pool = test_pool(2, MIN_SLOT_SIZE);
        pool.allocate(MIN_SLOT_SIZE).unwrap();
        pool.allocate(MIN_SLOT_SIZE).unwrap();
        let err = pool.allocate(MIN_SLOT_SIZE).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PoolFull);
    }

    #[test]
    #[should_panic(expected = "double-free")]
    fn double_free_panics() {
        let pool = test_pool(2, MIN_SLOT_SIZE);
        let run = pool.allocate(MIN_SLOT_SIZE).unwrap();
        pool.deallocate(run);
        pool.deallocate(run);
    }

    #[test]
    fn cursor_rotates_and_wraps_on_failure() {
        let pool = test_pool(4, MIN_SLOT_SIZE);
        let a = pool.allocate(MIN_SLOT_SIZE).unwrap();
        assert_eq!(a.first_slot, 0);
        let b = pool.allocate(MIN_SLOT_SIZE).unwrap();
        // cursor advanced to found + k + 1 == 2, so next alloc starts at 2
        assert_eq!(b.first_slot, 2);
        pool.deallocate(a);
        // cursor is at 4 % 4 == 0 after b; free slot 0 exists but cursor
        // starts searching there directly (since it wrapped to 0 already).
        let c = pool.allocate(MIN_SLOT_SIZE).unwrap();
        assert_eq!(c.first_slot, 0);
    }

    #[test]
    fn two_bits_set_for_two_eight_byte_writes_at_slot_size_sixteen() {
        // Mirrors scenario 2's bitmap assertion at the allocator level.
        let pool = test_pool(4, 16);
        let a = pool.allocate(8).unwrap();
        let b = pool.allocate(8).unwrap();
        assert_eq!(a.slot_count, 1);
        assert_eq!(b.slot_count, 1);
        assert_eq!(pool.allocated_slots(), 2);
    }
}

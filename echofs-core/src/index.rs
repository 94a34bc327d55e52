//! Segment index (C4): per-file ordered map from file offset to segment,
//! supporting point lookup and interval scan.

use std::sync::{Arc, RwLock};

use crate::pool::PmemPool;
use crate::segment::Segment;

/// One slice of a [`SegmentIndex::scan`] result: the segment, and the
/// portion of it (in segment-local coordinates) that intersects the
/// requested range.
pub struct ScanSlice<'a> {
    pub segment: &'a Segment,
    pub seg_local_start: u64,
    pub seg_local_len: u64,
}

/// Ordered, gapless interval map from file offset to [`Segment`], covering
/// `[0, alloc_offset)` with no holes — holes are explicit `is_gap`
/// segments. Keyed by start offset, segments stored in insertion
/// (== offset) order.
///
/// Guarded by a single `RwLock`: `find`/`scan` take shared access,
/// `insert_back`/`truncate` take exclusive access.
pub struct SegmentIndex {
    inner: RwLock<Vec<Segment>>,
}

impl Default for SegmentIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    /// Current allocation high-water mark: the end offset of the last
    /// segment, or 0 if empty.
    pub fn alloc_offset(&self) -> u64 {
        let segs = self.inner.read().unwrap();
        segs.last().map(|s| s.file_offset + s.logical_size).unwrap_or(0)
    }

    /// Appends a segment at the current high-water mark.
    ///
    /// # Panics
    /// If `seg.file_offset` does not equal the current `alloc_offset`.
    pub fn insert_back(&self, seg: Segment) {
        let mut segs = self.inner.write().unwrap();
        let hi = segs.last().map(|s| s.file_offset + s.logical_size).unwrap_or(0);
        assert_eq!(
            seg.file_offset, hi,
            "insert_back: segment offset {} does not continue high-water {}",
            seg.file_offset, hi
        );
        segs.push(seg);
    }

    /// Runs `f` with a reference to the unique segment containing `off`,
    /// or `None` if `off` is at or beyond `alloc_offset`.
    pub fn find<R>(&self, off: u64, f: impl FnOnce(Option<&Segment>) -> R) -> R {
        let segs = self.inner.read().unwrap();
        let idx = Self::locate(&segs, off);
        f(idx.map(|i| &segs[i]))
    }

    /// Runs `f` with the sequence of segments overlapping `[s, e)`, in
    /// ascending order, each annotated with the intersected slice.
    pub fn scan<R>(&self, s: u64, e: u64, f: impl FnOnce(&[ScanSlice<'_>]) -> R) -> R {
        let segs = self.inner.read().unwrap();
        if s >= e {
            return f(&[]);
        }
        let mut slices = Vec::new();
        let start_idx = Self::locate(&segs, s).unwrap_or(segs.len());
        for seg in &segs[start_idx..] {
            if seg.file_offset >= e {
                break;
            }
            let seg_end = seg.file_offset + seg.logical_size;
            let lo = s.max(seg.file_offset);
            let hi = e.min(seg_end);
            if lo >= hi {
                continue;
            }
            slices.push(ScanSlice {
                    segment: seg,
                    seg_local_start: lo - seg.file_offset,
                    seg_local_len: hi - lo,
            });
        }
        f(&slices)
    }

    /// Provides mutable (exclusive) access to the segment containing
    /// `off`, for in-place promotion/write (used by
    /// [`crate::file::ResidentFile`]).
    pub fn with_segment_mut<R>(&self, off: u64, f: impl FnOnce(Option<&mut Segment>) -> R) -> R {
        let mut segs = self.inner.write().unwrap();
        let idx = Self::locate(&segs, off);
        f(idx.map(move |i| &mut segs[i]))
    }

    /// Shrinks or grows the covered range so it becomes exactly
    /// `[0, new_size)`. Shrinking drops/truncates trailing segments and
    /// returns their slots to the pool (via `Segment`'s `Drop`); growing
    /// appends gap segments covering the newly exposed range, bound to
    /// `pool`'s slot size.
    pub fn truncate(&self, new_size: u64, pool: &Arc<PmemPool>) {
        let mut segs = self.inner.write().unwrap();
        let hi = segs.last().map(|s| s.file_offset + s.logical_size).unwrap_or(0);

        if new_size >= hi {
            let mut cursor = hi;
            let slot_size = pool.slot_size();
            while cursor < new_size {
                let len = (new_size - cursor).min(slot_size);
                segs.push(Segment::new_gap(cursor, len));
                cursor += len;
            }
            return;
        }

        while let Some(last) = segs.last() {
            if last.file_offset >= new_size {
                segs.pop();
                continue;
            }
            if last.file_offset + last.logical_size > new_size {
                let keep = new_size - last.file_offset;
                if let Some(last_mut) = segs.last_mut() {
                    last_mut.logical_size = keep;
                    last_mut.used_bytes = last_mut.used_bytes.min(keep);
                }
            }
            break;
        }
    }

    /// Binary search for the index of the segment whose interval contains
    /// `off`; segments are contiguous and ordered by construction.
    fn locate(segs: &[Segment], off: u64) -> Option<usize> {
        if segs.is_empty() || off >= segs.last().unwrap().file_offset + segs.last().unwrap().logical_size {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = segs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let seg = &segs[mid];
            if off < seg.file_offset {
                hi = mid;
            } else if off >= seg.file_offset + seg.logical_size {
                lo = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MIN_SLOT_SIZE, PmemPool};

    fn pool() -> Arc<PmemPool> {
        Arc::new(PmemPool::open(None, MIN_SLOT_SIZE * 8, MIN_SLOT_SIZE).unwrap())
    }

    #[test]
    fn insert_back_requires_contiguity() {
        let idx = SegmentIndex::new();
        idx.insert_back(Segment::new_gap(0, 16));
        idx.insert_back(Segment::new_gap(16, 16));
        assert_eq!(idx.alloc_offset(), 32);
    }

    #[test]
    #[should_panic(expected = "does not continue")]
    fn insert_back_rejects_non_contiguous_offset() {
        let idx = SegmentIndex::new();
        idx.insert_back(Segment::new_gap(0, 16));
        idx.insert_back(Segment::new_gap(20, 16));
    }

    #[test]
    fn find_locates_containing_segment() {
        let idx = SegmentIndex::new();
        idx.insert_back(Segment::new_gap(0, 16));
        idx.insert_back(Segment::new_gap(16, 16));
        idx.find(20, |seg| {
                let seg = seg.unwrap();
                assert_eq!(seg.file_offset, 16);
        });
        idx.find(32, |seg| assert!(seg.is_none()));
    }

    #[test]
    fn scan_yields_intersected_slices_in_order() {
        let idx = SegmentIndex::new();
        idx.insert_back(Segment::new_gap(0, 16));
        idx.insert_back(Segment::new_gap(16, 16));
        idx.insert_back(Segment::new_gap(32, 16));
        idx.scan(8, 40, |slices| {
                assert_eq!(slices.len(), 3);
                assert_eq!(slices[0].segment.file_offset, 0);
                assert_eq!(slices[0].seg_local_start, 8);
                assert_eq!(slices[0].seg_local_len, 8);
                assert_eq!(slices[1].segment.file_offset, 16);
                assert_eq!(slices[1].seg_local_start, 0);
                assert_eq!(slices[1].seg_local_len, 16);
                assert_eq!(slices[2].segment.file_offset, 32);
                assert_eq!(slices[2].seg_local_start, 0);
                assert_eq!(slices[2].seg_local_len, 8);
        });
    }

    #[test]
    fn truncate_shrink_drops_and_trims_segments() {
        let pool = pool();
        let idx = SegmentIndex::new();
        idx.insert_back(Segment::new_gap(0, 16));
        idx.insert_back(Segment::new_gap(16, 16));
        idx.insert_back(Segment::new_gap(32, 16));
        idx.truncate(20, &pool);
        assert_eq!(idx.alloc_offset(), 20);
        idx.find(19, |seg| assert!(seg.is_some()));
        idx.find(20, |seg| assert!(seg.is_none()));
    }

    #[test]
    fn truncate_grow_appends_gap_segments() {
        let pool = pool();
        let idx = SegmentIndex::new();
        idx.insert_back(Segment::new_gap(0, 16));
        idx.truncate(MIN_SLOT_SIZE + 16, &pool);
        assert_eq!(idx.alloc_offset(), MIN_SLOT_SIZE + 16);
        idx.find(MIN_SLOT_SIZE, |seg| assert!(seg.unwrap().is_gap()));
    }
}

//! Garbage collection: tombstone accounting, in-place compaction,
//! offset repair, and file truncation.
//!
//! Variable-size writes always append and tombstone, so reclaiming space
//! means coalescing the tombstoned ranges and sliding the live bytes
//! between them leftward. Containers then have their offsets repaired
//! from the recorded `(src, shift)` pairs, and the files shrink when the
//! reserve left behind is large enough.

use crate::store::{
    get_new_capacity, StoreInner, StoreState, WritingMode, PAGE_SIZE, TRUNCATE_THRESHOLD,
};
use mirrorkv_codec::DATA_START;

const BASE_GC_KEYS_THRESHOLD: usize = 80;
const BASE_GC_BYTES_THRESHOLD: usize = 4096;

/// A `[start, end)` range of tombstoned bytes awaiting reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidSegment {
    pub start: usize,
    pub end: usize,
}

impl StoreState {
    /// Garbage threshold in bytes, scaled to the current data size.
    pub(crate) fn bytes_threshold(&self) -> usize {
        if self.data_end <= (1 << 14) {
            BASE_GC_BYTES_THRESHOLD
        } else if self.data_end <= (1 << 16) {
            BASE_GC_BYTES_THRESHOLD << 1
        } else {
            BASE_GC_BYTES_THRESHOLD << 2
        }
    }

    /// Runs GC when enough garbage or enough segments accumulated.
    pub(crate) fn check_gc(&mut self, inner: &StoreInner) {
        let keys_threshold = if self.data_end < (1 << 14) {
            BASE_GC_KEYS_THRESHOLD
        } else {
            BASE_GC_KEYS_THRESHOLD << 1
        };
        if self.invalid_bytes >= (self.bytes_threshold() << 1) || self.invalids.len() >= keys_threshold
        {
            self.gc(inner, 0);
        }
    }

    /// Compacts the data region in place.
    ///
    /// `allocate` is the size of a pending write, reserved when deciding
    /// whether to truncate afterwards.
    pub(crate) fn gc(&mut self, inner: &StoreInner, allocate: usize) {
        if self.invalids.is_empty() {
            return;
        }
        self.invalids.sort_by_key(|s| s.start);
        merge_invalids(&mut self.invalids);

        let gc_start = self.invalids[0].start;
        let new_data_end = self.data_end - self.invalid_bytes;
        let new_data_size = new_data_end - DATA_START;
        let update_size = new_data_end - gc_start;
        let gc_size = self.data_end - gc_start;
        // Recomputing from scratch is cheaper than two partial passes
        // when most of the region moved.
        let full_checksum = new_data_size < gc_size + update_size;
        if !full_checksum {
            self.checksum ^= self.buffer.checksum(gc_start, gc_size);
        }

        let n = self.invalids.len();
        let remain = self.data_end - self.invalids[n - 1].end;
        let mut src_to_shift: Vec<(usize, usize)> =
            Vec::with_capacity(if remain > 0 { n } else { n - 1 });
        let mut dst_pos = gc_start;
        let mut src_pos = self.invalids[0].end;
        for i in 1..n {
            let next = self.invalids[i];
            let size = next.start - src_pos;
            self.buffer.copy_within(src_pos, dst_pos, size);
            src_to_shift.push((src_pos, src_pos - dst_pos));
            dst_pos += size;
            src_pos = next.end;
        }
        if remain > 0 {
            self.buffer.copy_within(src_pos, dst_pos, remain);
            src_to_shift.push((src_pos, src_pos - dst_pos));
        }
        self.clear_invalid();

        if full_checksum {
            self.checksum = self.buffer.checksum(DATA_START, new_data_size);
        } else {
            self.checksum ^= self.buffer.checksum(gc_start, update_size);
        }
        self.data_end = new_data_end;

        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                let buf = self.buffer.as_slice();
                let compacted = &buf[gc_start..gc_start + update_size];
                m.a.write_i32(0, -1);
                m.a.write_u64(4, self.checksum);
                m.a.write_bytes(gc_start, compacted);
                m.a.write_i32(0, new_data_size as i32);
                m.b.write_i32(0, new_data_size as i32);
                m.b.write_u64(4, self.checksum);
                m.b.write_bytes(gc_start, compacted);
            }
        } else {
            self.buffer.write_i32_at(0, new_data_size as i32);
            self.buffer.write_u64_at(4, self.checksum);
        }

        self.update_offsets(gc_start, &src_to_shift);
        let expected_end = new_data_end + allocate;
        if self.buffer.capacity() - expected_end > TRUNCATE_THRESHOLD {
            self.truncate(inner, expected_end);
        }
        inner.info("gc finished");
    }

    /// Repairs container offsets after compaction.
    ///
    /// Each moved container finds the invalid segment that preceded it
    /// (largest recorded `src` at or below its offset) and subtracts
    /// that segment's accumulated shift.
    fn update_offsets(&mut self, gc_start: usize, src_to_shift: &[(usize, usize)]) {
        for container in self.index.values_mut() {
            let offset = container.offset();
            if offset > gc_start {
                let idx = src_to_shift.partition_point(|&(src, _)| src <= offset) - 1;
                container.shift_left(src_to_shift[idx].1);
            }
        }
    }

    /// Shrinks the buffer and mirror files when the reserve beyond
    /// `expected_end` grew past the truncation threshold.
    fn truncate(&mut self, inner: &StoreInner, expected_end: usize) {
        // Keep at least one page of reserve.
        let Ok(new_capacity) = get_new_capacity(PAGE_SIZE, expected_end + PAGE_SIZE) else {
            return;
        };
        if new_capacity >= self.buffer.capacity() {
            return;
        }
        self.buffer.resize(new_capacity);
        let mut remap_error = None;
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                if let Err(e) = m.a.remap(new_capacity).and_then(|_| m.b.remap(new_capacity)) {
                    remap_error = Some(e);
                }
            }
        }
        if let Some(e) = remap_error {
            inner.error(&format!("remap failed during truncation: {e}"));
            self.to_blocking_mode();
        }
        inner.info("truncate finished");
    }
}

/// Merges adjacent segments (`p.end == q.start`) into one.
fn merge_invalids(invalids: &mut Vec<InvalidSegment>) {
    let mut merged: Vec<InvalidSegment> = Vec::with_capacity(invalids.len());
    for segment in invalids.drain(..) {
        match merged.last_mut() {
            Some(last) if last.end == segment.start => last.end = segment.end,
            _ => merged.push(segment),
        }
    }
    *invalids = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DOUBLE_LIMIT;

    #[test]
    fn merge_joins_adjacent_segments() {
        let mut invalids = vec![
            InvalidSegment { start: 12, end: 20 },
            InvalidSegment { start: 20, end: 31 },
            InvalidSegment { start: 40, end: 44 },
            InvalidSegment { start: 44, end: 50 },
            InvalidSegment { start: 60, end: 61 },
        ];
        merge_invalids(&mut invalids);
        assert_eq!(
            invalids,
            vec![
                InvalidSegment { start: 12, end: 31 },
                InvalidSegment { start: 40, end: 50 },
                InvalidSegment { start: 60, end: 61 },
            ]
        );
    }

    #[test]
    fn merge_keeps_disjoint_segments() {
        let mut invalids = vec![
            InvalidSegment { start: 12, end: 20 },
            InvalidSegment { start: 21, end: 30 },
        ];
        merge_invalids(&mut invalids);
        assert_eq!(invalids.len(), 2);
    }

    #[test]
    fn capacity_growth_schedule() {
        // Below a page: always one page.
        assert_eq!(get_new_capacity(PAGE_SIZE, 100).unwrap(), PAGE_SIZE);
        // Doubling up to the limit.
        assert_eq!(get_new_capacity(PAGE_SIZE, 5000).unwrap(), PAGE_SIZE * 2);
        assert_eq!(get_new_capacity(PAGE_SIZE, 16000).unwrap(), DOUBLE_LIMIT);
        // Linear steps past the limit.
        assert_eq!(
            get_new_capacity(DOUBLE_LIMIT * 2, DOUBLE_LIMIT * 2 + 1).unwrap(),
            DOUBLE_LIMIT * 3
        );
        // The hard cap is fatal.
        assert!(get_new_capacity(PAGE_SIZE, (1 << 29) + 1).is_err());
    }
}

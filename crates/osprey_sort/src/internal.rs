//! The in-memory run former.
//!
//! Records are serialized tail-to-tail into one byte buffer of fixed
//! capacity; a parallel index array records where each record starts. The
//! sort permutes the index array only, with a comparator that decodes the
//! two records it is handed. Once a push does not fit, the sorter is *full*
//! and stays full until `reset`.

use std::cmp::Ordering;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use osprey_common::error::OspreyResult;
use osprey_stream::serialization::{decode_record, encode_record, RECORD_FRAME_BYTES};

/// Location of one framed record in the buffer.
#[derive(Debug, Clone, Copy)]
struct RecordRef {
    offset: u32,
    len: u32,
}

/// Buffer + index sorter for variable-length records.
pub struct InternalSorter<T> {
    buffer: Vec<u8>,
    capacity: usize,
    refs: Vec<RecordRef>,
    /// Pull cursor into the sorted index array.
    read_pos: usize,
    largest: usize,
    full: bool,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> InternalSorter<T> {
    /// A sorter holding at most `capacity_bytes` of framed records. The
    /// index array starts at `expected_items` entries and doubles as
    /// needed.
    pub fn new(capacity_bytes: usize, expected_items: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity_bytes),
            capacity: capacity_bytes,
            refs: Vec::with_capacity(expected_items.max(16)),
            read_pos: 0,
            largest: 0,
            full: false,
            _marker: PhantomData,
        }
    }

    /// Serialize `item` into the buffer. Returns `Ok(false)` when the item
    /// does not fit: the item is *not* stored and every following push
    /// fails the same way until `reset`.
    pub fn push(&mut self, item: &T) -> OspreyResult<bool> {
        if self.full {
            return Ok(false);
        }
        let framed = encode_record(item)?;
        if self.buffer.len() + framed.len() > self.capacity {
            self.full = true;
            return Ok(false);
        }
        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(&framed);
        self.refs.push(RecordRef {
            offset,
            len: framed.len() as u32,
        });
        self.largest = self.largest.max(framed.len());
        Ok(true)
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn item_count(&self) -> usize {
        self.refs.len()
    }

    /// Largest framed record length seen since the last `reset`-with-resize;
    /// drives the merge fanout.
    pub fn largest_item_size(&self) -> usize {
        self.largest
    }

    fn decode_ref(&self, r: RecordRef) -> OspreyResult<T> {
        let start = r.offset as usize + RECORD_FRAME_BYTES;
        let end = r.offset as usize + r.len as usize;
        decode_record(&self.buffer[start..end])
    }

    /// Sort the index array. Stable, so the external sort inherits
    /// stability from the comparator.
    pub fn sort<C>(&mut self, cmp: &C)
    where
        C: Fn(&T, &T) -> Ordering,
    {
        let buffer = &self.buffer;
        self.refs.sort_by(|a, b| {
            let start_a = a.offset as usize + RECORD_FRAME_BYTES;
            let start_b = b.offset as usize + RECORD_FRAME_BYTES;
            let va: T = decode_record(&buffer[start_a..a.offset as usize + a.len as usize])
                .expect("record decoded on push");
            let vb: T = decode_record(&buffer[start_b..b.offset as usize + b.len as usize])
                .expect("record decoded on push");
            cmp(&va, &vb)
        });
        self.read_pos = 0;
    }

    pub fn can_pull(&self) -> bool {
        self.read_pos < self.refs.len()
    }

    /// Next record in sorted order.
    pub fn pull(&mut self) -> OspreyResult<T> {
        let r = self.refs[self.read_pos];
        self.read_pos += 1;
        self.decode_ref(r)
    }

    /// The framed bytes of the next record in sorted order; used to stream
    /// a run to disk without a decode/re-encode round trip.
    pub fn pull_raw(&mut self) -> &[u8] {
        let r = self.refs[self.read_pos];
        self.read_pos += 1;
        &self.buffer[r.offset as usize..(r.offset + r.len) as usize]
    }

    /// Clear records and the full flag; capacity and the largest-item
    /// statistic survive (the statistic spans all runs of one sort).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.refs.clear();
        self.read_pos = 0;
        self.full = false;
    }

    /// Shrink to a new capacity, dropping all state.
    pub fn resize(&mut self, capacity_bytes: usize) {
        self.buffer = Vec::with_capacity(capacity_bytes);
        self.capacity = capacity_bytes;
        self.refs = Vec::new();
        self.read_pos = 0;
        self.largest = 0;
        self.full = false;
    }

    /// Bytes held by a sorter with the given buffer capacity and expected
    /// item count.
    pub fn memory_usage(capacity_bytes: u64, expected_items: u64) -> u64 {
        capacity_bytes
            + expected_items * std::mem::size_of::<RecordRef>() as u64
            + std::mem::size_of::<Self>() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u64_cmp(a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_push_sort_pull() {
        let mut s: InternalSorter<u64> = InternalSorter::new(1024, 8);
        for v in [5u64, 3, 9, 1, 7] {
            assert!(s.push(&v).unwrap());
        }
        s.sort(&u64_cmp);
        let mut out = Vec::new();
        while s.can_pull() {
            out.push(s.pull().unwrap());
        }
        assert_eq!(out, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_full_stays_full_until_reset() {
        // Each framed u64 is 12 bytes; capacity fits exactly two.
        let mut s: InternalSorter<u64> = InternalSorter::new(24, 2);
        assert!(s.push(&1).unwrap());
        assert!(s.push(&2).unwrap());
        assert!(!s.push(&3).unwrap());
        assert!(s.is_full());
        // The rejected item was discarded; pushes keep failing.
        assert!(!s.push(&4).unwrap());
        assert_eq!(s.item_count(), 2);
        s.reset();
        assert!(s.push(&3).unwrap());
    }

    #[test]
    fn test_never_writes_past_capacity() {
        let mut s: InternalSorter<u64> = InternalSorter::new(100, 4);
        let mut accepted = 0;
        for v in 0..100u64 {
            if s.push(&v).unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100 / 12);
        assert!(s.buffer.len() <= 100);
    }

    #[test]
    fn test_largest_item_size_tracks_frames() {
        let mut s: InternalSorter<String> = InternalSorter::new(4096, 4);
        s.push(&"ab".to_string()).unwrap();
        s.push(&"abcdefgh".to_string()).unwrap();
        // String encodes as [len: u64][bytes]; framed adds 4 more.
        assert_eq!(s.largest_item_size(), 4 + 8 + 8);
    }

    #[test]
    fn test_sort_is_stable() {
        // Sort pairs by key only; payloads of equal keys keep input order.
        let mut s: InternalSorter<(u32, u32)> = InternalSorter::new(4096, 16);
        for (k, p) in [(1u32, 0u32), (0, 1), (1, 2), (0, 3), (1, 4)] {
            s.push(&(k, p)).unwrap();
        }
        s.sort(&|a: &(u32, u32), b: &(u32, u32)| a.0.cmp(&b.0));
        let mut out = Vec::new();
        while s.can_pull() {
            out.push(s.pull().unwrap());
        }
        assert_eq!(out, vec![(0, 1), (0, 3), (1, 0), (1, 2), (1, 4)]);
    }

    #[test]
    fn test_pull_raw_matches_pull() {
        let mut s: InternalSorter<u64> = InternalSorter::new(1024, 8);
        for v in [2u64, 1] {
            s.push(&v).unwrap();
        }
        s.sort(&u64_cmp);
        let raw = s.pull_raw().to_vec();
        assert_eq!(u32::from_le_bytes(raw[..4].try_into().unwrap()), 8);
        let body: u64 = decode_record(&raw[4..]).unwrap();
        assert_eq!(body, 1);
    }

    #[test]
    fn test_memory_usage_scales_with_capacity() {
        let small = InternalSorter::<u64>::memory_usage(1024, 16);
        let big = InternalSorter::<u64>::memory_usage(4096, 16);
        assert_eq!(big - small, 3072);
    }
}

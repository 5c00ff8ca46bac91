//! The external merge sort driver.
//!
//! Three phases, driven by the caller:
//!   1. `push` items; when the in-memory sorter fills, the sorted batch is
//!      streamed to a fresh temporary run file.
//!   2. `end` sorts the final batch and merges runs in bounded-fanout
//!      groups until one run remains.
//!   3. `can_pull`/`pull` stream the result out of the final run.
//!
//! The buffer size is searched (doubling, then binary search) for the
//! largest size whose accounted usage fits the construction-time budget;
//! the merge fanout comes from the largest record seen across all runs.
//! Consumed input runs are deleted after each merge group; everything left
//! is deleted on drop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::temp::{ScratchDir, TempPath};
use osprey_common::Runtime;
use osprey_stream::serialization::{SerializationReader, SerializationWriter};

use crate::internal::InternalSorter;

/// Smallest buffer the size search will consider.
const MIN_BUFFER_BYTES: u64 = 1024;

/// Largest block size used for run files: the serialization default.
const MAX_RUN_BLOCK_BYTES: u64 = 2 * 1024 * 1024;

/// External merge sorter for serializable records.
pub struct ExternalSorter<T, C> {
    rt: Runtime,
    cmp: C,
    mem_avail: u64,
    /// Block size of run files, scaled down under tight budgets.
    run_block_bytes: u64,
    sorter: InternalSorter<T>,
    scratch: ScratchDir,
    runs: Vec<TempPath>,
    items: u64,
    largest: usize,
    initial_runs: usize,
    merge_passes: usize,
    reader: Option<SerializationReader>,
    /// Sort-buffer bytes currently accounted with the memory manager.
    accounted_buffer: u64,
    ended: bool,
}

impl<T, C> ExternalSorter<T, C>
where
    T: Serialize + DeserializeOwned,
    C: Fn(&T, &T) -> Ordering,
{
    /// Build a sorter that keeps its accounted memory within `mem_avail`
    /// bytes. `minimum_item_size` is the smallest framed record length the
    /// caller expects; it seeds the expected-items estimate for the index
    /// array.
    pub fn new(
        rt: &Runtime,
        mem_avail: u64,
        minimum_item_size: u64,
        cmp: C,
    ) -> OspreyResult<Self> {
        let run_block_bytes = run_block_bytes(mem_avail);
        let writer_reservation = SerializationWriter::memory_usage(run_block_bytes);
        let buffer =
            choose_buffer_size::<T>(mem_avail, writer_reservation, minimum_item_size.max(1))?;
        let expected = (buffer / minimum_item_size.max(1)).max(16);
        tracing::debug!(buffer, expected, run_block_bytes, "external sort sized");
        let scratch = ScratchDir::new(&rt.temp_dir(), "osprey_sort")
            .map_err(osprey_common::error::StreamError::Io)?;
        rt.memory().account(buffer)?;
        Ok(Self {
            rt: rt.clone(),
            cmp,
            mem_avail,
            run_block_bytes,
            sorter: InternalSorter::new(buffer as usize, expected as usize),
            scratch,
            runs: Vec::new(),
            items: 0,
            largest: 0,
            initial_runs: 0,
            merge_passes: 0,
            reader: None,
            accounted_buffer: buffer,
            ended: false,
        })
    }

    /// Number of items pushed.
    pub fn item_count(&self) -> u64 {
        self.items
    }

    /// Runs formed before any merging. Meaningful after `end`.
    pub fn initial_run_count(&self) -> usize {
        self.initial_runs
    }

    /// Merge passes performed over the run set. Meaningful after `end`.
    pub fn merge_pass_count(&self) -> usize {
        self.merge_passes
    }

    // ── Phase 1: run formation ───────────────────────────────────────────────

    pub fn push(&mut self, item: &T) -> OspreyResult<()> {
        debug_assert!(!self.ended, "push after end");
        if !self.sorter.push(item)? {
            self.end_run()?;
            if !self.sorter.push(item)? {
                return Err(OspreyError::ResourceExhaustion(
                    "a single record does not fit in the sort buffer".into(),
                ));
            }
        }
        self.items += 1;
        Ok(())
    }

    /// Sort the buffered batch and stream it to a fresh run file.
    fn end_run(&mut self) -> OspreyResult<()> {
        self.sorter.sort(&self.cmp);
        if !self.sorter.can_pull() {
            return Ok(());
        }
        let run = self.scratch.file("run");
        let mut writer =
            SerializationWriter::create_with(&self.rt, run.path(), self.run_block_bytes)?;
        while self.sorter.can_pull() {
            let framed = self.sorter.pull_raw();
            writer.write(framed)?;
        }
        writer.close()?;
        tracing::debug!(
            run = self.runs.len(),
            items = self.sorter.item_count(),
            "sorted run written"
        );
        self.largest = self.largest.max(self.sorter.largest_item_size());
        self.runs.push(run);
        self.sorter.reset();
        Ok(())
    }

    // ── Phase 2: merge ───────────────────────────────────────────────────────

    /// Finish pushing and merge runs down to one.
    pub fn end(&mut self) -> OspreyResult<()> {
        if self.ended {
            return Ok(());
        }
        self.end_run()?;
        // The run-formation buffer is no longer needed; free it before the
        // merge readers are sized.
        self.sorter.resize(0);
        self.rt.memory().release(self.accounted_buffer);
        self.accounted_buffer = 0;
        self.ended = true;
        self.initial_runs = self.runs.len();
        if self.runs.len() <= 1 {
            return Ok(());
        }

        let fanout = self.fanout()?;
        while self.runs.len() > 1 {
            self.merge_passes += 1;
            let inputs = std::mem::take(&mut self.runs);
            tracing::debug!(
                pass = self.merge_passes,
                runs = inputs.len(),
                fanout,
                "merge pass"
            );
            let mut outputs = Vec::with_capacity(inputs.len().div_ceil(fanout));
            let mut inputs = inputs.into_iter().peekable();
            while inputs.peek().is_some() {
                let group: Vec<TempPath> = inputs.by_ref().take(fanout).collect();
                if group.len() == 1 {
                    // A lone trailing run advances unchanged.
                    outputs.extend(group);
                } else {
                    outputs.push(self.merge_group(&group)?);
                    // Dropping the group deletes the consumed input runs.
                }
            }
            self.runs = outputs;
        }
        Ok(())
    }

    /// Per-merge fanout from the memory budget and the largest record.
    fn fanout(&self) -> OspreyResult<usize> {
        let writer = SerializationWriter::memory_usage(self.run_block_bytes);
        let reader = SerializationReader::memory_usage(self.run_block_bytes);
        let per_input = reader + self.largest as u64;
        let budget = self.mem_avail.saturating_sub(writer);
        let fanout = (budget / per_input.max(1)) as usize;
        if fanout < 2 {
            return Err(OspreyError::ResourceExhaustion(format!(
                "merge needs two inputs but {} bytes only fit a fanout of {fanout}",
                self.mem_avail
            )));
        }
        Ok(fanout)
    }

    /// K-way merge one group of runs into a fresh run.
    fn merge_group(&mut self, group: &[TempPath]) -> OspreyResult<TempPath> {
        let out = self.scratch.file("merge");
        let mut writer =
            SerializationWriter::create_with(&self.rt, out.path(), self.run_block_bytes)?;
        let mut readers = group
            .iter()
            .map(|run| SerializationReader::open(&self.rt, run.path()))
            .collect::<OspreyResult<Vec<_>>>()?;

        let cmp = &self.cmp;
        let mut heap: BinaryHeap<HeapEntry<'_, T, C>> = BinaryHeap::with_capacity(readers.len());
        for (source, reader) in readers.iter_mut().enumerate() {
            if reader.can_read() {
                heap.push(HeapEntry {
                    item: reader.read_record()?,
                    source,
                    cmp,
                });
            }
        }
        while let Some(entry) = heap.pop() {
            writer.write_record(&entry.item)?;
            let source = entry.source;
            if readers[source].can_read() {
                heap.push(HeapEntry {
                    item: readers[source].read_record()?,
                    source,
                    cmp,
                });
            }
        }
        for mut reader in readers {
            reader.close()?;
        }
        writer.close()?;
        Ok(out)
    }

    // ── Phase 3: pull ────────────────────────────────────────────────────────

    pub fn can_pull(&self) -> bool {
        match &self.reader {
            Some(reader) => reader.can_read(),
            None => !self.runs.is_empty(),
        }
    }

    /// Next record in sorted order. The final run is opened on demand.
    pub fn pull(&mut self) -> OspreyResult<T> {
        debug_assert!(self.ended, "pull before end");
        if self.reader.is_none() {
            let run = self
                .runs
                .first()
                .ok_or_else(|| OspreyError::Stream(osprey_common::StreamError::EndOfStream))?;
            self.reader = Some(SerializationReader::open(&self.rt, run.path())?);
        }
        self.reader
            .as_mut()
            .expect("reader opened above")
            .read_record()
    }
}

impl<T, C> Drop for ExternalSorter<T, C> {
    fn drop(&mut self) {
        self.rt.memory().release(self.accounted_buffer);
        self.accounted_buffer = 0;
        // Remaining run files go with the scratch directory.
    }
}

// ── Merge heap entry ─────────────────────────────────────────────────────────

/// `BinaryHeap` is a max-heap, so the ordering is inverted; ties break on
/// the source run index to keep the merge stable.
struct HeapEntry<'a, T, C> {
    item: T,
    source: usize,
    cmp: &'a C,
}

impl<T, C: Fn(&T, &T) -> Ordering> PartialEq for HeapEntry<'_, T, C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> Eq for HeapEntry<'_, T, C> {}

impl<T, C: Fn(&T, &T) -> Ordering> PartialOrd for HeapEntry<'_, T, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> Ord for HeapEntry<'_, T, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&other.item, &self.item)
            .then_with(|| other.source.cmp(&self.source))
    }
}

// ── Sizing ───────────────────────────────────────────────────────────────────

/// Run-file block size: an eighth of the budget, clamped to
/// [`BOUNDARY`, 2 MiB] and rounded down to the boundary.
fn run_block_bytes(mem_avail: u64) -> u64 {
    let boundary = osprey_stream::BOUNDARY;
    let target = (mem_avail / 8) / boundary * boundary;
    target.clamp(boundary, MAX_RUN_BLOCK_BYTES)
}

/// Double the buffer until the accounted usage exceeds the budget, then
/// binary-search the largest valid size between the last two probes.
fn choose_buffer_size<T: Serialize + DeserializeOwned>(
    mem_avail: u64,
    writer_reservation: u64,
    minimum_item_size: u64,
) -> OspreyResult<u64> {
    let budget = mem_avail.saturating_sub(writer_reservation);
    let usage = |b: u64| InternalSorter::<T>::memory_usage(b, b / minimum_item_size);
    if usage(MIN_BUFFER_BYTES) > budget {
        return Err(OspreyError::ResourceExhaustion(format!(
            "{mem_avail} bytes cannot hold a sort buffer and its run writer"
        )));
    }
    let mut lo = MIN_BUFFER_BYTES;
    while usage(lo * 2) <= budget {
        lo *= 2;
    }
    let mut hi = lo * 2;
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if usage(mid) <= budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asc(a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn sort_all(rt: &Runtime, mem: u64, input: &[u64]) -> (Vec<u64>, usize, usize) {
        let mut sorter = ExternalSorter::new(rt, mem, 12, asc).unwrap();
        for v in input {
            sorter.push(v).unwrap();
        }
        sorter.end().unwrap();
        let mut out = Vec::with_capacity(input.len());
        while sorter.can_pull() {
            out.push(sorter.pull().unwrap());
        }
        (out, sorter.initial_run_count(), sorter.merge_pass_count())
    }

    #[test]
    fn test_small_vector_8kib_budget() {
        let rt = Runtime::default();
        let input = [3u64, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5];
        let (out, _, _) = sort_all(&rt, 8 * 1024, &input);
        assert_eq!(out, vec![1, 1, 2, 3, 3, 4, 5, 5, 5, 6, 9]);
    }

    #[test]
    fn test_permutation_and_monotonic() {
        let rt = Runtime::default();
        // Deterministic pseudo-random input.
        let mut x = 0x2545f4914f6cdd1du64;
        let input: Vec<u64> = (0..20_000)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x % 10_000
            })
            .collect();
        let (out, initial_runs, passes) = sort_all(&rt, 32 * 1024, &input);
        assert!(initial_runs > 1, "budget was meant to force several runs");
        assert!(passes >= 1);
        let mut expected = input.clone();
        expected.sort_unstable();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_merge_pass_count_matches_fanout() {
        let rt = Runtime::default();
        let input: Vec<u64> = (0..30_000).rev().collect();
        let mem = 32 * 1024;
        let mut sorter = ExternalSorter::new(&rt, mem, 12, asc).unwrap();
        for v in &input {
            sorter.push(v).unwrap();
        }
        sorter.end().unwrap();
        let runs = sorter.initial_run_count();
        assert!(runs > 1);
        let fanout = sorter.fanout().unwrap();
        let expected_passes = (runs as f64).log(fanout as f64).ceil() as usize;
        assert_eq!(sorter.merge_pass_count(), expected_passes);
        // And the data still comes out sorted.
        let mut prev = 0u64;
        let mut n = 0u64;
        while sorter.can_pull() {
            let v = sorter.pull().unwrap();
            assert!(v >= prev);
            prev = v;
            n += 1;
        }
        assert_eq!(n, input.len() as u64);
    }

    #[test]
    fn test_stability_on_equal_keys() {
        let rt = Runtime::default();
        // Records compare by key only; payload records the input order.
        let input: Vec<(u8, u32)> = (0..5_000u32).map(|i| ((i % 7) as u8, i)).collect();
        let mut sorter = ExternalSorter::new(&rt, 16 * 1024, 10, |a: &(u8, u32), b: &(u8, u32)| {
            a.0.cmp(&b.0)
        })
        .unwrap();
        for v in &input {
            sorter.push(v).unwrap();
        }
        sorter.end().unwrap();
        assert!(sorter.initial_run_count() > 1);
        let mut prev: Option<(u8, u32)> = None;
        while sorter.can_pull() {
            let v: (u8, u32) = sorter.pull().unwrap();
            if let Some(p) = prev {
                assert!(p.0 < v.0 || (p.0 == v.0 && p.1 < v.1), "{p:?} then {v:?}");
            }
            prev = Some(v);
        }
    }

    #[test]
    fn test_empty_input() {
        let rt = Runtime::default();
        let (out, runs, passes) = sort_all(&rt, 64 * 1024, &[]);
        assert!(out.is_empty());
        assert_eq!(runs, 0);
        assert_eq!(passes, 0);
    }

    #[test]
    fn test_single_in_memory_run() {
        let rt = Runtime::default();
        let (out, runs, passes) = sort_all(&rt, 1 << 20, &[9, 2, 7, 2]);
        assert_eq!(out, vec![2, 2, 7, 9]);
        assert_eq!(runs, 1);
        assert_eq!(passes, 0);
    }

    #[test]
    fn test_tiny_budget_is_resource_exhaustion() {
        let rt = Runtime::default();
        let err = ExternalSorter::<u64, _>::new(&rt, 256, 12, asc).unwrap_err();
        assert!(matches!(err, OspreyError::ResourceExhaustion(_)));
    }

    #[test]
    fn test_oversized_record_is_resource_exhaustion() {
        let rt = Runtime::default();
        let mut sorter = ExternalSorter::new(&rt, 8 * 1024, 16, |a: &Vec<u8>, b: &Vec<u8>| {
            a.cmp(b)
        })
        .unwrap();
        let huge = vec![0u8; 64 * 1024];
        let err = sorter.push(&huge).unwrap_err();
        assert!(matches!(err, OspreyError::ResourceExhaustion(_)));
    }

    #[test]
    fn test_temp_files_removed_after_sort() {
        let rt = Runtime::default();
        let scratch_root;
        {
            let mut sorter = ExternalSorter::new(&rt, 16 * 1024, 12, asc).unwrap();
            scratch_root = sorter.scratch.path().to_path_buf();
            for v in (0..10_000u64).rev() {
                sorter.push(&v).unwrap();
            }
            sorter.end().unwrap();
            while sorter.can_pull() {
                sorter.pull().unwrap();
            }
        }
        assert!(!scratch_root.exists());
    }
}

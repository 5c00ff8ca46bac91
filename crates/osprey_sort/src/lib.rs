//! External merge sort.
//!
//! Two layers:
//!   - `internal`: the in-memory run former, a byte buffer receiving
//!     serialized records plus an index array sorted with a comparator that
//!     decodes records on demand
//!   - `sorter`: the external driver: run formation under a memory budget,
//!     bounded-fanout k-way merging through serialization streams, and a
//!     pull interface over the final run
//!
//! The sort is stable: equal records keep their input order through both
//! the stable in-memory sort and the source-index tie-break in the merge.

pub mod internal;
pub mod sorter;

pub use internal::InternalSorter;
pub use sorter::ExternalSorter;

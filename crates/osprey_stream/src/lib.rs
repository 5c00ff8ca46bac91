//! Block-oriented stream I/O.
//!
//! The layering, bottom up:
//!   - `file`: positioned read/write on one file with an advisory cache hint
//!   - `header`: the on-disk stream header (magic, version, geometry, seal)
//!   - `accessor`: header + user data + aligned block reads/writes
//!   - `stream`: the cursor, with sequential and random item access and one
//!     resident block
//!   - `serialization`: the variable-length-record variant (opaque 2 MiB
//!     blocks, framed records)
//!
//! Streams are single-owner: one cursor per open stream, no cross-thread or
//! cross-process sharing.

pub mod accessor;
pub mod file;
pub mod header;
pub mod serialization;
pub mod stream;

pub use accessor::StreamAccessor;
pub use file::{CacheHint, FileAccessor};
pub use header::{align_up, StreamHeader, BOUNDARY, FORMAT_VERSION};
pub use serialization::{SerializationReader, SerializationWriter};
pub use stream::{Element, Stream, StreamOptions};

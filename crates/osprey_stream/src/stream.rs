//! The block stream cursor.
//!
//! A `Stream<T>` is an open stream of fixed-size items with one resident
//! block and a cursor into it. Sequential reads and writes touch the disk
//! once per block; `seek_item` within the resident block only moves the
//! cursor. A dirty block is always flushed before it is evicted, on seek
//! out of range, truncate, and close.

use std::marker::PhantomData;
use std::path::Path;

use osprey_common::error::{OspreyResult, StreamError};
use osprey_common::Runtime;

use crate::accessor::{OpenParams, StreamAccessor};
use crate::file::CacheHint;
use crate::header::{align_up, StreamHeader, BOUNDARY, HEADER_BYTES, STREAM_MAGIC};

/// Fixed-size plain-data items a stream can hold.
///
/// Implementations encode little-endian so stream files are portable
/// between hosts.
pub trait Element: Copy + 'static {
    const BYTES: usize;
    fn store(&self, buf: &mut [u8]);
    fn load(buf: &[u8]) -> Self;
}

macro_rules! element_primitive {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const BYTES: usize = std::mem::size_of::<$t>();
            fn store(&self, buf: &mut [u8]) {
                buf[..Self::BYTES].copy_from_slice(&self.to_le_bytes());
            }
            fn load(buf: &[u8]) -> Self {
                <$t>::from_le_bytes(buf[..Self::BYTES].try_into().unwrap())
            }
        }
    )*};
}

element_primitive!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl<const N: usize> Element for [u8; N] {
    const BYTES: usize = N;
    fn store(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(self);
    }
    fn load(buf: &[u8]) -> Self {
        buf[..N].try_into().unwrap()
    }
}

/// Options for opening or creating a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Items per block. `None` means: derive from the configured block size
    /// hint when creating, accept the file's geometry when opening.
    pub block_items: Option<u64>,
    /// Bytes to reserve for user data (only meaningful when creating).
    pub max_user_data_size: u64,
    pub cache_hint: CacheHint,
    /// Override the configured `validate_cleanclose` policy.
    pub tolerate_unclean: Option<bool>,
}

struct Block {
    buf: Vec<u8>,
    number: u64,
    /// Valid items currently in the buffer.
    items: u64,
    dirty: bool,
}

/// An open stream of fixed-size items with a read/write/seek cursor.
pub struct Stream<T> {
    rt: Runtime,
    accessor: StreamAccessor,
    block: Block,
    /// Cursor position within the resident block, in items.
    index: u64,
    size: u64,
    read: bool,
    write: bool,
    accounted: u64,
    _marker: PhantomData<T>,
}

impl<T: Element> Stream<T> {
    /// Create a new stream for read/write, truncating any existing file.
    pub fn create(rt: &Runtime, path: &Path) -> OspreyResult<Self> {
        Self::create_with(rt, path, StreamOptions::default())
    }

    pub fn create_with(rt: &Runtime, path: &Path, options: StreamOptions) -> OspreyResult<Self> {
        let block_items = options.block_items.unwrap_or_else(|| {
            (rt.config().block_size_hint / T::BYTES as u64).max(1)
        });
        let params = Self::params(rt, block_items, &options);
        let accessor = StreamAccessor::create(path, &params)?;
        Self::from_accessor(rt, accessor, true, true)
    }

    /// Open an existing stream read-only.
    pub fn open_ro(rt: &Runtime, path: &Path) -> OspreyResult<Self> {
        Self::open_with(rt, path, true, false, StreamOptions::default())
    }

    /// Open an existing stream for reading and writing.
    pub fn open_rw(rt: &Runtime, path: &Path) -> OspreyResult<Self> {
        Self::open_with(rt, path, true, true, StreamOptions::default())
    }

    pub fn open_with(
        rt: &Runtime,
        path: &Path,
        read: bool,
        write: bool,
        options: StreamOptions,
    ) -> OspreyResult<Self> {
        let block_items = match options.block_items {
            Some(n) => n,
            // Accept whatever geometry the file has; item size and magic
            // are still validated.
            None => probe(path)?.block_items,
        };
        let params = Self::params(rt, block_items, &options);
        let accessor = StreamAccessor::open(path, read, write, &params)?;
        Self::from_accessor(rt, accessor, read, write)
    }

    fn params(rt: &Runtime, block_items: u64, options: &StreamOptions) -> OpenParams {
        OpenParams {
            magic: STREAM_MAGIC,
            item_size: T::BYTES as u64,
            block_items,
            max_user_data_size: options.max_user_data_size,
            cache_hint: options.cache_hint,
            tolerate_unclean: options
                .tolerate_unclean
                .unwrap_or(!rt.config().validate_cleanclose),
        }
    }

    fn from_accessor(
        rt: &Runtime,
        accessor: StreamAccessor,
        read: bool,
        write: bool,
    ) -> OspreyResult<Self> {
        let block_bytes = accessor.block_size();
        rt.memory().account(block_bytes)?;
        let size = accessor.size();
        let mut stream = Self {
            rt: rt.clone(),
            accessor,
            block: Block {
                buf: vec![0u8; block_bytes as usize],
                number: 0,
                items: 0,
                dirty: false,
            },
            index: 0,
            size,
            read,
            write,
            accounted: block_bytes,
            _marker: PhantomData,
        };
        stream.load_block(0)?;
        Ok(stream)
    }

    /// Memory held by an open stream with the given geometry: one block
    /// buffer plus the cursor bookkeeping.
    pub fn memory_usage(block_items: u64) -> u64 {
        align_up(block_items * T::BYTES as u64, BOUNDARY) + std::mem::size_of::<Self>() as u64
    }

    // ── Cursor operations needing the item codec ─────────────────────────────

    /// Read the item under the cursor and advance.
    pub fn read_item(&mut self) -> OspreyResult<T> {
        let slot = self.reading_slot()?;
        let v = T::load(&self.block.buf[slot..slot + T::BYTES]);
        self.index += 1;
        Ok(v)
    }

    /// Read the item under the cursor without advancing.
    pub fn peek(&mut self) -> OspreyResult<T> {
        let slot = self.reading_slot()?;
        Ok(T::load(&self.block.buf[slot..slot + T::BYTES]))
    }

    /// Position the resident block for a read at the cursor and return the
    /// byte offset of the cursor's slot.
    fn reading_slot(&mut self) -> OspreyResult<usize> {
        if !self.read {
            return Err(StreamError::Access("read on a write-only stream".into()).into());
        }
        if self.offset() >= self.size {
            return Err(StreamError::EndOfStream.into());
        }
        if self.index >= self.block.items {
            // Block exhausted mid-stream: move to the next one.
            self.flush_block()?;
            let next = self.block.number + 1;
            self.load_block(next)?;
            self.index = 0;
        }
        Ok((self.index as usize) * T::BYTES)
    }

    /// Write an item at the cursor and advance, growing the stream when the
    /// cursor is at the end.
    pub fn write_item(&mut self, item: T) -> OspreyResult<()> {
        if !self.write {
            return Err(StreamError::Access("write on a read-only stream".into()).into());
        }
        if self.index >= self.block_items() {
            self.flush_block()?;
            let next = self.block.number + 1;
            self.load_block(next)?;
            self.index = 0;
        }
        let slot = (self.index as usize) * T::BYTES;
        item.store(&mut self.block.buf[slot..slot + T::BYTES]);
        self.block.dirty = true;
        self.index += 1;
        self.block.items = self.block.items.max(self.index);
        self.size = self.size.max(self.offset());
        Ok(())
    }
}

impl<T> Stream<T> {
    // ── Observers ────────────────────────────────────────────────────────────

    /// Logical item count.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Cursor position in items from the start of the stream.
    pub fn offset(&self) -> u64 {
        self.block.number * self.block_items() + self.index
    }

    /// True while the cursor is before the end of the stream.
    pub fn can_read(&self) -> bool {
        self.offset() < self.size
    }

    pub fn path(&self) -> &Path {
        self.accessor.path()
    }

    pub fn byte_size(&self) -> u64 {
        self.accessor.byte_size()
    }

    pub fn user_data_size(&self) -> u64 {
        self.accessor.user_data_size()
    }

    pub fn max_user_data_size(&self) -> u64 {
        self.accessor.max_user_data_size()
    }

    fn block_items(&self) -> u64 {
        self.accessor.block_items()
    }

    // ── Cursor operations ────────────────────────────────────────────────────

    /// Move the cursor to item `item`; `item == size()` positions at the
    /// end for appending. O(1) when the target is in the resident block.
    pub fn seek_item(&mut self, item: u64) -> OspreyResult<()> {
        if item > self.size {
            return Err(StreamError::EndOfStream.into());
        }
        let bi = self.block_items();
        let target = item / bi;
        if target != self.block.number {
            self.flush_block()?;
            self.load_block(target)?;
        }
        self.index = item % bi;
        Ok(())
    }

    /// Drop all items beyond `items`.
    pub fn truncate(&mut self, items: u64) -> OspreyResult<()> {
        if !self.write {
            return Err(StreamError::Access("truncate on a read-only stream".into()).into());
        }
        let pos = self.offset().min(items);
        self.flush_block()?;
        self.accessor.truncate(items)?;
        self.size = self.accessor.size();
        self.load_block(pos / self.block_items())?;
        self.index = pos % self.block_items();
        Ok(())
    }

    pub fn read_user_data(&mut self, buf: &mut [u8]) -> OspreyResult<u64> {
        Ok(self.accessor.read_user_data(buf)?)
    }

    pub fn write_user_data(&mut self, data: &[u8]) -> OspreyResult<()> {
        Ok(self.accessor.write_user_data(data)?)
    }

    /// Flush, seal and release the stream.
    pub fn close(&mut self) -> OspreyResult<()> {
        if self.accessor.is_open() {
            self.flush_block()?;
            self.accessor.close()?;
            self.rt.memory().release(self.accounted);
            self.accounted = 0;
        }
        Ok(())
    }

    // ── Block management ─────────────────────────────────────────────────────

    fn flush_block(&mut self) -> OspreyResult<()> {
        if self.block.dirty {
            self.accessor
                .write_block(&self.block.buf, self.block.number, self.block.items)?;
            self.block.dirty = false;
        }
        Ok(())
    }

    /// Load block `number` into the buffer. The previous block must already
    /// be flushed. Blocks at or past the end of the stream start empty.
    fn load_block(&mut self, number: u64) -> OspreyResult<u64> {
        debug_assert!(!self.block.dirty, "loading over a dirty block");
        let first_item = number * self.block_items();
        let mut items = 0;
        if self.read && self.size > first_item {
            items = self
                .accessor
                .read_block(&mut self.block.buf, number, self.block_items())?;
        } else if !self.read && self.size > first_item {
            // Write-only streams overwrite whole blocks; existing items in
            // this block are unknown but counted so size stays correct.
            items = (self.size - first_item).min(self.block_items());
        }
        self.block.number = number;
        self.block.items = items;
        self.block.dirty = false;
        Ok(items)
    }
}

impl<T> Drop for Stream<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(path = %self.accessor.path().display(), %err, "stream close failed in drop");
        }
    }
}

/// Read just the header of a stream file without opening it.
pub fn probe(path: &Path) -> Result<StreamHeader, StreamError> {
    let mut file = crate::file::FileAccessor::open_ro(path, CacheHint::Normal)?;
    let mut buf = [0u8; HEADER_BYTES];
    file.read_at(0, &mut buf).map_err(|e| match e {
        StreamError::Io(_) => StreamError::Format("file too short for a header".into()),
        other => other,
    })?;
    StreamHeader::decode(&buf)
}

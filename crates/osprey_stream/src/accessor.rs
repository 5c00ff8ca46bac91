//! The stream accessor: header + user data + aligned block I/O.
//!
//! Sits between the raw file accessor and the item cursor. All block reads
//! and writes are aligned to `BOUNDARY` and padded to it on disk; the
//! logical item count can be smaller than what the allocated blocks hold
//! (partial tail block).

use std::path::{Path, PathBuf};

use osprey_common::error::StreamError;

use crate::file::{CacheHint, FileAccessor};
use crate::header::{StreamHeader, HEADER_BYTES};

/// Geometry and policy for opening or creating a stream.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub magic: [u8; 8],
    pub item_size: u64,
    pub block_items: u64,
    pub max_user_data_size: u64,
    pub cache_hint: CacheHint,
    /// Accept a stream whose header says the last close was unclean; its
    /// logical size is then recovered from the file length.
    pub tolerate_unclean: bool,
}

/// Header-aware block access to one stream file.
#[derive(Debug)]
pub struct StreamAccessor {
    file: FileAccessor,
    header: StreamHeader,
    path: PathBuf,
    read: bool,
    write: bool,
    /// Logical item count, kept up to date as blocks are written.
    size: u64,
    open: bool,
}

impl StreamAccessor {
    /// Create a new stream file (truncating any existing one).
    pub fn create(path: &Path, params: &OpenParams) -> Result<Self, StreamError> {
        let mut file = FileAccessor::open_rw_new(path, params.cache_hint)?;
        let header = StreamHeader::new(
            params.magic,
            params.item_size,
            params.block_items,
            params.max_user_data_size,
        );
        write_header_area(&mut file, &header, false)?;
        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
            read: true,
            write: true,
            size: 0,
            open: true,
        })
    }

    /// Open an existing stream, validating its header against `params`.
    pub fn open(
        path: &Path,
        read: bool,
        write: bool,
        params: &OpenParams,
    ) -> Result<Self, StreamError> {
        // The descriptor is always readable so the header can be loaded;
        // the logical `read` flag still gates block reads.
        let mut file = if write {
            FileAccessor::open_rw(path, params.cache_hint)?
        } else {
            FileAccessor::open_ro(path, params.cache_hint)?
        };

        let mut buf = [0u8; HEADER_BYTES];
        file.read_at(0, &mut buf)
            .map_err(|e| match e {
                StreamError::Io(_) => StreamError::Format("file too short for a header".into()),
                other => other,
            })?;
        let header = StreamHeader::decode(&buf)?;
        header.validate(params.magic, params.item_size, params.block_items)?;

        let size = if header.clean_close {
            header.size
        } else {
            if !params.tolerate_unclean {
                return Err(StreamError::UncleanClose(path.to_path_buf()));
            }
            recover_size(&header, file.size()?)
        };

        let mut accessor = Self {
            file,
            header,
            path: path.to_path_buf(),
            read,
            write,
            size,
            open: true,
        };
        if write {
            // Mark the stream busy until close seals it again.
            accessor.header.clean_close = false;
            write_header_area(&mut accessor.file, &accessor.header, false)?;
        }
        Ok(accessor)
    }

    // ── Observers ────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical item count.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn user_data_size(&self) -> u64 {
        self.header.user_data_size
    }

    pub fn max_user_data_size(&self) -> u64 {
        self.header.max_user_data_size
    }

    pub fn item_size(&self) -> u64 {
        self.header.item_size
    }

    pub fn block_items(&self) -> u64 {
        self.header.block_items
    }

    pub fn block_size(&self) -> u64 {
        self.header.block_size
    }

    pub fn header_size(&self) -> u64 {
        self.header.header_size()
    }

    /// On-disk footprint: header plus all allocated blocks, the partial
    /// tail block counted at full size.
    pub fn byte_size(&self) -> u64 {
        self.size.div_ceil(self.header.block_items) * self.header.block_size + self.header_size()
    }

    // ── Block I/O ────────────────────────────────────────────────────────────

    /// Read up to `item_count` items from the start of block `block_number`
    /// into `buf`. Returns the number of items actually read, which is less
    /// than requested at the end of the stream.
    pub fn read_block(
        &mut self,
        buf: &mut [u8],
        block_number: u64,
        item_count: u64,
    ) -> Result<u64, StreamError> {
        if !self.read {
            return Err(StreamError::Access("read on a write-only stream".into()));
        }
        debug_assert!(item_count <= self.header.block_items);
        let first_item = block_number * self.header.block_items;
        let available = self.size.saturating_sub(first_item);
        let items = item_count.min(available).min(self.header.block_items);
        if items == 0 {
            return Ok(0);
        }
        let bytes = (items * self.header.item_size) as usize;
        let offset = self.header_size() + block_number * self.header.block_size;
        self.file.read_at(offset, &mut buf[..bytes])?;
        Ok(items)
    }

    /// Write `item_count` items from `buf` to block `block_number`.
    ///
    /// Block slots are `BOUNDARY`-aligned regions of `block_size` bytes;
    /// only the valid items of a block are physically written, so the file
    /// length of a sequentially written stream encodes the exact item count
    /// of the partial tail block (this is what unclean-close recovery reads
    /// back).
    pub fn write_block(
        &mut self,
        buf: &[u8],
        block_number: u64,
        item_count: u64,
    ) -> Result<(), StreamError> {
        if !self.write {
            return Err(StreamError::Access("write on a read-only stream".into()));
        }
        debug_assert!(item_count <= self.header.block_items);
        let bytes = (item_count * self.header.item_size) as usize;
        let offset = self.header_size() + block_number * self.header.block_size;
        self.file.write_at(offset, &buf[..bytes])?;
        self.size = self.size.max(block_number * self.header.block_items + item_count);
        Ok(())
    }

    // ── User data ────────────────────────────────────────────────────────────

    /// Read user data into `buf`; returns the number of bytes read.
    pub fn read_user_data(&mut self, buf: &mut [u8]) -> Result<u64, StreamError> {
        let n = (buf.len() as u64).min(self.header.user_data_size);
        if n > 0 {
            self.file.read_at(HEADER_BYTES as u64, &mut buf[..n as usize])?;
        }
        Ok(n)
    }

    /// Write user data; `data` must fit in the reserved area.
    pub fn write_user_data(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if !self.write {
            return Err(StreamError::Access("write on a read-only stream".into()));
        }
        if data.len() as u64 > self.header.max_user_data_size {
            return Err(StreamError::Shape(format!(
                "{} bytes of user data exceed the {} reserved",
                data.len(),
                self.header.max_user_data_size
            )));
        }
        self.file.write_at(HEADER_BYTES as u64, data)?;
        self.header.user_data_size = data.len() as u64;
        Ok(())
    }

    // ── Truncate & close ─────────────────────────────────────────────────────

    /// Drop all items beyond `items` and shrink the file to the smallest
    /// size that still contains the remainder.
    pub fn truncate(&mut self, items: u64) -> Result<(), StreamError> {
        if !self.write {
            return Err(StreamError::Access("truncate on a read-only stream".into()));
        }
        let new_size = self.size.min(items);
        let full_blocks = new_size / self.header.block_items;
        let tail_items = new_size % self.header.block_items;
        let len = self.header_size()
            + full_blocks * self.header.block_size
            + tail_items * self.header.item_size;
        self.file.truncate(len)?;
        self.size = new_size;
        Ok(())
    }

    /// Seal the stream: record the final size and user-data length, set the
    /// clean-close flag, and release the file.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self.write {
            self.header.size = self.size;
            write_header_area(&mut self.file, &self.header, true)?;
        }
        self.file.close()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for StreamAccessor {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.close() {
                tracing::warn!(path = %self.path.display(), %err, "stream close failed in drop");
            }
        }
    }
}

/// Write the header prefix and zero the rest of the header area. The
/// user-data region is only zeroed when the file is fresh (`size == 0` and
/// no user data), so reopening does not wipe it.
fn write_header_area(
    file: &mut FileAccessor,
    header: &StreamHeader,
    clean: bool,
) -> Result<(), StreamError> {
    let mut h = header.clone();
    h.clean_close = clean;
    if header.user_data_size == 0 && header.size == 0 {
        let mut area = vec![0u8; header.header_size() as usize];
        area[..HEADER_BYTES].copy_from_slice(&h.encode());
        file.write_at(0, &area)?;
    } else {
        file.write_at(0, &h.encode())?;
    }
    file.flush()
}

fn recover_size(header: &StreamHeader, file_len: u64) -> u64 {
    let region = file_len.saturating_sub(header.header_size());
    let full_blocks = region / header.block_size;
    let tail_bytes = region % header.block_size;
    let tail_items = (tail_bytes / header.item_size).min(header.block_items);
    full_blocks * header.block_items + tail_items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::STREAM_MAGIC;

    fn params() -> OpenParams {
        OpenParams {
            magic: STREAM_MAGIC,
            item_size: 8,
            block_items: 4,
            max_user_data_size: 16,
            cache_hint: CacheHint::Sequential,
            tolerate_unclean: false,
        }
    }

    fn items_to_bytes(items: &[u64]) -> Vec<u8> {
        items.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_create_write_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        {
            let mut acc = StreamAccessor::create(&path, &params()).unwrap();
            acc.write_block(&items_to_bytes(&[1, 2, 3, 4]), 0, 4).unwrap();
            acc.write_block(&items_to_bytes(&[5, 6]), 1, 2).unwrap();
            assert_eq!(acc.size(), 6);
            acc.close().unwrap();
        }
        let mut acc = StreamAccessor::open(&path, true, false, &params()).unwrap();
        assert_eq!(acc.size(), 6);
        let mut buf = vec![0u8; 32];
        assert_eq!(acc.read_block(&mut buf, 0, 4).unwrap(), 4);
        assert_eq!(buf[..32], items_to_bytes(&[1, 2, 3, 4])[..]);
        // Tail block: asked for 4, only 2 remain.
        assert_eq!(acc.read_block(&mut buf, 1, 4).unwrap(), 2);
        assert_eq!(buf[..16], items_to_bytes(&[5, 6])[..]);
        assert_eq!(acc.read_block(&mut buf, 2, 4).unwrap(), 0);
    }

    #[test]
    fn test_byte_size_counts_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        let mut acc = StreamAccessor::create(&path, &params()).unwrap();
        // 10 items at 4 per block: three blocks of 4, 4, 2.
        for (i, chunk) in [[0u64, 1, 2, 3], [4, 5, 6, 7], [8, 9, 0, 0]].iter().enumerate() {
            let n = if i == 2 { 2 } else { 4 };
            acc.write_block(&items_to_bytes(chunk), i as u64, n).unwrap();
        }
        assert_eq!(acc.size(), 10);
        assert_eq!(acc.byte_size(), acc.header_size() + 3 * acc.block_size());
    }

    #[test]
    fn test_unclean_close_rejected_then_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        {
            let mut acc = StreamAccessor::create(&path, &params()).unwrap();
            acc.write_block(&items_to_bytes(&[1, 2, 3, 4]), 0, 4).unwrap();
            acc.write_block(&items_to_bytes(&[5, 6]), 1, 2).unwrap();
            // No close: header still says unclean.
            std::mem::forget(acc);
        }
        let err = StreamAccessor::open(&path, true, false, &params()).unwrap_err();
        assert!(matches!(err, StreamError::UncleanClose(_)));

        let tolerant = OpenParams {
            tolerate_unclean: true,
            ..params()
        };
        let acc = StreamAccessor::open(&path, true, false, &tolerant).unwrap();
        // One full block and a two-item tail, recovered from the file length.
        assert_eq!(acc.size(), 6);
    }

    #[test]
    fn test_wrong_magic_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        StreamAccessor::create(&path, &params()).unwrap().close().unwrap();
        let mut bad = params();
        bad.magic = *b"WRONGMAG";
        assert!(matches!(
            StreamAccessor::open(&path, true, false, &bad).unwrap_err(),
            StreamError::Format(_)
        ));
    }

    #[test]
    fn test_shape_mismatch_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        StreamAccessor::create(&path, &params()).unwrap().close().unwrap();
        let mut bad = params();
        bad.item_size = 4;
        assert!(matches!(
            StreamAccessor::open(&path, true, false, &bad).unwrap_err(),
            StreamError::Shape(_)
        ));
    }

    #[test]
    fn test_user_data_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        {
            let mut acc = StreamAccessor::create(&path, &params()).unwrap();
            acc.write_user_data(b"hello").unwrap();
            acc.close().unwrap();
        }
        let mut acc = StreamAccessor::open(&path, true, false, &params()).unwrap();
        assert_eq!(acc.user_data_size(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(acc.read_user_data(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_user_data_overflow_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        let mut acc = StreamAccessor::create(&path, &params()).unwrap();
        assert!(matches!(
            acc.write_user_data(&[0u8; 17]).unwrap_err(),
            StreamError::Shape(_)
        ));
    }

    #[test]
    fn test_truncate_drops_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.osp");
        {
            let mut acc = StreamAccessor::create(&path, &params()).unwrap();
            acc.write_block(&items_to_bytes(&[1, 2, 3, 4]), 0, 4).unwrap();
            acc.write_block(&items_to_bytes(&[5, 6, 7, 8]), 1, 4).unwrap();
            acc.truncate(3).unwrap();
            assert_eq!(acc.size(), 3);
            acc.close().unwrap();
        }
        let mut acc = StreamAccessor::open(&path, true, false, &params()).unwrap();
        assert_eq!(acc.size(), 3);
        let mut buf = vec![0u8; 32];
        assert_eq!(acc.read_block(&mut buf, 0, 4).unwrap(), 3);
        assert_eq!(buf[..24], items_to_bytes(&[1, 2, 3])[..]);
    }
}

//! Serialization streams: variable-length records on the block engine.
//!
//! Same header discipline as fixed-item streams (own magic, `size` counted
//! in bytes), but blocks are opaque byte arrays (2 MiB unless the creator
//! chose otherwise) and record boundaries are recovered by the reader.
//! Records are framed `[len: u32][bincode]`, little-endian. The writer is
//! write-only and the reader read-only; both hold exactly one resident
//! block.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use osprey_common::error::{OspreyResult, StreamError};
use osprey_common::Runtime;

use crate::accessor::{OpenParams, StreamAccessor};
use crate::file::CacheHint;
use crate::header::SERIALIZATION_MAGIC;
use crate::stream::probe;

/// Default block size: 2 MiB.
pub const BLOCK_BYTES: u64 = 2 * 1024 * 1024;

/// Frame overhead per record.
pub const RECORD_FRAME_BYTES: usize = 4;

fn params(block_bytes: u64) -> OpenParams {
    OpenParams {
        magic: SERIALIZATION_MAGIC,
        item_size: 1,
        block_items: block_bytes,
        max_user_data_size: 0,
        cache_hint: CacheHint::Sequential,
        tolerate_unclean: false,
    }
}

/// Encode one framed record.
pub fn encode_record<T: Serialize>(item: &T) -> OspreyResult<Vec<u8>> {
    let body = bincode::serialize(item)
        .map_err(|e| StreamError::Serialization(e.to_string()))?;
    let mut framed = Vec::with_capacity(RECORD_FRAME_BYTES + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode the body of a framed record.
pub fn decode_record<T: DeserializeOwned>(body: &[u8]) -> OspreyResult<T> {
    bincode::deserialize(body)
        .map_err(|e| StreamError::Serialization(e.to_string()).into())
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Write-only serialization stream.
pub struct SerializationWriter {
    rt: Runtime,
    accessor: StreamAccessor,
    block: Vec<u8>,
    block_bytes: u64,
    block_number: u64,
    /// Bytes used in the resident block.
    index: usize,
    accounted: u64,
}

impl SerializationWriter {
    /// Create a new serialization stream with the default block size.
    pub fn create(rt: &Runtime, path: &Path) -> OspreyResult<Self> {
        Self::create_with(rt, path, BLOCK_BYTES)
    }

    /// Create with an explicit block size (rounded up to the boundary by
    /// the header layer). Small blocks keep the reservation of short-lived
    /// streams, such as sort runs under a tight budget, proportionate.
    pub fn create_with(rt: &Runtime, path: &Path, block_bytes: u64) -> OspreyResult<Self> {
        let accessor = StreamAccessor::create(path, &params(block_bytes))?;
        let block_bytes = accessor.block_size();
        rt.memory().account(block_bytes)?;
        Ok(Self {
            rt: rt.clone(),
            accessor,
            block: vec![0u8; block_bytes as usize],
            block_bytes,
            block_number: 0,
            index: 0,
            accounted: block_bytes,
        })
    }

    /// Total bytes written so far.
    pub fn size(&self) -> u64 {
        self.block_number * self.block_bytes + self.index as u64
    }

    pub fn path(&self) -> &Path {
        self.accessor.path()
    }

    /// Append raw bytes, spilling full blocks as they fill.
    pub fn write(&mut self, mut data: &[u8]) -> OspreyResult<()> {
        while !data.is_empty() {
            if self.index == self.block_bytes as usize {
                self.flush_block()?;
            }
            let room = self.block_bytes as usize - self.index;
            let n = room.min(data.len());
            self.block[self.index..self.index + n].copy_from_slice(&data[..n]);
            self.index += n;
            data = &data[n..];
        }
        Ok(())
    }

    /// Append one framed record; returns its framed length in bytes.
    pub fn write_record<T: Serialize>(&mut self, item: &T) -> OspreyResult<usize> {
        let framed = encode_record(item)?;
        self.write(&framed)?;
        Ok(framed.len())
    }

    fn flush_block(&mut self) -> OspreyResult<()> {
        if self.index > 0 {
            self.accessor
                .write_block(&self.block[..self.index], self.block_number, self.index as u64)?;
            self.block_number += 1;
            self.index = 0;
        }
        Ok(())
    }

    /// Flush the partial tail block, seal the stream and release memory.
    pub fn close(&mut self) -> OspreyResult<()> {
        if self.accessor.is_open() {
            self.flush_block()?;
            self.accessor.close()?;
            self.rt.memory().release(self.accounted);
            self.accounted = 0;
        }
        Ok(())
    }

    /// Memory held by an open writer with the given block size.
    pub fn memory_usage(block_bytes: u64) -> u64 {
        block_bytes + std::mem::size_of::<Self>() as u64
    }
}

impl Drop for SerializationWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(path = %self.accessor.path().display(), %err,
                "serialization writer close failed in drop");
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Read-only serialization stream. The block size comes from the file's
/// header.
pub struct SerializationReader {
    rt: Runtime,
    accessor: StreamAccessor,
    block: Vec<u8>,
    block_bytes: u64,
    block_number: u64,
    /// Valid bytes in the resident block.
    block_len: usize,
    index: usize,
    size: u64,
    accounted: u64,
}

impl SerializationReader {
    pub fn open(rt: &Runtime, path: &Path) -> OspreyResult<Self> {
        let header = probe(path)?;
        if header.magic != SERIALIZATION_MAGIC {
            return Err(StreamError::Format("not a serialization stream".into()).into());
        }
        let accessor = StreamAccessor::open(path, true, false, &params(header.block_items))?;
        let block_bytes = accessor.block_size();
        rt.memory().account(block_bytes)?;
        let size = accessor.size();
        let mut reader = Self {
            rt: rt.clone(),
            accessor,
            block: vec![0u8; block_bytes as usize],
            block_bytes,
            block_number: 0,
            block_len: 0,
            index: 0,
            size,
            accounted: block_bytes,
        };
        reader.load_block(0)?;
        Ok(reader)
    }

    /// Total bytes in the stream.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Cursor position in bytes.
    pub fn offset(&self) -> u64 {
        self.block_number * self.block_bytes + self.index as u64
    }

    /// True while at least one more byte can be read.
    pub fn can_read(&self) -> bool {
        self.offset() < self.size
    }

    pub fn path(&self) -> &Path {
        self.accessor.path()
    }

    /// Read exactly `buf.len()` bytes, crossing blocks as needed.
    pub fn read(&mut self, buf: &mut [u8]) -> OspreyResult<()> {
        if self.offset() + buf.len() as u64 > self.size {
            return Err(StreamError::EndOfStream.into());
        }
        let mut filled = 0;
        while filled < buf.len() {
            if self.index == self.block_len {
                let next = self.block_number + 1;
                self.load_block(next)?;
            }
            let n = (self.block_len - self.index).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.block[self.index..self.index + n]);
            self.index += n;
            filled += n;
        }
        Ok(())
    }

    /// Read one framed record.
    pub fn read_record<T: DeserializeOwned>(&mut self) -> OspreyResult<T> {
        let mut len_buf = [0u8; RECORD_FRAME_BYTES];
        self.read(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.read(&mut body)?;
        decode_record(&body)
    }

    fn load_block(&mut self, number: u64) -> OspreyResult<()> {
        let valid = self
            .accessor
            .read_block(&mut self.block, number, self.block_bytes)?;
        self.block_number = number;
        self.block_len = valid as usize;
        self.index = 0;
        Ok(())
    }

    pub fn close(&mut self) -> OspreyResult<()> {
        if self.accessor.is_open() {
            self.accessor.close()?;
            self.rt.memory().release(self.accounted);
            self.accounted = 0;
        }
        Ok(())
    }

    /// Memory held by an open reader with the given block size.
    pub fn memory_usage(block_bytes: u64) -> u64 {
        block_bytes + std::mem::size_of::<Self>() as u64
    }
}

impl Drop for SerializationReader {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(path = %self.accessor.path().display(), %err,
                "serialization reader close failed in drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        key: u64,
        payload: String,
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.osp");
        let rt = Runtime::default();
        {
            let mut w = SerializationWriter::create(&rt, &path).unwrap();
            for i in 0..100u64 {
                w.write_record(&Record {
                    key: i,
                    payload: format!("value-{i}"),
                })
                .unwrap();
            }
            w.close().unwrap();
        }
        let mut r = SerializationReader::open(&rt, &path).unwrap();
        let mut n = 0u64;
        while r.can_read() {
            let rec: Record = r.read_record().unwrap();
            assert_eq!(rec.key, n);
            assert_eq!(rec.payload, format!("value-{n}"));
            n += 1;
        }
        assert_eq!(n, 100);
    }

    #[test]
    fn test_framed_length_includes_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.osp");
        let rt = Runtime::default();
        let mut w = SerializationWriter::create(&rt, &path).unwrap();
        let n = w.write_record(&7u64).unwrap();
        assert_eq!(n, RECORD_FRAME_BYTES + 8);
        assert_eq!(w.size(), n as u64);
    }

    #[test]
    fn test_read_past_end_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.osp");
        let rt = Runtime::default();
        {
            let mut w = SerializationWriter::create(&rt, &path).unwrap();
            w.write(b"abc").unwrap();
            w.close().unwrap();
        }
        let mut r = SerializationReader::open(&rt, &path).unwrap();
        let mut buf = [0u8; 4];
        assert!(r.read(&mut buf).unwrap_err().is_end_of_stream());
        let mut buf = [0u8; 3];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(!r.can_read());
    }

    #[test]
    fn test_fixed_stream_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixed.osp");
        let rt = Runtime::default();
        {
            let mut s: crate::stream::Stream<u64> =
                crate::stream::Stream::create(&rt, &path).unwrap();
            s.write_item(1).unwrap();
            s.close().unwrap();
        }
        match SerializationReader::open(&rt, &path).unwrap_err() {
            osprey_common::OspreyError::Stream(StreamError::Format(_)) => {}
            other => panic!("expected format error, got {other}"),
        }
    }

    #[test]
    fn test_small_blocks_span_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.osp");
        let rt = Runtime::default();
        // 4 KiB blocks; each record is ~1 KiB so records straddle blocks.
        let payload = vec![0xabu8; 1000];
        {
            let mut w = SerializationWriter::create_with(&rt, &path, 4096).unwrap();
            for _ in 0..20 {
                w.write_record(&payload).unwrap();
            }
            w.close().unwrap();
        }
        // The reader picks the block size up from the header.
        let mut r = SerializationReader::open(&rt, &path).unwrap();
        for _ in 0..20 {
            let rec: Vec<u8> = r.read_record().unwrap();
            assert_eq!(rec, payload);
        }
        assert!(!r.can_read());
    }

    #[test]
    fn test_large_records_span_default_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.osp");
        let rt = Runtime::default();
        // Each record is ~1 MiB so three of them cross block boundaries.
        let payload = vec![0xcdu8; 1 << 20];
        {
            let mut w = SerializationWriter::create(&rt, &path).unwrap();
            for _ in 0..3 {
                w.write_record(&payload).unwrap();
            }
            w.close().unwrap();
        }
        let mut r = SerializationReader::open(&rt, &path).unwrap();
        for _ in 0..3 {
            let rec: Vec<u8> = r.read_record().unwrap();
            assert_eq!(rec, payload);
        }
        assert!(!r.can_read());
    }
}

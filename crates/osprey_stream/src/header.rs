//! The on-disk stream header.
//!
//! Every osprey stream starts with a fixed little-endian header padded,
//! together with the reserved user-data area, to the 4096-byte boundary.
//! The header records the stream geometry and a `clean_close` seal byte;
//! everything after `header_size` bytes is block data.

use osprey_common::error::StreamError;

/// Alignment boundary for the header and all block I/O.
pub const BOUNDARY: u64 = 4096;

/// Magic identifying fixed-item streams.
pub const STREAM_MAGIC: [u8; 8] = *b"OSPRYSTM";

/// Magic identifying serialization (variable-length record) streams.
pub const SERIALIZATION_MAGIC: [u8; 8] = *b"OSPRYSER";

/// On-disk format version; checked for exact equality.
pub const FORMAT_VERSION: u64 = 1;

/// Encoded size of the fixed header prefix: eight u64 fields, the
/// clean-close byte, and reserved padding.
pub const HEADER_BYTES: usize = 80;

/// Round `x` up to the next multiple of `boundary`.
pub const fn align_up(x: u64, boundary: u64) -> u64 {
    (x + boundary - 1) / boundary * boundary
}

/// Offset of the first logical block for a stream reserving
/// `max_user_data` bytes of user data.
pub const fn header_size(max_user_data: u64) -> u64 {
    align_up(HEADER_BYTES as u64 + max_user_data, BOUNDARY)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub magic: [u8; 8],
    pub version: u64,
    /// Bytes per logical item (1 for serialization streams).
    pub item_size: u64,
    /// Bytes per block on disk; always a multiple of `BOUNDARY`.
    pub block_size: u64,
    /// Items per block.
    pub block_items: u64,
    /// Bytes reserved for user data.
    pub max_user_data_size: u64,
    /// Bytes of user data actually present.
    pub user_data_size: u64,
    /// Logical item count (byte count for serialization streams).
    pub size: u64,
    /// True when the last close flushed everything and sealed the stream.
    pub clean_close: bool,
}

impl StreamHeader {
    /// A fresh header for a new stream of the given geometry.
    pub fn new(magic: [u8; 8], item_size: u64, block_items: u64, max_user_data_size: u64) -> Self {
        Self {
            magic,
            version: FORMAT_VERSION,
            item_size,
            block_size: align_up(item_size * block_items, BOUNDARY),
            block_items,
            max_user_data_size,
            user_data_size: 0,
            size: 0,
            clean_close: false,
        }
    }

    /// Offset of the first logical block.
    pub fn header_size(&self) -> u64 {
        header_size(self.max_user_data_size)
    }

    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut buf = [0u8; HEADER_BYTES];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.item_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.block_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.block_items.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_user_data_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.user_data_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.size.to_le_bytes());
        buf[64] = self.clean_close as u8;
        buf
    }

    /// Decode a header prefix. Only structural checks happen here (the
    /// clean-close byte must be 0 or 1); identity checks are `validate`.
    pub fn decode(buf: &[u8; HEADER_BYTES]) -> Result<Self, StreamError> {
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[off..off + 8]);
            u64::from_le_bytes(b)
        };
        let clean_close = match buf[64] {
            0 => false,
            1 => true,
            other => {
                return Err(StreamError::Format(format!(
                    "clean-close byte must be 0 or 1, found {other}"
                )))
            }
        };
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        Ok(Self {
            magic,
            version: u64_at(8),
            item_size: u64_at(16),
            block_size: u64_at(24),
            block_items: u64_at(32),
            max_user_data_size: u64_at(40),
            user_data_size: u64_at(48),
            size: u64_at(56),
            clean_close,
        })
    }

    /// Check the header against what the caller expects of the stream:
    /// wrong magic is a format error, wrong version a version error, wrong
    /// geometry a shape error.
    pub fn validate(
        &self,
        magic: [u8; 8],
        item_size: u64,
        block_items: u64,
    ) -> Result<(), StreamError> {
        if self.magic != magic {
            return Err(StreamError::Format("bad magic".into()));
        }
        if self.version != FORMAT_VERSION {
            return Err(StreamError::Version {
                found: self.version,
                expected: FORMAT_VERSION,
            });
        }
        if self.item_size != item_size {
            return Err(StreamError::Shape(format!(
                "item size is {}, expected {item_size}",
                self.item_size
            )));
        }
        if self.block_items != block_items {
            return Err(StreamError::Shape(format!(
                "block holds {} items, expected {block_items}",
                self.block_items
            )));
        }
        if self.block_size != align_up(self.item_size * self.block_items, BOUNDARY) {
            return Err(StreamError::Shape(format!(
                "block size {} is not the padded size of {} items",
                self.block_size, self.block_items
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_header_size_is_boundary_multiple() {
        assert_eq!(header_size(0), 4096);
        assert_eq!(header_size(4000), 4096);
        assert_eq!(header_size(4096), 8192);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut h = StreamHeader::new(STREAM_MAGIC, 8, 512, 64);
        h.size = 1_000_000;
        h.user_data_size = 10;
        h.clean_close = true;
        let decoded = StreamHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_block_size_is_padded() {
        let h = StreamHeader::new(STREAM_MAGIC, 8, 4, 0);
        assert_eq!(h.block_size, 4096);
        let h = StreamHeader::new(STREAM_MAGIC, 8, 1024, 0);
        assert_eq!(h.block_size, 8192);
    }

    #[test]
    fn test_validate_rejects_wrong_magic() {
        let h = StreamHeader::new(SERIALIZATION_MAGIC, 8, 512, 0);
        assert!(matches!(
            h.validate(STREAM_MAGIC, 8, 512).unwrap_err(),
            StreamError::Format(_)
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let mut h = StreamHeader::new(STREAM_MAGIC, 8, 512, 0);
        h.version = 2;
        assert!(matches!(
            h.validate(STREAM_MAGIC, 8, 512).unwrap_err(),
            StreamError::Version {
                found: 2,
                expected: FORMAT_VERSION
            }
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_shape() {
        let h = StreamHeader::new(STREAM_MAGIC, 8, 512, 0);
        assert!(matches!(
            h.validate(STREAM_MAGIC, 4, 512).unwrap_err(),
            StreamError::Shape(_)
        ));
        assert!(matches!(
            h.validate(STREAM_MAGIC, 8, 256).unwrap_err(),
            StreamError::Shape(_)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_seal_byte() {
        let h = StreamHeader::new(STREAM_MAGIC, 8, 512, 0);
        let mut buf = h.encode();
        buf[64] = 7;
        assert!(matches!(
            StreamHeader::decode(&buf).unwrap_err(),
            StreamError::Format(_)
        ));
    }
}

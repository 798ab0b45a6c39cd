//! On-log wire format: varint/fixed codecs, block handles, the footer, and
//! the optional per-block trailer.
//!
//! Everything is little-endian. The index log is laid out, low address to
//! high, as `[filter][index]` pairs per table, then one meta-index block per
//! epoch, then the root block, then a fixed-size footer:
//!
//! ```text
//! [root_handle varint][reserved_handle varint][pad][version u8][magic u64]
//! ```
//!
//! A block handle's `size` covers the (possibly compressed) payload only.
//! When checksums or compression are enabled a 5-byte trailer follows each
//! block: one compression-type byte plus a crc32c over the stored payload.

use crate::error::{Error, Result};
use crate::options::Compression;

pub const MAGIC: u64 = 0xdb47_7524_8b80_fb57;
pub const FORMAT_VERSION: u8 = 1;

/// Two maximal varint64 handles (2 x 20 bytes, one byte of the second
/// handle's pad repurposed for the version), then the magic.
pub const FOOTER_SIZE: usize = 48;

pub const BLOCK_TRAILER_SIZE: usize = 5;

pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_SNAPPY: u8 = 1;

pub fn put_varint32(buf: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn put_varint64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode a varint32 at `input[*offset]`, advancing the offset.
pub fn get_varint32(input: &[u8], offset: &mut usize) -> Result<u32> {
    let mut shift = 0u32;
    let mut value = 0u32;
    while shift <= 28 {
        let byte = *input
            .get(*offset)
            .ok_or(Error::Corruption("truncated varint32"))?;
        *offset += 1;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::Corruption("varint32 overflow"))
}

pub fn get_varint64(input: &[u8], offset: &mut usize) -> Result<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while shift <= 63 {
        let byte = *input
            .get(*offset)
            .ok_or(Error::Corruption("truncated varint64"))?;
        *offset += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::Corruption("varint64 overflow"))
}

pub fn put_fixed32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn get_fixed32(input: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = input
        .get(..4)
        .ok_or(Error::Corruption("truncated fixed32"))?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(bytes))
}

/// A byte range within one of the two logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    pub fn decode_from(input: &[u8], offset: &mut usize) -> Result<Self> {
        let off = get_varint64(input, offset)?;
        let size = get_varint64(input, offset)?;
        Ok(Self { offset: off, size })
    }
}

/// Meta-index entry value: where a table's index and filter blocks live,
/// plus the filter wire-type code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableHandle {
    pub index: BlockHandle,
    pub filter: BlockHandle,
    pub filter_type: u8,
}

impl TableHandle {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        self.index.encode_into(buf);
        self.filter.encode_into(buf);
        buf.push(self.filter_type);
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let index = BlockHandle::decode_from(input, &mut offset)?;
        let filter = BlockHandle::decode_from(input, &mut offset)?;
        let filter_type = *input
            .get(offset)
            .ok_or(Error::Corruption("truncated table handle"))?;
        Ok(Self {
            index,
            filter,
            filter_type,
        })
    }
}

/// Trailing record of the index log; locates the root block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub root: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.root.encode_into(&mut buf);
        BlockHandle::default().encode_into(&mut buf); // reserved
        buf.resize(FOOTER_SIZE - 9, 0);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.try_into().expect("footer is fixed-size")
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() != FOOTER_SIZE {
            return Err(Error::Corruption("bad footer size"));
        }
        let magic = u64::from_le_bytes(input[FOOTER_SIZE - 8..].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::Corruption("bad footer magic"));
        }
        if input[FOOTER_SIZE - 9] != FORMAT_VERSION {
            return Err(Error::Corruption("unsupported format version"));
        }
        let mut offset = 0;
        let root = BlockHandle::decode_from(input, &mut offset)?;
        let _reserved = BlockHandle::decode_from(input, &mut offset)?;
        Ok(Self { root })
    }
}

/// Append a finished block payload to `out`, compressing if asked, and
/// follow it with a trailer when `trailer` is set. Returns the stored
/// payload size, i.e. what goes into the block's handle.
pub fn seal_block(
    payload: &[u8],
    compression: Compression,
    force_compression: bool,
    trailer: bool,
    out: &mut Vec<u8>,
) -> Result<u64> {
    let (ctype, stored): (u8, std::borrow::Cow<'_, [u8]>) = match compression {
        Compression::None => (COMPRESSION_NONE, payload.into()),
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(payload)
                .map_err(|e| Error::Io(e.to_string()))?;
            // Keep snappy output only when it actually shrinks the block,
            // unless the caller insists.
            if force_compression || compressed.len() < payload.len() - payload.len() / 8 {
                (COMPRESSION_SNAPPY, compressed.into())
            } else {
                (COMPRESSION_NONE, payload.into())
            }
        }
    };
    out.extend_from_slice(&stored);
    if trailer {
        out.push(ctype);
        put_fixed32(out, crc32c::crc32c(&stored));
    }
    Ok(stored.len() as u64)
}

/// Inverse of [`seal_block`]: `raw` must hold the stored payload followed by
/// the trailer when one is present. Returns the decoded block contents.
pub fn open_block(raw: &[u8], trailer: bool, verify_checksums: bool) -> Result<Vec<u8>> {
    let payload = if trailer {
        if raw.len() < BLOCK_TRAILER_SIZE {
            return Err(Error::Corruption("block shorter than its trailer"));
        }
        let payload_end = raw.len() - BLOCK_TRAILER_SIZE;
        let payload = &raw[..payload_end];
        let ctype = raw[payload_end];
        if verify_checksums {
            let expected = get_fixed32(&raw[payload_end + 1..])?;
            if crc32c::crc32c(payload) != expected {
                return Err(Error::Corruption("block checksum mismatch"));
            }
        }
        match ctype {
            COMPRESSION_NONE => payload.to_vec(),
            COMPRESSION_SNAPPY => snap::raw::Decoder::new()
                .decompress_vec(payload)
                .map_err(|_| Error::Corruption("snappy decode failure"))?,
            _ => return Err(Error::Corruption("unknown compression type")),
        }
    } else {
        raw.to_vec()
    };
    Ok(payload)
}

/// Stored length of a block given its handle, trailer included.
pub fn stored_block_len(handle: &BlockHandle, trailer: bool) -> u64 {
    if trailer {
        handle.size + BLOCK_TRAILER_SIZE as u64
    } else {
        handle.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        let mut buf = Vec::new();
        let values = [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX];
        for v in values {
            put_varint64(&mut buf, v);
        }
        let mut offset = 0;
        for v in values {
            assert_eq!(get_varint64(&buf, &mut offset).unwrap(), v);
        }
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn varint_truncation_is_corruption() {
        let mut buf = Vec::new();
        put_varint64(&mut buf, 1 << 40);
        buf.pop();
        let mut offset = 0;
        assert!(get_varint64(&buf, &mut offset).is_err());
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            root: BlockHandle::new(123456, 789),
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.root, footer.root);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let mut encoded = Footer::default().encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Footer::decode(&encoded).is_err());
    }

    #[test]
    fn table_handle_roundtrip() {
        let th = TableHandle {
            index: BlockHandle::new(10, 20),
            filter: BlockHandle::new(30, 0),
            filter_type: 2,
        };
        let mut buf = Vec::new();
        th.encode_into(&mut buf);
        assert_eq!(TableHandle::decode(&buf).unwrap(), th);
    }

    #[test]
    fn sealed_block_roundtrip_with_trailer() {
        let payload = b"hello block".repeat(16);
        let mut out = Vec::new();
        let size = seal_block(&payload, Compression::None, false, true, &mut out).unwrap();
        assert_eq!(size as usize, payload.len());
        assert_eq!(out.len(), payload.len() + BLOCK_TRAILER_SIZE);
        let decoded = open_block(&out, true, true).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn sealed_block_detects_flipped_bit() {
        let payload = b"hello block".repeat(16);
        let mut out = Vec::new();
        seal_block(&payload, Compression::None, false, true, &mut out).unwrap();
        out[3] ^= 1;
        assert!(open_block(&out, true, true).is_err());
        // Without verification the flip goes unnoticed.
        assert!(open_block(&out, true, false).is_ok());
    }

    #[test]
    fn snappy_shrinks_repetitive_blocks() {
        let payload = vec![7u8; 4096];
        let mut out = Vec::new();
        let size = seal_block(&payload, Compression::Snappy, false, true, &mut out).unwrap();
        assert!(size < payload.len() as u64);
        let decoded = open_block(&out, true, true).unwrap();
        assert_eq!(decoded, payload);
    }
}

//! Prefix-compressed key/value blocks with restart points.
//!
//! Entry layout: `varint32(shared) varint32(unshared) varint32(value_len)`
//! followed by the unshared key suffix and the value. Every Rth entry is a
//! restart whose key is stored whole; the block ends with the restart offset
//! array (fixed32 LE each) and the restart count (fixed32 LE).

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::format::{get_varint32, put_fixed32, put_varint32};

pub const DEFAULT_RESTART_INTERVAL: usize = 16;

pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: vec![0],
            restart_interval: restart_interval.max(1),
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Append an entry. Keys must arrive in non-decreasing order; equal keys
    /// are allowed (multi-map tables).
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.is_empty() || key >= self.last_key.as_slice());

        let shared = if self.counter >= self.restart_interval {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, unshared as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Serialized size if the block were finished now, restart footer
    /// included.
    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append the restart array and count; the returned slice is the block
    /// payload. The builder stays allocated for reuse via [`reset`].
    ///
    /// [`reset`]: BlockBuilder::reset
    pub fn finish(&mut self) -> &[u8] {
        debug_assert!(!self.finished);
        for restart in &self.restarts {
            put_fixed32(&mut self.buf, *restart);
        }
        put_fixed32(&mut self.buf, self.restarts.len() as u32);
        self.finished = true;
        &self.buf
    }

    /// Clear contents but keep the allocations.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// An immutable, decoded block.
#[derive(Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too small"));
        }
        let num_restarts = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        let footer = 4usize + (num_restarts as usize) * 4;
        if footer > data.len() {
            return Err(Error::Corruption("bad restart count"));
        }
        Ok(Self {
            restart_offset: data.len() - footer,
            num_restarts,
            data,
        })
    }

    fn restart_point(&self, index: u32) -> usize {
        let at = self.restart_offset + index as usize * 4;
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap()) as usize
    }

    pub fn iter(&self) -> BlockIter {
        BlockIter::new(self.clone())
    }
}

/// Entry cursor over a [`Block`]. Call [`seek`] or [`seek_to_first`], then
/// [`next`] repeatedly; `key`/`value` are valid after `next` returns true.
///
/// [`seek`]: BlockIter::seek
/// [`seek_to_first`]: BlockIter::seek_to_first
/// [`next`]: BlockIter::next
pub struct BlockIter {
    block: Block,
    offset: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    valid: bool,
}

impl BlockIter {
    fn new(block: Block) -> Self {
        Self {
            block,
            offset: 0,
            key: Vec::new(),
            value_range: (0, 0),
            valid: false,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.offset = 0;
        self.key.clear();
        self.valid = false;
    }

    /// Position so the next [`next`](BlockIter::next) yields the first entry
    /// with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search restart points for the last restart whose key is
        // < target, then scan forward from there.
        let mut left = 0u32;
        let mut right = self.block.num_restarts;
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.restart_key(mid)?;
            if key.as_slice() < target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        let restart = left.saturating_sub(1);
        self.offset = self.block.restart_point(restart);
        self.key.clear();
        self.valid = false;

        // Scan entries below target; stop right before the first >= target.
        loop {
            let before = (self.offset, self.key.clone());
            if !self.next()? {
                return Ok(());
            }
            if self.key.as_slice() >= target {
                self.offset = before.0;
                self.key = before.1;
                self.valid = false;
                return Ok(());
            }
        }
    }

    fn restart_key(&self, index: u32) -> Result<Vec<u8>> {
        let mut offset = self.block.restart_point(index);
        let data = &self.block.data[..self.block.restart_offset];
        let shared = get_varint32(data, &mut offset)? as usize;
        let unshared = get_varint32(data, &mut offset)? as usize;
        let _value_len = get_varint32(data, &mut offset)?;
        if shared != 0 {
            return Err(Error::Corruption("restart entry has shared prefix"));
        }
        data.get(offset..offset + unshared)
            .map(|k| k.to_vec())
            .ok_or(Error::Corruption("restart key out of bounds"))
    }

    /// Advance to the next entry; false at the end of the block.
    pub fn next(&mut self) -> Result<bool> {
        if self.offset >= self.block.restart_offset {
            self.valid = false;
            return Ok(false);
        }
        let data = &self.block.data[..self.block.restart_offset];
        let mut offset = self.offset;
        let shared = get_varint32(data, &mut offset)? as usize;
        let unshared = get_varint32(data, &mut offset)? as usize;
        let value_len = get_varint32(data, &mut offset)? as usize;
        if shared > self.key.len() || offset + unshared + value_len > data.len() {
            return Err(Error::Corruption("block entry out of bounds"));
        }
        self.key.truncate(shared);
        self.key.extend_from_slice(&data[offset..offset + unshared]);
        self.value_range = (offset + unshared, offset + unshared + value_len);
        self.offset = offset + unshared + value_len;
        self.valid = true;
        Ok(true)
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_range.0..self.value_range.1]
    }
}

//! Append-only in-memory write buffer.
//!
//! Records land as `varint(klen) key varint(vlen) value` in one flat byte
//! buffer; a side vector keeps each record's starting offset. Sorting moves
//! the offsets only, never the bytes. The sort is stable on the key so
//! duplicate keys keep insertion order (multi-map mode depends on this).

use crate::error::Result;
use crate::format::{get_varint32, put_varint32};

#[derive(Default)]
pub struct WriteBuffer {
    buffer: Vec<u8>,
    offsets: Vec<u32>,
    num_entries: u32,
    finished: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size for an expected load.
    pub fn reserve(&mut self, num_entries: u32, buffer_size: usize) {
        self.offsets.reserve(num_entries as usize);
        self.buffer.reserve(buffer_size);
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        self.offsets.push(self.buffer.len() as u32);
        put_varint32(&mut self.buffer, key.len() as u32);
        self.buffer.extend_from_slice(key);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(value);
        self.num_entries += 1;
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn current_buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Real memory footprint, capacity included.
    pub fn memory_usage(&self) -> usize {
        self.buffer.capacity() + self.offsets.capacity() * 4
    }

    /// Mark the buffer complete without sorting (producer inserted keys in
    /// order already).
    pub fn finish(&mut self) {
        debug_assert!(!self.finished);
        self.finished = true;
    }

    /// Sort records by key, stable on insertion order, then mark complete.
    pub fn finish_and_sort(&mut self) {
        debug_assert!(!self.finished);
        let buffer = &self.buffer;
        self.offsets
            .sort_by(|&a, &b| key_at(buffer, a).cmp(key_at(buffer, b)));
        self.finished = true;
    }

    /// Iterate records in (sorted) offset order.
    pub fn iter(&self) -> WriteBufferIter<'_> {
        debug_assert!(self.finished);
        WriteBufferIter {
            buffer: &self.buffer,
            offsets: &self.offsets,
            pos: 0,
        }
    }

    /// Drop contents but keep allocations for the next fill.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
        self.num_entries = 0;
        self.finished = false;
    }
}

fn key_at(buffer: &[u8], offset: u32) -> &[u8] {
    let mut pos = offset as usize;
    let klen = get_varint32(buffer, &mut pos).expect("buffer offsets are trusted") as usize;
    &buffer[pos..pos + klen]
}

pub struct WriteBufferIter<'a> {
    buffer: &'a [u8],
    offsets: &'a [u32],
    pos: usize,
}

impl<'a> Iterator for WriteBufferIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let &offset = self.offsets.get(self.pos)?;
        self.pos += 1;
        let mut at = offset as usize;
        let record = decode_record(self.buffer, &mut at).expect("buffer offsets are trusted");
        Some(record)
    }
}

fn decode_record<'a>(buffer: &'a [u8], pos: &mut usize) -> Result<(&'a [u8], &'a [u8])> {
    let klen = get_varint32(buffer, pos)? as usize;
    let key = &buffer[*pos..*pos + klen];
    *pos += klen;
    let vlen = get_varint32(buffer, pos)? as usize;
    let value = &buffer[*pos..*pos + vlen];
    *pos += vlen;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_key() {
        let mut buf = WriteBuffer::new();
        for i in [3u64, 2, 1, 5, 4] {
            buf.add(&i.to_be_bytes(), format!("v{i}").as_bytes());
        }
        buf.finish_and_sort();
        assert_eq!(buf.num_entries(), 5);

        let keys: Vec<u64> = buf
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k.try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn iteration_is_a_permutation_of_inputs() {
        let mut buf = WriteBuffer::new();
        let mut expected: Vec<(Vec<u8>, Vec<u8>)> = (0..500u32)
            .map(|i| {
                let k = format!("k{:05}", (i * 7919) % 500).into_bytes();
                let v = format!("value-{i}").into_bytes();
                (k, v)
            })
            .collect();
        for (k, v) in &expected {
            buf.add(k, v);
        }
        buf.finish_and_sort();

        let mut seen: Vec<(Vec<u8>, Vec<u8>)> =
            buf.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        assert_eq!(seen.len(), expected.len());
        // Same multiset, non-decreasing keys.
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn duplicates_keep_insertion_order() {
        let mut buf = WriteBuffer::new();
        buf.add(b"k1", b"first");
        buf.add(b"k0", b"zero");
        buf.add(b"k1", b"second");
        buf.add(b"k1", b"third");
        buf.finish_and_sort();

        let values: Vec<&[u8]> = buf
            .iter()
            .filter(|(k, _)| *k == b"k1")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![&b"first"[..], b"second", b"third"]);
    }

    #[test]
    fn finish_without_sort_keeps_order() {
        let mut buf = WriteBuffer::new();
        buf.add(b"b", b"1");
        buf.add(b"a", b"2");
        buf.finish();
        let keys: Vec<&[u8]> = buf.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"b"[..], b"a"]);
    }

    #[test]
    fn reset_reuses_capacity() {
        let mut buf = WriteBuffer::new();
        buf.reserve(100, 4096);
        buf.add(b"k", b"v");
        buf.finish_and_sort();
        let usage = buf.memory_usage();
        buf.reset();
        assert_eq!(buf.num_entries(), 0);
        assert_eq!(buf.current_buffer_size(), 0);
        assert_eq!(buf.memory_usage(), usage);
        buf.add(b"k2", b"v2");
        buf.finish_and_sort();
        assert_eq!(buf.iter().count(), 1);
    }
}

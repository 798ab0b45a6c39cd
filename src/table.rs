//! Table logger: turns a stream of sorted records into block-structured
//! tables grouped into epochs, across a data log and an index log.
//!
//! Data blocks are staged in a `block_batch_size` buffer and pushed to the
//! data sink in batches; block handles are computed against the sink's
//! logical offset plus the batch position, so they are final the moment a
//! block is sealed. `end_table` finalises the filter and index blocks,
//! `make_epoch` the meta-index block, `finish` the root block and footer.
//!
//! The first failed sink write latches the status; every later mutation is
//! a no-op that reports the latched error. `finish` is idempotent.

use std::sync::Arc;

use crate::block::{BlockBuilder, DEFAULT_RESTART_INTERVAL};
use crate::error::{Error, Result};
use crate::format::{put_fixed32, seal_block, BlockHandle, Footer, TableHandle};
use crate::log::LogSink;
use crate::options::{Compression, DirOptions};

/// Cumulative output totals. "Final" sizes include trailers and
/// compression; plain sizes are raw block contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub final_data_size: u64,
    pub data_size: u64,
    pub final_meta_index_size: u64,
    pub meta_index_size: u64,
    pub final_index_size: u64,
    pub index_size: u64,
    pub final_filter_size: u64,
    pub filter_size: u64,
    pub value_size: u64,
    pub key_size: u64,

    pub num_keys: u64,
    pub num_dropped_keys: u64,
    pub num_data_blocks: u64,
    pub num_tables: u32,
    pub num_epochs: u32,
}

pub(crate) struct TableLogger {
    block_size: usize,
    block_util: f64,
    block_batch_size: usize,
    compression: Compression,
    force_compression: bool,
    trailers: bool,
    rotation: bool,

    status: Option<Error>,
    finished: bool,

    data_block: BlockBuilder,
    indx_block: BlockBuilder,
    meta_block: BlockBuilder,
    root_block: BlockBuilder,

    pending_indx_entry: bool,
    pending_indx_handle: BlockHandle,

    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    last_key: Vec<u8>,
    table_has_keys: bool,

    data_batch: Vec<u8>,
    num_tables: u32, // within the current epoch
    num_epochs: u32,

    data_sink: Arc<LogSink>,
    indx_sink: Arc<LogSink>,

    stats: OutputStats,
}

impl TableLogger {
    pub fn new(options: &DirOptions, data_sink: Arc<LogSink>, indx_sink: Arc<LogSink>) -> Self {
        Self {
            block_size: options.block_size,
            block_util: options.block_util,
            block_batch_size: options.block_batch_size,
            compression: options.compression,
            force_compression: options.force_compression,
            trailers: options.block_trailers(),
            rotation: options.epoch_log_rotation,
            status: None,
            finished: false,
            data_block: BlockBuilder::new(DEFAULT_RESTART_INTERVAL),
            indx_block: BlockBuilder::new(1),
            meta_block: BlockBuilder::new(1),
            root_block: BlockBuilder::new(1),
            pending_indx_entry: false,
            pending_indx_handle: BlockHandle::default(),
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            last_key: Vec::new(),
            table_has_keys: false,
            data_batch: Vec::with_capacity(options.block_batch_size + options.block_size),
            num_tables: 0,
            num_epochs: 0,
            data_sink,
            indx_sink,
            stats: OutputStats::default(),
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_none()
    }

    pub fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }

    pub fn output_stats(&self) -> OutputStats {
        self.stats
    }

    pub fn record_dropped_key(&mut self) {
        self.stats.num_dropped_keys += 1;
    }

    /// Append one record to the current table. Keys must arrive in
    /// non-decreasing order within a table.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        if !self.ok() || self.finished {
            return;
        }
        if self.pending_indx_entry {
            // The sealed block's separator only becomes computable once the
            // next key is known.
            let separator = shortest_separator(&self.last_key, key);
            self.commit_pending_index_entry(&separator);
        }
        if !self.table_has_keys {
            self.smallest_key.clear();
            self.smallest_key.extend_from_slice(key);
            self.table_has_keys = true;
        }
        self.largest_key.clear();
        self.largest_key.extend_from_slice(key);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        self.stats.key_size += key.len() as u64;
        self.stats.value_size += value.len() as u64;
        self.stats.num_keys += 1;

        self.data_block.add(key, value);
        let threshold = (self.block_size as f64 * self.block_util) as usize;
        if self.data_block.current_size_estimate() >= threshold {
            self.end_block();
        }
    }

    /// Seal the current data block into the batch and leave its index entry
    /// pending.
    fn end_block(&mut self) {
        if !self.ok() || self.data_block.is_empty() {
            return;
        }
        debug_assert!(!self.pending_indx_entry);
        let offset = self.data_sink.ltell() + self.data_batch.len() as u64;
        let payload_len = {
            let payload = self.data_block.finish();
            self.stats.data_size += payload.len() as u64;
            let before = self.data_batch.len();
            // Data blocks are stored raw; only the trailer is added.
            let sealed = seal_block(
                payload,
                Compression::None,
                false,
                self.trailers,
                &mut self.data_batch,
            );
            match sealed {
                Ok(len) => {
                    self.stats.final_data_size += (self.data_batch.len() - before) as u64;
                    len
                }
                Err(err) => {
                    self.status = Some(err);
                    return;
                }
            }
        };
        self.data_block.reset();
        self.stats.num_data_blocks += 1;
        self.pending_indx_handle = BlockHandle::new(offset, payload_len);
        self.pending_indx_entry = true;

        if self.data_batch.len() >= self.block_batch_size {
            self.commit_data_batch();
        }
    }

    fn commit_pending_index_entry(&mut self, separator: &[u8]) {
        let mut encoded = Vec::with_capacity(20);
        self.pending_indx_handle.encode_into(&mut encoded);
        self.indx_block.add(separator, &encoded);
        self.pending_indx_entry = false;
    }

    fn commit_data_batch(&mut self) {
        if self.data_batch.is_empty() {
            return;
        }
        let result = self.data_sink.append(&self.data_batch);
        self.data_batch.clear();
        if let Err(err) = result {
            if self.status.is_none() {
                self.status = Some(err);
            }
        }
    }

    /// Write a finished block payload to the index log and return its
    /// handle. `compressed` selects the directory's compression; filter
    /// blocks and the footer go raw.
    fn write_index_block(&mut self, payload: &[u8], compressed: bool) -> BlockHandle {
        let compression = if compressed {
            self.compression
        } else {
            Compression::None
        };
        let mut sealed = Vec::with_capacity(payload.len() + 8);
        let stored =
            match seal_block(
                payload,
                compression,
                self.force_compression,
                self.trailers,
                &mut sealed,
            ) {
                Ok(len) => len,
                Err(err) => {
                    self.status = Some(err);
                    return BlockHandle::default();
                }
            };
        match self.indx_sink.append(&sealed) {
            Ok(offset) => BlockHandle::new(offset, stored),
            Err(err) => {
                if self.status.is_none() {
                    self.status = Some(err);
                }
                BlockHandle::default()
            }
        }
    }

    /// Close the current table: flush its blocks, persist the filter, and
    /// record the meta-index entry. `filter` carries the finished filter
    /// bytes (empty slice or `None` => no filter block).
    pub fn end_table(&mut self, filter: Option<&[u8]>, filter_type: u8) {
        if !self.ok() || self.finished {
            return;
        }
        self.end_block();
        if self.pending_indx_entry {
            let successor = short_successor(&self.last_key);
            self.commit_pending_index_entry(&successor);
        }
        self.commit_data_batch();
        if !self.table_has_keys {
            return; // nothing buffered since the last table
        }

        let filter_handle = match filter {
            Some(bytes) if !bytes.is_empty() => {
                self.stats.filter_size += bytes.len() as u64;
                let before = self.indx_sink.ltell();
                let handle = self.write_index_block(bytes, false);
                self.stats.final_filter_size += self.indx_sink.ltell() - before;
                handle
            }
            _ => BlockHandle::new(self.indx_sink.ltell(), 0),
        };

        let indx_payload = self.indx_block.finish().to_vec();
        self.stats.index_size += indx_payload.len() as u64;
        let before = self.indx_sink.ltell();
        let indx_handle = self.write_index_block(&indx_payload, true);
        self.stats.final_index_size += self.indx_sink.ltell() - before;
        self.indx_block.reset();

        let table_handle = TableHandle {
            index: indx_handle,
            filter: filter_handle,
            filter_type,
        };
        let mut encoded = Vec::with_capacity(44);
        table_handle.encode_into(&mut encoded);
        self.meta_block.add(&self.largest_key, &encoded);

        self.num_tables += 1;
        self.stats.num_tables += 1;
        self.table_has_keys = false;
        self.smallest_key.clear();
        self.largest_key.clear();
        self.last_key.clear();
    }

    /// Close the current epoch: persist its meta-index block and record the
    /// root entry. Requires `end_table` to have closed any open table.
    pub fn make_epoch(&mut self) {
        if !self.ok() || self.finished {
            return;
        }
        debug_assert!(!self.table_has_keys, "end_table must run first");
        let meta_payload = self.meta_block.finish().to_vec();
        self.stats.meta_index_size += meta_payload.len() as u64;
        let before = self.indx_sink.ltell();
        let meta_handle = self.write_index_block(&meta_payload, true);
        self.stats.final_meta_index_size += self.indx_sink.ltell() - before;
        self.meta_block.reset();

        let mut epoch_key = Vec::with_capacity(4);
        put_fixed32(&mut epoch_key, self.num_epochs);
        let mut encoded = Vec::with_capacity(20);
        meta_handle.encode_into(&mut encoded);
        self.root_block.add(&epoch_key, &encoded);

        self.num_epochs += 1;
        self.stats.num_epochs += 1;
        self.num_tables = 0;

        if self.rotation {
            if let Err(err) = self.data_sink.rotate() {
                if self.status.is_none() {
                    self.status = Some(err);
                }
            }
        }
    }

    /// Write the root block and footer. Idempotent: a second call reports
    /// the latched status without touching the logs again.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return self.status();
        }
        if self.ok() {
            debug_assert!(!self.table_has_keys, "end_table must run first");
            let root_payload = self.root_block.finish().to_vec();
            self.stats.meta_index_size += root_payload.len() as u64;
            let before = self.indx_sink.ltell();
            let root_handle = self.write_index_block(&root_payload, true);
            self.stats.final_meta_index_size += self.indx_sink.ltell() - before;

            let footer = Footer { root: root_handle };
            if let Err(err) = self.indx_sink.append(&footer.encode()) {
                if self.status.is_none() {
                    self.status = Some(err);
                }
            }
        }
        if self.ok() {
            if let Err(err) = self.data_sink.flush().and_then(|_| self.indx_sink.flush()) {
                self.status = Some(err);
            }
        }
        self.finished = true;
        self.status()
    }
}

/// Smallest key that is >= `start` and, when possible, < `limit`.
fn shortest_separator(start: &[u8], limit: &[u8]) -> Vec<u8> {
    let min_len = start.len().min(limit.len());
    let mut diff = 0;
    while diff < min_len && start[diff] == limit[diff] {
        diff += 1;
    }
    if diff < min_len {
        let byte = start[diff];
        if byte != 0xff && byte + 1 < limit[diff] {
            let mut out = start[..=diff].to_vec();
            out[diff] += 1;
            return out;
        }
    }
    // One key is a prefix of the other (or no shortening helps): keep start.
    start.to_vec()
}

/// Smallest key that is >= `key`, shortened where a byte can be bumped.
fn short_successor(key: &[u8]) -> Vec<u8> {
    for (i, &byte) in key.iter().enumerate() {
        if byte != 0xff {
            let mut out = key[..=i].to_vec();
            out[i] += 1;
            return out;
        }
    }
    key.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, MemEnv};
    use crate::log::{data_log_name, index_log_name};
    use std::path::Path;

    fn sinks(env: &Arc<dyn Env>) -> (Arc<LogSink>, Arc<LogSink>) {
        sinks_with_min_buffer(env, 1 << 20)
    }

    fn sinks_with_min_buffer(
        env: &Arc<dyn Env>,
        min_buffer: usize,
    ) -> (Arc<LogSink>, Arc<LogSink>) {
        let dir = Path::new("/t");
        let data = LogSink::open(
            env.clone(),
            dir,
            0,
            data_log_name(0, None),
            min_buffer,
            1 << 20,
            false,
        )
        .unwrap();
        let indx = LogSink::open(
            env.clone(),
            dir,
            0,
            index_log_name(0),
            min_buffer,
            1 << 20,
            false,
        )
        .unwrap();
        (data, indx)
    }

    #[test]
    fn separator_sits_between_keys() {
        let sep = shortest_separator(b"abcdef", b"abzzzz");
        assert!(sep.as_slice() >= b"abcdef".as_slice());
        assert!(sep.as_slice() < b"abzzzz".as_slice());
        assert_eq!(sep, b"abd");

        // Prefix relation: no shortening possible.
        assert_eq!(shortest_separator(b"ab", b"abc"), b"ab");
        // Equal keys (multi-map spill): separator equals the key.
        assert_eq!(shortest_separator(b"k1", b"k1"), b"k1");
    }

    #[test]
    fn successor_is_minimal() {
        assert_eq!(short_successor(b"abc"), b"b");
        assert_eq!(short_successor(b"\xff\xffa"), b"\xff\xffb");
        assert_eq!(short_successor(b"\xff\xff"), b"\xff\xff");
    }

    #[test]
    fn single_table_layout() {
        let env: Arc<dyn Env> = Arc::new(MemEnv::new());
        let (data, indx) = sinks(&env);
        let mut tb = TableLogger::new(&DirOptions::default(), data.clone(), indx.clone());

        for i in 0..100u32 {
            let key = format!("k{i:04}");
            tb.add(key.as_bytes(), b"value");
        }
        tb.end_table(None, 0);
        tb.make_epoch();
        tb.finish().unwrap();

        let stats = tb.output_stats();
        assert_eq!(stats.num_keys, 100);
        assert_eq!(stats.num_tables, 1);
        assert_eq!(stats.num_epochs, 1);
        assert!(stats.data_size > 0);
        assert!(stats.index_size > 0);
        assert_eq!(stats.filter_size, 0);

        // The data log holds exactly the data blocks.
        assert_eq!(
            env.get_file_size(Path::new("/t").join(data_log_name(0, None)).as_path())
                .unwrap(),
            stats.final_data_size
        );
    }

    #[test]
    fn finish_is_idempotent() {
        let env: Arc<dyn Env> = Arc::new(MemEnv::new());
        let (data, indx) = sinks(&env);
        let mut tb = TableLogger::new(&DirOptions::default(), data, indx.clone());
        tb.add(b"k", b"v");
        tb.end_table(None, 0);
        tb.make_epoch();
        tb.finish().unwrap();
        let size_after_first = indx.ltell();
        tb.finish().unwrap();
        assert_eq!(indx.ltell(), size_after_first);
    }

    #[test]
    fn empty_epoch_still_recorded() {
        let env: Arc<dyn Env> = Arc::new(MemEnv::new());
        let (data, indx) = sinks(&env);
        let mut tb = TableLogger::new(&DirOptions::default(), data, indx);
        tb.end_table(None, 0); // nothing buffered
        tb.make_epoch();
        tb.finish().unwrap();
        let stats = tb.output_stats();
        assert_eq!(stats.num_tables, 0);
        assert_eq!(stats.num_epochs, 1);
    }

    #[test]
    fn small_batch_size_splits_writes() {
        let env: Arc<dyn Env> = Arc::new(MemEnv::new());
        let (data, indx) = sinks_with_min_buffer(&env, 1);
        let options = DirOptions {
            block_size: 256,
            block_batch_size: 512,
            ..Default::default()
        };
        let mut tb = TableLogger::new(&options, data.clone(), indx);
        for i in 0..500u32 {
            tb.add(format!("key{i:06}").as_bytes(), &[b'x'; 24]);
        }
        tb.end_table(None, 0);
        tb.make_epoch();
        tb.finish().unwrap();
        assert!(tb.output_stats().num_data_blocks > 1);
        assert!(data.io_ops() > 1, "batches should flush incrementally");
    }
}

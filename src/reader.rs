//! Directory reader: root -> epoch -> table -> block traversal.
//!
//! The index log is slurped into memory per partition (it is small next to
//! the data log); data blocks are fetched on demand through the random
//! access interface. Lookups probe the table's filter first, then binary
//! search the index block, then scan the candidate data block(s).
//!
//! With `paranoid_checks` a corrupt table fails the read; otherwise it is
//! logged, skipped, and the scan continues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::filter::filter_may_match;
use crate::format::{
    get_fixed32, open_block, stored_block_len, BlockHandle, Footer, TableHandle, FOOTER_SIZE,
};
use crate::log::{data_log_name, index_log_name, load_log, IoStats, LogSource};
use crate::options::{DirMode, DirOptions};
use crate::writer::key_partition;

pub struct DirReader {
    options: DirOptions,
    parts: Vec<PartReader>,
}

struct PartReader {
    part: usize,
    dirname: PathBuf,
    options: DirOptions,
    /// Entire index log for this partition.
    indx: Vec<u8>,
    /// `(epoch, meta_index_handle)` in epoch order.
    root_entries: Vec<(u32, BlockHandle)>,
    data: DataSource,
}

enum DataSource {
    Single(LogSource),
    /// Per-epoch data logs, opened lazily.
    Rotated(Mutex<HashMap<u32, Arc<LogSource>>>),
}

impl DirReader {
    /// Open a directory previously written with the same options (partition
    /// count, checksum, compression and rotation settings must match).
    pub fn open(options: DirOptions, dirname: impl AsRef<Path>) -> Result<Self> {
        options.validate()?;
        let dirname = dirname.as_ref();
        let mut parts = Vec::with_capacity(options.num_parts());
        for part in 0..options.num_parts() {
            parts.push(PartReader::open(&options, dirname, part)?);
        }
        Ok(Self { options, parts })
    }

    /// Number of epochs recorded (maximum across partitions).
    pub fn num_epochs(&self) -> u32 {
        self.parts
            .iter()
            .map(|p| p.root_entries.len() as u32)
            .max()
            .unwrap_or(0)
    }

    /// Collect every value stored under `key`, concatenated in epoch order
    /// (and insertion order within an epoch). Missing keys yield an empty
    /// result with OK status.
    pub fn read_all(&self, key: &[u8]) -> Result<Bytes> {
        let part = key_partition(key, self.options.lg_parts);
        let values = self.parts[part].read(key)?;
        Ok(Bytes::from(values))
    }

    /// Cumulative read-side counters: data bytes/ops fetched plus the
    /// resident index bytes.
    pub fn io_stats(&self) -> IoStats {
        let mut total = IoStats::default();
        for part in &self.parts {
            total.index_bytes += part.indx.len() as u64;
            total.index_ops += 1;
            match &part.data {
                DataSource::Single(source) => {
                    total.data_bytes += source.io_bytes();
                    total.data_ops += source.io_ops();
                }
                DataSource::Rotated(map) => {
                    for source in map.lock().values() {
                        total.data_bytes += source.io_bytes();
                        total.data_ops += source.io_ops();
                    }
                }
            }
        }
        total
    }
}

impl PartReader {
    fn open(options: &DirOptions, dirname: &Path, part: usize) -> Result<Self> {
        let indx = load_log(options.env.as_ref(), &dirname.join(index_log_name(part)))?;
        if indx.len() < FOOTER_SIZE {
            return Err(Error::Corruption("index log shorter than footer"));
        }
        let footer = Footer::decode(&indx[indx.len() - FOOTER_SIZE..])?;

        let reader = Self {
            part,
            dirname: dirname.to_path_buf(),
            options: options.clone(),
            indx,
            root_entries: Vec::new(),
            data: if options.epoch_log_rotation {
                DataSource::Rotated(Mutex::new(HashMap::new()))
            } else {
                DataSource::Single(LogSource::open(
                    options.env.as_ref(),
                    &dirname.join(data_log_name(part, None)),
                )?)
            },
        };

        let root = Block::new(Bytes::from(reader.index_block(&footer.root)?))?;
        let mut root_entries = Vec::new();
        let mut iter = root.iter();
        iter.seek_to_first();
        while iter.next()? {
            let epoch = get_fixed32(iter.key())?;
            let mut at = 0;
            let handle = BlockHandle::decode_from(iter.value(), &mut at)?;
            root_entries.push((epoch, handle));
        }
        Ok(Self {
            root_entries,
            ..reader
        })
    }

    /// Slice a block out of the in-memory index log and decode it.
    fn index_block(&self, handle: &BlockHandle) -> Result<Vec<u8>> {
        let trailer = self.options.block_trailers();
        let start = handle.offset as usize;
        let end = start + stored_block_len(handle, trailer) as usize;
        let raw = self
            .indx
            .get(start..end)
            .ok_or(Error::Corruption("index handle out of bounds"))?;
        open_block(raw, trailer, self.options.verify_checksums)
    }

    fn data_source(&self, epoch: u32) -> Result<Arc<LogSource>> {
        match &self.data {
            DataSource::Single(_) => unreachable!("rotated lookups only"),
            DataSource::Rotated(map) => {
                let mut map = map.lock();
                if let Some(source) = map.get(&epoch) {
                    return Ok(source.clone());
                }
                let source = Arc::new(LogSource::open(
                    self.options.env.as_ref(),
                    &self.dirname.join(data_log_name(self.part, Some(epoch))),
                )?);
                map.insert(epoch, source.clone());
                Ok(source)
            }
        }
    }

    fn read_data_block(&self, epoch: u32, handle: &BlockHandle) -> Result<Block> {
        let trailer = self.options.block_trailers();
        let len = stored_block_len(handle, trailer) as usize;
        let raw = match &self.data {
            DataSource::Single(source) => source.read(handle.offset, len)?,
            DataSource::Rotated(_) => self.data_source(epoch)?.read(handle.offset, len)?,
        };
        let payload = open_block(&raw, trailer, self.options.verify_checksums)?;
        Block::new(Bytes::from(payload))
    }

    fn read(&self, key: &[u8]) -> Result<Vec<u8>> {
        match &self.options.reader_pool {
            Some(pool) => {
                // Fan out per epoch; results merge in epoch order because
                // collect preserves input order.
                let entries = &self.root_entries;
                let per_epoch: Vec<Result<Vec<u8>>> = pool.install(|| {
                    entries
                        .par_iter()
                        .map(|(epoch, handle)| self.get_from_epoch(key, *epoch, handle))
                        .collect()
                });
                let mut out = Vec::new();
                for result in per_epoch {
                    out.extend_from_slice(&result?);
                }
                Ok(out)
            }
            None => {
                let mut out = Vec::new();
                for (epoch, handle) in &self.root_entries {
                    let values = self.get_from_epoch(key, *epoch, handle)?;
                    out.extend_from_slice(&values);
                }
                Ok(out)
            }
        }
    }

    /// All values for `key` within one epoch, in table order.
    fn get_from_epoch(&self, key: &[u8], epoch: u32, meta: &BlockHandle) -> Result<Vec<u8>> {
        let meta_block = Block::new(Bytes::from(self.index_block(meta)?))?;
        let mut out = Vec::new();
        let mut iter = meta_block.iter();
        if self.options.mode == DirMode::MultiMap {
            // Tables within an epoch are only insertion-ordered; every
            // table is a candidate and the filters do the pruning.
            iter.seek_to_first();
        } else {
            // Sorted, disjoint tables: the first table whose largest key
            // covers the target is the only candidate.
            iter.seek(key)?;
        }
        while iter.next()? {
            if iter.key() < key {
                continue; // largest key below target: cannot contain it
            }
            let table = TableHandle::decode(iter.value())?;
            match self.fetch_from_table(key, epoch, &table, &mut out) {
                Ok(()) => {}
                Err(Error::Corruption(what)) if !self.options.paranoid_checks => {
                    log::warn!(
                        "part {}: skipping corrupt table in epoch {epoch}: {what}",
                        self.part
                    );
                }
                Err(err) => return Err(err),
            }
            if self.options.mode != DirMode::MultiMap {
                break;
            }
        }
        Ok(out)
    }

    /// Probe one table: filter, index block, then candidate data block(s).
    fn fetch_from_table(
        &self,
        key: &[u8],
        epoch: u32,
        table: &TableHandle,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if table.filter.size > 0 {
            let filter = self.index_block(&table.filter)?;
            if !filter_may_match(table.filter_type, key, &filter) {
                return Ok(());
            }
        }

        let index = Block::new(Bytes::from(self.index_block(&table.index)?))?;
        let mut index_iter = index.iter();
        index_iter.seek(key)?;
        while index_iter.next()? {
            let mut at = 0;
            let handle = BlockHandle::decode_from(index_iter.value(), &mut at)?;
            let block = self.read_data_block(epoch, &handle)?;
            let (found, exhausted) = scan_block(&block, key, self.options.mode, out)?;
            if exhausted || (found && self.options.mode != DirMode::MultiMap) {
                return Ok(());
            }
            // Equal keys may spill across the block boundary; keep going.
        }
        Ok(())
    }
}

/// Scan one data block for `key`, appending matches to `out`. Returns
/// `(found_any, saw_key_past_target)`.
fn scan_block(
    block: &Block,
    key: &[u8],
    mode: DirMode,
    out: &mut Vec<u8>,
) -> Result<(bool, bool)> {
    let mut iter = block.iter();
    iter.seek(key)?;
    let mut found = false;
    while iter.next()? {
        match iter.key().cmp(key) {
            std::cmp::Ordering::Less => continue,
            std::cmp::Ordering::Equal => {
                out.extend_from_slice(iter.value());
                found = true;
                if mode != DirMode::MultiMap {
                    return Ok((true, false));
                }
            }
            std::cmp::Ordering::Greater => return Ok((found, true)),
        }
    }
    Ok((found, false))
}

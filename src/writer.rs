//! Directory writer: the public append surface.
//!
//! A directory is split into `2^lg_parts` partitions, each with its own
//! data/index log pair and its own logger; keys route by hash. Epoch
//! boundaries and finalization fan out to every partition, so all
//! partitions agree on epoch numbering.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};
use crate::log::{data_log_name, index_log_name, IoStats, LogSink};
use crate::logger::{DirLogger, FlushOptions};
use crate::options::DirOptions;
use crate::table::OutputStats;

const PARTITION_HASH_SEED: u64 = 0x706c_6673; // "plfs"

pub(crate) fn key_partition(key: &[u8], lg_parts: usize) -> usize {
    (xxh64(key, PARTITION_HASH_SEED) as usize) & ((1 << lg_parts) - 1)
}

pub struct DirWriter {
    options: DirOptions,
    dirname: PathBuf,
    parts: Vec<DirLogger>,
    epoch: AtomicU32,
    finished: Mutex<Option<Result<()>>>,
}

impl DirWriter {
    /// Create a directory at `dirname` and open one logger per partition.
    pub fn open(options: DirOptions, dirname: impl AsRef<Path>) -> Result<Self> {
        options.validate()?;
        let dirname = dirname.as_ref().to_path_buf();
        options.env.create_dir(&dirname)?;

        let mut parts = Vec::with_capacity(options.num_parts());
        for part in 0..options.num_parts() {
            let data_name = if options.epoch_log_rotation {
                data_log_name(part, Some(0))
            } else {
                data_log_name(part, None)
            };
            let data = LogSink::open(
                options.env.clone(),
                &dirname,
                part,
                data_name,
                options.min_data_buffer,
                options.data_buffer,
                options.epoch_log_rotation,
            )?;
            let indx = LogSink::open(
                options.env.clone(),
                &dirname,
                part,
                index_log_name(part),
                options.min_index_buffer,
                options.index_buffer,
                false,
            )?;
            parts.push(DirLogger::new(&options, part as u32, data, indx));
        }
        log::info!(
            "opened directory {} ({} partitions, filter {:?})",
            dirname.display(),
            parts.len(),
            options.filter
        );
        Ok(Self {
            options,
            dirname,
            parts,
            epoch: AtomicU32::new(0),
            finished: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &DirOptions {
        &self.options
    }

    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    /// Current epoch number; appends must name it.
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Append one record to the given epoch. In non-blocking mode a
    /// saturated partition reports `TryAgain` and nothing is written.
    pub fn append(&self, key: &[u8], value: &[u8], epoch: u32) -> Result<()> {
        self.check_open()?;
        let current = self.epoch.load(Ordering::Acquire);
        if epoch != current {
            return Err(Error::InvalidArgument(format!(
                "epoch {epoch} is not the current epoch {current}"
            )));
        }
        let part = key_partition(key, self.options.lg_parts);
        self.parts[part].add(key, value)
    }

    /// Flush every partition without sealing the epoch.
    pub fn flush(&self, epoch: u32) -> Result<()> {
        self.check_open()?;
        self.check_epoch(epoch)?;
        self.flush_all(FlushOptions {
            no_wait: true,
            ..Default::default()
        })
    }

    /// Seal the given epoch across all partitions and advance the epoch
    /// counter. Compactions run in the background.
    pub fn epoch_flush(&self, epoch: u32) -> Result<()> {
        self.check_open()?;
        self.check_epoch(epoch)?;
        self.flush_all(FlushOptions {
            no_wait: true,
            epoch_flush: true,
            ..Default::default()
        })?;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Block until all scheduled compactions have completed.
    pub fn wait(&self) -> Result<()> {
        for part in &self.parts {
            part.wait()?;
        }
        Ok(())
    }

    /// Seal the final epoch, write footers, and sync all logs. Idempotent:
    /// later calls return the first outcome.
    pub fn finish(&self) -> Result<()> {
        let mut finished = self.finished.lock();
        if let Some(result) = &*finished {
            return result.clone();
        }
        let result = self.do_finish();
        *finished = Some(result.clone());
        result
    }

    fn do_finish(&self) -> Result<()> {
        for part in &self.parts {
            part.flush(FlushOptions {
                no_wait: false,
                epoch_flush: true,
                finalize: true,
                ..Default::default()
            })?;
        }
        for part in &self.parts {
            part.sync_and_close()?;
        }
        log::info!("finished directory {}", self.dirname.display());
        Ok(())
    }

    /// Real memory held by the write buffers of every partition.
    pub fn memory_usage(&self) -> usize {
        self.parts.iter().map(|p| p.memory_usage()).sum()
    }

    /// Cumulative block/key byte totals across all partitions.
    pub fn output_stats(&self) -> OutputStats {
        let mut total = OutputStats::default();
        for part in &self.parts {
            let s = part.output_stats();
            total.final_data_size += s.final_data_size;
            total.data_size += s.data_size;
            total.final_meta_index_size += s.final_meta_index_size;
            total.meta_index_size += s.meta_index_size;
            total.final_index_size += s.final_index_size;
            total.index_size += s.index_size;
            total.final_filter_size += s.final_filter_size;
            total.filter_size += s.filter_size;
            total.value_size += s.value_size;
            total.key_size += s.key_size;
            total.num_keys += s.num_keys;
            total.num_dropped_keys += s.num_dropped_keys;
            total.num_data_blocks += s.num_data_blocks;
            total.num_tables += s.num_tables;
            total.num_epochs = total.num_epochs.max(s.num_epochs);
        }
        total
    }

    /// Cumulative physical log write counters.
    pub fn io_stats(&self) -> IoStats {
        let mut total = IoStats::default();
        for part in &self.parts {
            let s = part.io_stats();
            total.data_bytes += s.data_bytes;
            total.data_ops += s.data_ops;
            total.index_bytes += s.index_bytes;
            total.index_ops += s.index_ops;
        }
        total
    }

    fn flush_all(&self, options: FlushOptions) -> Result<()> {
        for part in &self.parts {
            part.flush(options)?;
        }
        Ok(())
    }

    fn check_epoch(&self, epoch: u32) -> Result<()> {
        let current = self.epoch.load(Ordering::Acquire);
        if epoch != current {
            return Err(Error::InvalidArgument(format!(
                "epoch {epoch} is not the current epoch {current}"
            )));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.finished.lock().is_some() {
            return Err(Error::InvalidArgument(
                "directory is already finished".to_string(),
            ));
        }
        Ok(())
    }
}

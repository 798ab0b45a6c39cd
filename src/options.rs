//! Directory-wide configuration.

use std::sync::Arc;

use crate::env::{Env, PosixEnv};
use crate::error::{Error, Result};
use crate::events::EventListener;

/// How duplicate keys behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirMode {
    /// At most one value per key per epoch; lookups stop at the first match
    /// within an epoch.
    Unique,
    /// Like `Unique`, but duplicate keys are silently dropped during
    /// compaction (and counted).
    UniqueDrop,
    /// All inserted values are kept and returned in insertion order.
    MultiMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Which per-table filter the directory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterChoice {
    NoFilter,
    Bloom,
    Bitmap,
    Cuckoo,
}

/// Wire format of a bitmap filter; the id is persisted as the last byte of
/// the filter blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitmapFormat {
    Uncompressed = 0,
    Varint = 1,
    VarintPlus = 2,
    PForDelta = 3,
    Roaring = 4,
    PartitionedRoaring = 5,
}

impl BitmapFormat {
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Uncompressed),
            1 => Some(Self::Varint),
            2 => Some(Self::VarintPlus),
            3 => Some(Self::PForDelta),
            4 => Some(Self::Roaring),
            5 => Some(Self::PartitionedRoaring),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct DirOptions {
    /// Hard memory ceiling across both write buffers of every partition.
    pub total_memtable_budget: usize,
    /// Target serialized size of one data block.
    pub block_size: usize,
    /// Seal a data block once it reaches `block_size * block_util`.
    pub block_util: f64,
    /// Data blocks are staged in memory and pushed to the data log in
    /// batches of roughly this size.
    pub block_batch_size: usize,
    /// Data log sink staging capacity / flush threshold.
    pub data_buffer: usize,
    pub min_data_buffer: usize,
    /// Index log sink staging capacity / flush threshold.
    pub index_buffer: usize,
    pub min_index_buffer: usize,

    /// Which filter family to build per table.
    pub filter: FilterChoice,
    /// Bloom filter budget; zero disables the filter block entirely when
    /// `filter == Bloom`.
    pub bf_bits_per_key: usize,
    /// Bitmap filter domain: keys map into `[0, 2^bm_key_bits)`.
    pub bm_key_bits: usize,
    pub bitmap_format: BitmapFormat,
    /// Cuckoo fingerprint width; one of 10, 16, 20, 24, 32.
    pub filter_bits_per_key: usize,
    /// Target cuckoo table occupancy in (0, 1].
    pub cuckoo_frac: f64,
    /// Eviction chain cap before a fingerprint goes to the victim list.
    pub cuckoo_max_moves: usize,
    pub cuckoo_seed: u64,

    /// Benchmark-mode key/value sizes used to estimate per-table entry
    /// counts and filter allocations.
    pub key_size: usize,
    pub value_size: usize,

    /// The directory is split into `2^lg_parts` independent partitions.
    pub lg_parts: usize,
    /// Producer inserts keys in order; compaction skips the sort.
    pub skip_sort: bool,
    /// `add` returns `TryAgain` instead of blocking on backpressure.
    pub non_blocking: bool,

    pub verify_checksums: bool,
    pub paranoid_checks: bool,
    pub mode: DirMode,
    pub compression: Compression,
    /// Keep snappy output even when it does not shrink a block.
    pub force_compression: bool,
    /// Rotate the data log at each epoch boundary.
    pub epoch_log_rotation: bool,

    pub env: Arc<dyn Env>,
    pub listener: Option<Arc<dyn EventListener>>,
    /// Shared pool for background compactions; `None` runs compactions on
    /// the calling thread.
    pub compaction_pool: Option<Arc<rayon::ThreadPool>>,
    /// Optional pool for per-epoch read fan-out.
    pub reader_pool: Option<Arc<rayon::ThreadPool>>,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            total_memtable_budget: 48 << 20,
            block_size: 32 << 10,
            block_util: 0.996,
            block_batch_size: 2 << 20,
            data_buffer: 4 << 20,
            min_data_buffer: 4 << 20,
            index_buffer: 4 << 20,
            min_index_buffer: 4 << 20,
            filter: FilterChoice::Bloom,
            bf_bits_per_key: 8,
            bm_key_bits: 24,
            bitmap_format: BitmapFormat::Uncompressed,
            filter_bits_per_key: 16,
            cuckoo_frac: 0.95,
            cuckoo_max_moves: 500,
            cuckoo_seed: 301,
            key_size: 8,
            value_size: 32,
            lg_parts: 0,
            skip_sort: false,
            non_blocking: false,
            verify_checksums: false,
            paranoid_checks: false,
            mode: DirMode::Unique,
            compression: Compression::None,
            force_compression: false,
            epoch_log_rotation: false,
            env: Arc::new(PosixEnv::new()),
            listener: None,
            compaction_pool: None,
            reader_pool: None,
        }
    }
}

impl DirOptions {
    /// Reject configurations the engine cannot honor.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.lg_parts > 8 {
            return Err(Error::InvalidArgument(format!(
                "lg_parts {} out of range [0, 8]",
                self.lg_parts
            )));
        }
        if !(0.0..=1.0).contains(&self.block_util) || self.block_util == 0.0 {
            return Err(Error::InvalidArgument(format!(
                "block_util {} out of range (0, 1]",
                self.block_util
            )));
        }
        if self.filter == FilterChoice::Bitmap && !(8..=32).contains(&self.bm_key_bits) {
            return Err(Error::InvalidArgument(format!(
                "bm_key_bits {} out of range [8, 32]",
                self.bm_key_bits
            )));
        }
        if self.filter == FilterChoice::Cuckoo {
            if ![10, 16, 20, 24, 32].contains(&self.filter_bits_per_key) {
                return Err(Error::InvalidArgument(format!(
                    "cuckoo filter_bits_per_key {} not one of 10/16/20/24/32",
                    self.filter_bits_per_key
                )));
            }
            if !(0.0..=1.0).contains(&self.cuckoo_frac) || self.cuckoo_frac == 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "cuckoo_frac {} out of range (0, 1]",
                    self.cuckoo_frac
                )));
            }
        }
        if self.block_size == 0 || self.total_memtable_budget == 0 {
            return Err(Error::InvalidArgument(
                "block_size and total_memtable_budget must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether blocks carry the 5-byte trailer. Compression needs the
    /// trailer's type byte, so either knob turns it on.
    pub(crate) fn block_trailers(&self) -> bool {
        self.verify_checksums || self.compression != Compression::None
    }

    pub(crate) fn num_parts(&self) -> usize {
        1 << self.lg_parts
    }
}

impl std::fmt::Debug for DirOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirOptions")
            .field("total_memtable_budget", &self.total_memtable_budget)
            .field("block_size", &self.block_size)
            .field("block_util", &self.block_util)
            .field("block_batch_size", &self.block_batch_size)
            .field("filter", &self.filter)
            .field("bf_bits_per_key", &self.bf_bits_per_key)
            .field("bm_key_bits", &self.bm_key_bits)
            .field("bitmap_format", &self.bitmap_format)
            .field("filter_bits_per_key", &self.filter_bits_per_key)
            .field("lg_parts", &self.lg_parts)
            .field("mode", &self.mode)
            .field("compression", &self.compression)
            .field("verify_checksums", &self.verify_checksums)
            .field("non_blocking", &self.non_blocking)
            .field("epoch_log_rotation", &self.epoch_log_rotation)
            .finish_non_exhaustive()
    }
}

//! Per-table approximate-membership filters.
//!
//! The directory picks one filter family for all tables (`FilterChoice`);
//! the persisted type code travels in each table's meta-index entry and the
//! query side dispatches on that code alone, never on builder state. Codes:
//! 0 unknown, 1 bloom, 2 bitmap, 3 cuckoo. Unknown codes and undecodable
//! blobs are treated as "may match".

pub mod bitmap;
pub mod bloom;
pub mod cuckoo;

pub use bitmap::{bitmap_must_match, BitmapBuilder};
pub use bloom::{bloom_may_match, BloomBuilder};
pub use cuckoo::{cuckoo_may_match, CuckooBuilder};

use crate::options::{DirOptions, FilterChoice};

pub const FILTER_TYPE_UNKNOWN: u8 = 0;
pub const FILTER_TYPE_BLOOM: u8 = 1;
pub const FILTER_TYPE_BITMAP: u8 = 2;
pub const FILTER_TYPE_CUCKOO: u8 = 3;

/// One filter under construction; variant chosen by directory options.
pub enum FilterBuilder {
    NoFilter,
    Bloom(BloomBuilder),
    Bitmap(BitmapBuilder),
    Cuckoo(CuckooBuilder),
}

impl FilterBuilder {
    pub fn from_options(options: &DirOptions) -> Self {
        match options.filter {
            FilterChoice::NoFilter => Self::NoFilter,
            // A zero bloom budget means "no filter block", matching the
            // historical knob.
            FilterChoice::Bloom if options.bf_bits_per_key == 0 => Self::NoFilter,
            FilterChoice::Bloom => Self::Bloom(BloomBuilder::new(options.bf_bits_per_key)),
            FilterChoice::Bitmap => Self::Bitmap(BitmapBuilder::new(
                options.bm_key_bits,
                options.bitmap_format,
            )),
            FilterChoice::Cuckoo => Self::Cuckoo(CuckooBuilder::new(
                options.filter_bits_per_key,
                options.cuckoo_frac,
                options.cuckoo_max_moves,
                options.cuckoo_seed,
            )),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::NoFilter)
    }

    /// Persisted type code for the meta-index entry.
    pub fn filter_type(&self) -> u8 {
        match self {
            Self::NoFilter => FILTER_TYPE_UNKNOWN,
            Self::Bloom(_) => FILTER_TYPE_BLOOM,
            Self::Bitmap(_) => FILTER_TYPE_BITMAP,
            Self::Cuckoo(_) => FILTER_TYPE_CUCKOO,
        }
    }

    pub fn reset(&mut self, num_keys: u32) {
        match self {
            Self::NoFilter => {}
            Self::Bloom(b) => b.reset(num_keys),
            Self::Bitmap(b) => b.reset(num_keys),
            Self::Cuckoo(b) => b.reset(num_keys),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        match self {
            Self::NoFilter => {}
            Self::Bloom(b) => b.add_key(key),
            Self::Bitmap(b) => b.add_key(key),
            Self::Cuckoo(b) => b.add_key(key),
        }
    }

    /// Final wire bytes; empty for the disabled filter.
    pub fn finish(&mut self) -> &[u8] {
        match self {
            Self::NoFilter => &[],
            Self::Bloom(b) => b.finish(),
            Self::Bitmap(b) => b.finish(),
            Self::Cuckoo(b) => b.finish(),
        }
    }
}

/// Probe a persisted filter blob. `false` means the table cannot contain
/// the key; `true` means it might.
pub fn filter_may_match(filter_type: u8, key: &[u8], filter: &[u8]) -> bool {
    match filter_type {
        FILTER_TYPE_BLOOM => bloom_may_match(key, filter),
        FILTER_TYPE_BITMAP => bitmap_must_match(key, filter),
        FILTER_TYPE_CUCKOO => cuckoo_may_match(key, filter),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BitmapFormat;

    #[test]
    fn builder_tracks_options() {
        let mut opts = DirOptions::default();
        opts.filter = FilterChoice::Bitmap;
        opts.bitmap_format = BitmapFormat::Roaring;
        let builder = FilterBuilder::from_options(&opts);
        assert_eq!(builder.filter_type(), FILTER_TYPE_BITMAP);

        opts.filter = FilterChoice::Bloom;
        opts.bf_bits_per_key = 0;
        let builder = FilterBuilder::from_options(&opts);
        assert!(!builder.is_enabled());
    }

    #[test]
    fn unknown_type_code_always_matches() {
        assert!(filter_may_match(200, b"key", b"whatever"));
        assert!(filter_may_match(FILTER_TYPE_UNKNOWN, b"key", &[]));
    }

    #[test]
    fn dispatch_reaches_each_family() {
        let mut opts = DirOptions::default();
        opts.filter = FilterChoice::Cuckoo;
        let mut builder = FilterBuilder::from_options(&opts);
        builder.reset(16);
        builder.add_key(b"present");
        let code = builder.filter_type();
        let blob = builder.finish().to_vec();
        assert!(filter_may_match(code, b"present", &blob));
    }
}

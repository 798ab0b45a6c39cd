use proptest::collection::{btree_set, vec};
use proptest::prelude::*;

use plfsdir::buffer::WriteBuffer;
use plfsdir::filter::{
    bitmap_must_match, bloom_may_match, cuckoo_may_match, BitmapBuilder, BloomBuilder,
    CuckooBuilder,
};
use plfsdir::BitmapFormat;

const FORMATS: [BitmapFormat; 6] = [
    BitmapFormat::Uncompressed,
    BitmapFormat::Varint,
    BitmapFormat::VarintPlus,
    BitmapFormat::PForDelta,
    BitmapFormat::Roaring,
    BitmapFormat::PartitionedRoaring,
];

proptest! {
    /// Bitmap filters are exact: every member matches, every non-member
    /// misses, for every wire format.
    #[test]
    fn bitmap_membership_is_exact(
        members in btree_set(0u32..(1 << 12), 0..300),
        probes in vec(0u32..(1 << 12), 50),
    ) {
        for format in FORMATS {
            let mut builder = BitmapBuilder::new(12, format);
            builder.reset(members.len() as u32);
            for &i in &members {
                builder.add_key(&i.to_le_bytes());
            }
            let filter = builder.finish().to_vec();
            for &i in &members {
                prop_assert!(
                    bitmap_must_match(&i.to_le_bytes(), &filter),
                    "{format:?}: member {i} missing"
                );
            }
            for &i in &probes {
                prop_assert_eq!(
                    bitmap_must_match(&i.to_le_bytes(), &filter),
                    members.contains(&i),
                    "{:?}: probe {}", format, i
                );
            }
        }
    }

    /// Bloom filters never produce false negatives.
    #[test]
    fn bloom_has_no_false_negatives(
        keys in vec(vec(any::<u8>(), 1..24), 1..200),
        bits_per_key in 4usize..20,
    ) {
        let mut builder = BloomBuilder::new(bits_per_key);
        builder.reset(keys.len() as u32);
        for key in &keys {
            builder.add_key(key);
        }
        let filter = builder.finish().to_vec();
        for key in &keys {
            prop_assert!(bloom_may_match(key, &filter));
        }
    }

    /// Cuckoo filters never lose an inserted key, even under heavy
    /// eviction pressure (victims are persisted).
    #[test]
    fn cuckoo_has_no_false_negatives(
        keys in vec(vec(any::<u8>(), 1..24), 1..300),
        undersize in 1u32..64,
        max_moves in 1usize..32,
    ) {
        let mut builder = CuckooBuilder::new(16, 0.95, max_moves, 301);
        // Deliberately under-provision so eviction chains trigger.
        builder.reset(undersize);
        for key in &keys {
            builder.add_key(key);
        }
        let filter = builder.finish().to_vec();
        for key in &keys {
            prop_assert!(cuckoo_may_match(key, &filter), "lost {key:?}");
        }
    }

    /// Sorting the write buffer yields a key-ordered permutation of the
    /// inputs, with insertion order preserved among equal keys.
    #[test]
    fn write_buffer_sort_is_a_stable_permutation(
        records in vec((vec(any::<u8>(), 1..12), vec(any::<u8>(), 0..20)), 0..200),
    ) {
        let mut buf = WriteBuffer::new();
        for (k, v) in &records {
            buf.add(k, v);
        }
        buf.finish_and_sort();

        let seen: Vec<(Vec<u8>, Vec<u8>)> =
            buf.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        prop_assert_eq!(seen.len(), records.len());
        prop_assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));

        // Stable: equal keys appear in insertion order.
        let mut expected = records.clone();
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        prop_assert_eq!(&seen, &expected);
    }
}

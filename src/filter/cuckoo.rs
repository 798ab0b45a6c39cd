//! Cuckoo-fingerprint filter.
//!
//! Buckets hold four fingerprints of `bits_per_key` bits each, packed
//! contiguously; fingerprint 0 means an empty slot. The alternate bucket of
//! `(i, fp)` is `i ^ hash(fp)`, which is involutive, and the bucket count is
//! a power of two so the modulo is a mask.
//!
//! Fingerprints that survive `max_moves` evictions without landing in a
//! bucket are kept in a victim list that IS persisted, so a key inserted at
//! build time always matches at read time. Blob layout:
//!
//! ```text
//! [packed buckets][victim fp fixed32...]
//! [num_victims fixed32][num_buckets fixed32][bits_per_key fixed32]
//! ```

use std::collections::BTreeSet;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

use crate::format::put_fixed32;

const SLOTS_PER_BUCKET: usize = 4;
const CUCKOO_TRAILER: usize = 12;
const SUPPORTED_BITS: [u32; 5] = [10, 16, 20, 24, 32];

fn cuckoo_hash(key: &[u8]) -> u32 {
    xxh64(key, 0) as u32
}

fn cuckoo_fingerprint(key: &[u8], bits_per_key: u32) -> u32 {
    let mask = if bits_per_key >= 32 {
        u32::MAX
    } else {
        (1u32 << bits_per_key) - 1
    };
    // High half of the key hash, independent of the bucket hash; zero is
    // reserved for empty slots.
    let fp = (xxh64(key, 0) >> 32) as u32 & mask;
    if fp == 0 {
        1
    } else {
        fp
    }
}

fn cuckoo_alt(i: u32, fp: u32) -> u32 {
    i ^ xxh32(&fp.to_le_bytes(), 0)
}

fn bucket_bytes(bits_per_key: u32) -> usize {
    SLOTS_PER_BUCKET * bits_per_key as usize / 8
}

fn next_pow2(mut x: u64) -> u64 {
    if x <= 1 {
        return 1;
    }
    x -= 1;
    x |= x >> 1;
    x |= x >> 2;
    x |= x >> 4;
    x |= x >> 8;
    x |= x >> 16;
    x |= x >> 32;
    x + 1
}

fn read_slot(space: &[u8], bits: u32, bucket: usize, slot: usize) -> u32 {
    let base = bucket * bucket_bytes(bits);
    let bit = slot * bits as usize;
    let mut word = 0u128;
    for (n, &byte) in space[base..base + bucket_bytes(bits)].iter().enumerate() {
        word |= u128::from(byte) << (8 * n);
    }
    let mask = if bits >= 32 {
        u128::from(u32::MAX)
    } else {
        (1u128 << bits) - 1
    };
    ((word >> bit) & mask) as u32
}

fn write_slot(space: &mut [u8], bits: u32, bucket: usize, slot: usize, fp: u32) {
    let nbytes = bucket_bytes(bits);
    let base = bucket * nbytes;
    let bit = slot * bits as usize;
    let mut word = 0u128;
    for (n, &byte) in space[base..base + nbytes].iter().enumerate() {
        word |= u128::from(byte) << (8 * n);
    }
    let mask = if bits >= 32 {
        u128::from(u32::MAX)
    } else {
        (1u128 << bits) - 1
    };
    word &= !(mask << bit);
    word |= u128::from(fp) << bit;
    for n in 0..nbytes {
        space[base + n] = (word >> (8 * n)) as u8;
    }
}

pub struct CuckooBuilder {
    bits_per_key: u32,
    frac: f64,
    max_moves: usize,
    rng: SmallRng,
    num_buckets: u32,
    space: Vec<u8>,
    victims: BTreeSet<u32>,
    finished: bool,
}

impl CuckooBuilder {
    pub fn new(bits_per_key: usize, frac: f64, max_moves: usize, seed: u64) -> Self {
        debug_assert!(SUPPORTED_BITS.contains(&(bits_per_key as u32)));
        Self {
            bits_per_key: bits_per_key as u32,
            frac,
            max_moves: max_moves.max(1),
            rng: SmallRng::seed_from_u64(seed),
            num_buckets: 0,
            space: Vec::new(),
            victims: BTreeSet::new(),
            finished: true, // reset() must run before inserts
        }
    }

    pub fn reset(&mut self, num_keys: u32) {
        let wanted =
            (f64::from(num_keys) / (self.frac * SLOTS_PER_BUCKET as f64)).ceil() as u64;
        self.num_buckets = next_pow2(wanted.max(1)) as u32;
        self.space.clear();
        self.space
            .resize(self.num_buckets as usize * bucket_bytes(self.bits_per_key), 0);
        self.victims.clear();
        self.finished = false;
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        let bucket_mask = self.num_buckets - 1;
        let mut fp = cuckoo_fingerprint(key, self.bits_per_key);
        let mut i = cuckoo_hash(key) & bucket_mask;
        for round in 0..self.max_moves {
            for slot in 0..SLOTS_PER_BUCKET {
                let cur = read_slot(&self.space, self.bits_per_key, i as usize, slot);
                if cur == fp {
                    return; // already present
                }
                if cur == 0 {
                    write_slot(&mut self.space, self.bits_per_key, i as usize, slot, fp);
                    return;
                }
            }
            if round != 0 {
                // Kick a random resident out and continue with it.
                let slot = self.rng.gen_range(0..SLOTS_PER_BUCKET);
                let old = read_slot(&self.space, self.bits_per_key, i as usize, slot);
                write_slot(&mut self.space, self.bits_per_key, i as usize, slot, fp);
                fp = old;
            }
            i = cuckoo_alt(i, fp) & bucket_mask;
        }
        self.victims.insert(fp);
    }

    pub fn num_victims(&self) -> usize {
        self.victims.len()
    }

    pub fn finish(&mut self) -> &[u8] {
        debug_assert!(!self.finished);
        for &fp in &self.victims {
            put_fixed32(&mut self.space, fp);
        }
        put_fixed32(&mut self.space, self.victims.len() as u32);
        put_fixed32(&mut self.space, self.num_buckets);
        put_fixed32(&mut self.space, self.bits_per_key);
        self.finished = true;
        &self.space
    }
}

/// Query a finished cuckoo blob. May report false positives (fingerprint
/// collisions) but never a false negative for an inserted key. Blobs too
/// short or with unknown parameters conservatively match.
pub fn cuckoo_may_match(key: &[u8], filter: &[u8]) -> bool {
    if filter.len() < CUCKOO_TRAILER {
        return true;
    }
    let tail = filter.len();
    let bits = u32::from_le_bytes(filter[tail - 4..].try_into().unwrap());
    if !SUPPORTED_BITS.contains(&bits) {
        return true;
    }
    let num_buckets = u32::from_le_bytes(filter[tail - 8..tail - 4].try_into().unwrap());
    let num_victims = u32::from_le_bytes(filter[tail - 12..tail - 8].try_into().unwrap());
    if num_buckets == 0 || !num_buckets.is_power_of_two() {
        return true;
    }
    let buckets_len = num_buckets as usize * bucket_bytes(bits);
    let victims_len = num_victims as usize * 4;
    if buckets_len + victims_len + CUCKOO_TRAILER != filter.len() {
        return true;
    }

    let fp = cuckoo_fingerprint(key, bits);
    let bucket_mask = num_buckets - 1;
    let i1 = cuckoo_hash(key) & bucket_mask;
    let i2 = cuckoo_alt(i1, fp) & bucket_mask;
    let buckets = &filter[..buckets_len];
    for slot in 0..SLOTS_PER_BUCKET {
        if read_slot(buckets, bits, i1 as usize, slot) == fp {
            return true;
        }
        if read_slot(buckets, bits, i2 as usize, slot) == fp {
            return true;
        }
    }

    // Victim list is sorted; binary search it.
    let victims = &filter[buckets_len..buckets_len + victims_len];
    let mut lo = 0usize;
    let mut hi = num_victims as usize;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let v = u32::from_le_bytes(victims[mid * 4..mid * 4 + 4].try_into().unwrap());
        match v.cmp(&fp) {
            std::cmp::Ordering::Equal => return true,
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: impl Iterator<Item = Vec<u8>>, n: u32, bits: usize) -> (Vec<u8>, usize) {
        let mut builder = CuckooBuilder::new(bits, 0.95, 500, 301);
        builder.reset(n);
        for key in keys {
            builder.add_key(&key);
        }
        let victims = builder.num_victims();
        (builder.finish().to_vec(), victims)
    }

    #[test]
    fn inserted_keys_always_match() {
        for bits in [10usize, 16, 20, 24, 32] {
            let n = 4096u32;
            let keys = (0..n).map(|i| format!("file-{i}").into_bytes());
            let (filter, _) = build(keys.clone(), n, bits);
            for key in keys {
                assert!(cuckoo_may_match(&key, &filter), "bits={bits} key={key:?}");
            }
        }
    }

    #[test]
    fn absent_keys_mostly_miss() {
        let n = 4096u32;
        let keys = (0..n).map(|i| format!("file-{i}").into_bytes());
        let (filter, _) = build(keys, n, 16);
        let mut hits = 0;
        let probes = 4096;
        for i in 0..probes {
            if cuckoo_may_match(format!("ghost-{i}").as_bytes(), &filter) {
                hits += 1;
            }
        }
        // 16-bit fingerprints, 8 slots probed: expect well under 1%.
        assert!(hits < probes / 64, "too many false positives: {hits}");
    }

    #[test]
    fn victims_are_persisted_and_found() {
        // An overfull table (frac > 1 worth of keys) must shed victims.
        let n = 64u32;
        let mut builder = CuckooBuilder::new(10, 0.95, 4, 301);
        builder.reset(n);
        let keys: Vec<Vec<u8>> = (0..n * 4).map(|i| format!("k{i}").into_bytes()).collect();
        for key in &keys {
            builder.add_key(key);
        }
        assert!(builder.num_victims() > 0, "test needs eviction pressure");
        let filter = builder.finish().to_vec();
        for key in &keys {
            assert!(cuckoo_may_match(key, &filter), "{key:?} lost");
        }
    }

    #[test]
    fn short_or_unknown_blobs_match() {
        assert!(cuckoo_may_match(b"k", &[]));
        assert!(cuckoo_may_match(b"k", &[0; 8]));
        // Unsupported bits_per_key in the trailer.
        let mut blob = vec![0u8; 20];
        blob[16..20].copy_from_slice(&13u32.to_le_bytes());
        assert!(cuckoo_may_match(b"k", &blob));
    }

    #[test]
    fn alt_bucket_is_involutive() {
        for fp in [1u32, 77, 1023] {
            for i in [0u32, 5, 123_456] {
                assert_eq!(cuckoo_alt(cuckoo_alt(i, fp), fp), i);
            }
        }
    }

    #[test]
    fn slot_packing_roundtrip() {
        for bits in [10u32, 16, 20, 24, 32] {
            let mut space = vec![0u8; 8 * bucket_bytes(bits)];
            let mask = if bits >= 32 { u32::MAX } else { (1 << bits) - 1 };
            for bucket in 0..8 {
                for slot in 0..SLOTS_PER_BUCKET {
                    let fp = (0x9e37_79b9u32
                        .wrapping_mul(bucket as u32 * 4 + slot as u32 + 1))
                        & mask;
                    write_slot(&mut space, bits, bucket, slot, fp);
                }
            }
            for bucket in 0..8 {
                for slot in 0..SLOTS_PER_BUCKET {
                    let fp = (0x9e37_79b9u32
                        .wrapping_mul(bucket as u32 * 4 + slot as u32 + 1))
                        & mask;
                    assert_eq!(read_slot(&space, bits, bucket, slot), fp, "bits={bits}");
                }
            }
        }
    }
}

//! Standard bloom filter.
//!
//! The last byte of the blob stores the probe count `k` so readers can
//! decode filters built with different parameters. Values of `k` above 30
//! are reserved; readers treat such blobs (and blobs under 2 bytes) as a
//! match.

use xxhash_rust::xxh32::xxh32;

const BLOOM_HASH_SEED: u32 = 0;

pub(crate) fn bloom_hash(key: &[u8]) -> u32 {
    xxh32(key, BLOOM_HASH_SEED)
}

pub struct BloomBuilder {
    bits_per_key: usize,
    k: u8,
    bits: u32,
    space: Vec<u8>,
    finished: bool,
}

impl BloomBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        // 0.69 =~ ln(2); rounding down keeps probing a little cheaper.
        let k = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30) as u8;
        Self {
            bits_per_key,
            k,
            bits: 0,
            space: Vec::new(),
            finished: true, // reset() must run before inserts
        }
    }

    pub fn reset(&mut self, num_keys: u32) {
        // Small n would see a terrible false-positive rate; enforce a
        // minimum filter length.
        let bits = (num_keys as usize * self.bits_per_key).max(64);
        let bytes = bits.div_ceil(8);
        self.space.clear();
        self.space.resize(bytes, 0);
        self.space.push(self.k);
        self.bits = (bytes * 8) as u32;
        self.finished = false;
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        // Double hashing: one base hash plus a rotated delta.
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.k {
            let bit = h % self.bits;
            self.space[bit as usize / 8] |= 1 << (bit % 8);
            h = h.wrapping_add(delta);
        }
    }

    pub fn finish(&mut self) -> &[u8] {
        debug_assert!(!self.finished);
        self.finished = true;
        &self.space
    }
}

/// Query a finished bloom blob without rebuilding any state.
pub fn bloom_may_match(key: &[u8], filter: &[u8]) -> bool {
    if filter.len() < 2 {
        return true;
    }
    let bits = ((filter.len() - 1) * 8) as u32;
    let k = filter[filter.len() - 1];
    if k > 30 {
        // Reserved for future encodings.
        return true;
    }
    let mut h = bloom_hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..k {
        let bit = h % bits;
        if filter[bit as usize / 8] & (1 << (bit % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}

//! A single fixed-size bloom filter over 16-byte packet IDs.
//!
//! Grounded on the teacher's `security::rate_limit::estimator::Estimator`
//! lock-free atomic-array shape: a boxed slice of atomics, one hash per
//! "row". Here the counters become bits (`AtomicBool` instead of
//! `AtomicIsize`) and the `D` hashes are derived directly from the ID's
//! bytes rather than through `ahash`, since the ID is already a
//! cryptographic digest and needs no further mixing.

use std::sync::atomic::{AtomicBool, Ordering};

/// A 16-byte packet or ack ID, the key into the bloom cache.
pub type Id = [u8; 16];

pub struct BloomFilter {
    bits: Box<[AtomicBool]>,
    slices: usize,
}

impl BloomFilter {
    pub fn new(num_bits: usize, slices: usize) -> Self {
        assert!(num_bits > 0, "bloom filter needs at least one bit");
        assert!(slices > 0, "bloom filter needs at least one hash slice");
        Self {
            bits: (0..num_bits).map(|_| AtomicBool::new(false)).collect(),
            slices,
        }
    }

    /// Derive `slices` independent bit indices from `id`, interpreting its
    /// bytes as that many 32-bit words modulo the bit count (§4.C).
    fn indices<'a>(&'a self, id: &'a Id) -> impl Iterator<Item = usize> + 'a {
        let len = self.bits.len();
        (0..self.slices).map(move |i| {
            let offset = (i * 4) % (id.len() - 3).max(1);
            let word = u32::from_be_bytes([
                id[offset],
                id[(offset + 1) % id.len()],
                id[(offset + 2) % id.len()],
                id[(offset + 3) % id.len()],
            ]);
            // Mix in the slice index so slices beyond id.len()/4 don't
            // repeat the same word verbatim.
            let mixed = word.wrapping_add((i as u32).wrapping_mul(0x9E3779B1));
            (mixed as usize) % len
        })
    }

    pub fn insert(&self, id: &Id) {
        for idx in self.indices(id) {
            self.bits[idx].store(true, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.indices(id).all(|idx| self.bits[idx].load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        for bit in self.bits.iter() {
            bit.store(false, Ordering::Relaxed);
        }
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn slices(&self) -> usize {
        self.slices
    }

    /// Snapshot the bit array for persistence, packed 8 bits per byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, bit) in self.bits.iter().enumerate() {
            if bit.load(Ordering::Relaxed) {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    /// Rebuild from bytes previously produced by [`to_bytes`], with the same
    /// `num_bits`/`slices` the filter was created with.
    pub fn load_bytes(&self, packed: &[u8]) {
        for (i, bit) in self.bits.iter().enumerate() {
            let byte = packed.get(i / 8).copied().unwrap_or(0);
            bit.store(byte & (1 << (i % 8)) != 0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> Id {
        let mut id = [0u8; 16];
        id[0] = seed;
        id[1] = seed.wrapping_mul(7);
        id[15] = seed.wrapping_mul(13);
        id
    }

    #[test]
    fn inserted_id_is_member() {
        let filter = BloomFilter::new(2048, 4);
        let x = id(1);
        assert!(!filter.contains(&x));
        filter.insert(&x);
        assert!(filter.contains(&x));
    }

    #[test]
    fn clear_removes_all_membership() {
        let filter = BloomFilter::new(2048, 4);
        filter.insert(&id(2));
        filter.clear();
        assert!(!filter.contains(&id(2)));
    }

    #[test]
    fn round_trips_through_bytes() {
        let filter = BloomFilter::new(1024, 3);
        filter.insert(&id(9));
        let packed = filter.to_bytes();

        let restored = BloomFilter::new(1024, 3);
        restored.load_bytes(&packed);
        assert!(restored.contains(&id(9)));
    }
}

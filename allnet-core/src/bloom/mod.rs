//! Duplicate-suppression cache: two independent rotating bloom families, one
//! over data packet IDs and one over ack IDs (§4.C).

pub mod family;
pub mod filter;

use std::path::{Path, PathBuf};

use crate::bloom::family::BloomFamily;
use crate::bloom::filter::Id;
use crate::error::Result;

/// Typical shape from spec.md §4.C: 8 filters, 1 Mbit each, 4 hash slices.
pub const DEFAULT_FAMILY_SIZE: usize = 8;
pub const DEFAULT_FILTER_BITS: usize = 1 << 20;
pub const DEFAULT_FILTER_SLICES: usize = 4;

/// Owns both bloom families for the forwarder's duplicate-suppression
/// cache. Lives directly on the forwarder's task (§5) with no internal
/// locking.
pub struct PidCache {
    data: BloomFamily,
    ack: BloomFamily,
}

impl PidCache {
    pub fn new(family_size: usize, filter_bits: usize, slices: usize) -> Self {
        Self {
            data: BloomFamily::new(family_size, filter_bits, slices),
            ack: BloomFamily::new(family_size, filter_bits, slices),
        }
    }

    /// True if `id` was already seen in the family for `is_ack`; the
    /// common check-then-insert pattern used by the forwarder's dedup step
    /// (§4.F step 2): returns `true` ("drop it") without side effects so
    /// callers decide separately whether to insert.
    pub fn is_duplicate(&self, id: &Id, is_ack: bool) -> bool {
        self.family(is_ack).is_member(id)
    }

    pub fn insert(&self, id: &Id, is_ack: bool) {
        self.family(is_ack).insert(id)
    }

    pub fn advance_data(&mut self) {
        self.data.advance();
    }

    pub fn advance_ack(&mut self) {
        self.ack.advance();
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.data.save(&data_path(dir)).await?;
        self.ack.save(&ack_path(dir)).await
    }

    pub async fn load(&mut self, dir: &Path) -> Result<()> {
        self.data.load(&data_path(dir)).await?;
        self.ack.load(&ack_path(dir)).await
    }

    fn family(&self, is_ack: bool) -> &BloomFamily {
        if is_ack {
            &self.ack
        } else {
            &self.data
        }
    }
}

fn data_path(dir: &Path) -> PathBuf {
    dir.join("pidcache.data")
}

fn ack_path(dir: &Path) -> PathBuf {
    dir.join("pidcache.ack")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> Id {
        let mut id = [0u8; 16];
        id[0] = seed;
        id
    }

    #[test]
    fn data_and_ack_families_are_independent() {
        let cache = PidCache::new(4, 4096, 4);
        cache.insert(&id(1), false);
        assert!(cache.is_duplicate(&id(1), false));
        assert!(!cache.is_duplicate(&id(1), true));
    }

    #[tokio::test]
    async fn save_and_load_round_trip_both_families() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = PidCache::new(4, 4096, 4);
        cache.insert(&id(2), false);
        cache.insert(&id(3), true);
        cache.save(dir.path()).await.unwrap();

        let mut restored = PidCache::new(4, 4096, 4);
        restored.load(dir.path()).await.unwrap();
        assert!(restored.is_duplicate(&id(2), false));
        assert!(restored.is_duplicate(&id(3), true));
        assert!(!restored.is_duplicate(&id(3), false));
    }
}

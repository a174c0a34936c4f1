//! A rotating family of `K` bloom filters (§4.C): newest is written,
//! all `K` are read, `advance()` drops the oldest and opens a fresh one.
//!
//! The family itself — "K filters, rotate, union-read" — has no direct
//! teacher analogue; it is new composition over the `BloomFilter` building
//! block, documented as such rather than attributed to any one file.

use std::collections::VecDeque;
use std::path::Path;

use tokio::fs;

use crate::bloom::filter::{BloomFilter, Id};
use crate::error::{CoreError, Result};

pub struct BloomFamily {
    /// Front is newest, back is oldest.
    filters: VecDeque<BloomFilter>,
    num_bits: usize,
    slices: usize,
    capacity: usize,
}

impl BloomFamily {
    pub fn new(capacity: usize, num_bits: usize, slices: usize) -> Self {
        assert!(capacity > 0, "bloom family needs at least one filter");
        let mut filters = VecDeque::with_capacity(capacity);
        filters.push_front(BloomFilter::new(num_bits, slices));
        Self { filters, num_bits, slices, capacity }
    }

    pub fn is_member(&self, id: &Id) -> bool {
        self.filters.iter().any(|f| f.contains(id))
    }

    pub fn insert(&self, id: &Id) {
        self.filters.front().expect("family always has a newest filter").insert(id);
    }

    /// Drop the oldest filter (if the family is at capacity) and open a
    /// fresh newest filter.
    pub fn advance(&mut self) {
        if self.filters.len() >= self.capacity {
            self.filters.pop_back();
        }
        self.filters.push_front(BloomFilter::new(self.num_bits, self.slices));
    }

    /// Write every filter's bits to `path`, oldest-first, via a temp file
    /// and atomic rename so a crash mid-write never leaves a truncated
    /// cache on disk (§4.C `save`).
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.filters.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.num_bits as u32).to_be_bytes());
        buf.extend_from_slice(&(self.slices as u32).to_be_bytes());
        for filter in self.filters.iter().rev() {
            let packed = filter.to_bytes();
            buf.extend_from_slice(&(packed.len() as u32).to_be_bytes());
            buf.extend_from_slice(&packed);
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &buf)
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Restore a family previously written by [`save`]. The on-disk
    /// `num_bits`/`slices` must match this family's configuration.
    pub async fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path).await.map_err(|e| CoreError::Persistence(e.to_string()))?;
        let mut cursor = 0usize;
        let read_u32 = |bytes: &[u8], cursor: &mut usize| -> Result<u32> {
            let slice = bytes
                .get(*cursor..*cursor + 4)
                .ok_or_else(|| CoreError::Persistence("truncated bloom file".into()))?;
            *cursor += 4;
            Ok(u32::from_be_bytes(slice.try_into().unwrap()))
        };

        let count = read_u32(&bytes, &mut cursor)? as usize;
        let num_bits = read_u32(&bytes, &mut cursor)? as usize;
        let slices = read_u32(&bytes, &mut cursor)? as usize;
        if num_bits != self.num_bits || slices != self.slices {
            return Err(CoreError::Persistence(format!(
                "bloom file shape ({num_bits}, {slices}) does not match configured ({}, {})",
                self.num_bits, self.slices
            )));
        }

        let mut loaded = VecDeque::with_capacity(count.max(1));
        for _ in 0..count {
            let len = read_u32(&bytes, &mut cursor)? as usize;
            let packed = bytes
                .get(cursor..cursor + len)
                .ok_or_else(|| CoreError::Persistence("truncated bloom file".into()))?;
            cursor += len;
            let filter = BloomFilter::new(self.num_bits, self.slices);
            filter.load_bytes(packed);
            loaded.push_front(filter);
        }
        if loaded.is_empty() {
            loaded.push_front(BloomFilter::new(self.num_bits, self.slices));
        }
        self.filters = loaded;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn filter_count(&self) -> usize {
        self.filters.len()
    }
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
    fn insert_goes_into_newest_filter_only() {
        let family = BloomFamily::new(3, 1024, 3);
        family.insert(&id(1));
        assert!(family.is_member(&id(1)));
    }

    #[test]
    fn advance_rolls_capacity_and_drops_oldest_membership() {
        let mut family = BloomFamily::new(2, 1024, 3);
        family.insert(&id(5));
        assert_eq!(family.filter_count(), 1);

        family.advance();
        assert_eq!(family.filter_count(), 2);
        assert!(family.is_member(&id(5)), "still visible through the union");

        family.advance();
        assert_eq!(family.filter_count(), 2, "capacity is never exceeded");
        assert!(!family.is_member(&id(5)), "dropped after capacity rounds of advance");
    }

    #[tokio::test]
    async fn save_then_load_restores_membership() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bloom");

        let mut family = BloomFamily::new(4, 2048, 4);
        family.insert(&id(42));
        family.advance();
        family.insert(&id(7));
        family.save(&path).await.unwrap();

        let mut restored = BloomFamily::new(4, 2048, 4);
        restored.load(&path).await.unwrap();
        assert!(restored.is_member(&id(42)));
        assert!(restored.is_member(&id(7)));
    }
}

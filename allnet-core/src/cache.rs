//! Packet retention store for the cache process (§4 "packet cache"): holds
//! recently forwarded packets so a later `DataReq` can be answered without
//! re-requesting from the original sender.
//!
//! Bounded and LRU-evicted the same way [`crate::rate::SourceRateTracker`]
//! bounds its per-source slots: both are "remember recent activity, evict
//! the coldest entry once full" stores with no cross-process persistence
//! requirement beyond the cache process's own lifetime.

use std::collections::HashMap;

use crate::packet::Packet;

pub struct PacketStore {
    capacity: usize,
    entries: HashMap<[u8; 16], Packet>,
    last_used: HashMap<[u8; 16], u64>,
    use_counter: u64,
}

impl PacketStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "packet store needs at least one slot");
        Self {
            capacity,
            entries: HashMap::new(),
            last_used: HashMap::new(),
            use_counter: 0,
        }
    }

    /// Retain `packet` under its packet id, evicting the least recently
    /// used entry first if the store is full.
    pub fn insert(&mut self, packet: Packet) {
        let id = packet.packet_id();
        if !self.entries.contains_key(&id) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.use_counter += 1;
        self.entries.insert(id, packet);
        self.last_used.insert(id, self.use_counter);
    }

    /// Look up a previously retained packet by id, marking it as freshly
    /// used on a hit.
    pub fn get(&mut self, id: &[u8; 16]) -> Option<&Packet> {
        if self.entries.contains_key(id) {
            self.use_counter += 1;
            self.last_used.insert(*id, self.use_counter);
        }
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self.last_used.iter().min_by_key(|(_, used)| **used).map(|(id, _)| *id) {
            self.entries.remove(&victim);
            self.last_used.remove(&victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Header, PacketType, ALLNET_VERSION};

    fn packet(tag: u8) -> Packet {
        let header = Header {
            version: ALLNET_VERSION,
            packet_type: PacketType::Data,
            hop_count: 0,
            max_hops: 10,
            source_nbits: 8,
            destination_nbits: 8,
            sig_algo: 0,
            transport: 0,
            source: [tag, 0, 0, 0, 0, 0, 0, 0],
            destination: [0; 8],
            message_id: None,
            expiration_ms: None,
        };
        Packet { header, payload: vec![tag; 16] }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut store = PacketStore::new(4);
        let p = packet(1);
        let id = p.packet_id();
        store.insert(p);
        assert!(store.get(&id).is_some());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut store = PacketStore::new(2);
        let a = packet(1);
        let b = packet(2);
        let id_a = a.packet_id();
        let id_b = b.packet_id();
        store.insert(a);
        store.insert(b);
        store.get(&id_a); // touch a so b becomes the LRU victim
        store.insert(packet(3));
        assert_eq!(store.len(), 2);
        assert!(store.get(&id_a).is_some());
        assert!(store.get(&id_b).is_none());
    }
}

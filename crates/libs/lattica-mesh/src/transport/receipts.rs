use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::AddressHash;

/// Tracks outbound packets awaiting a delivery proof, keyed by packet hash.
pub struct ReceiptTable {
    map: HashMap<AddressHash, ReceiptEntry>,
    order: Vec<AddressHash>,
    capacity: usize,
    timeout: Duration,
}

struct ReceiptEntry {
    destination: AddressHash,
    sent_at: Instant,
    deadline: Instant,
}

pub struct ProvenReceipt {
    pub packet_hash: AddressHash,
    pub destination: AddressHash,
    pub rtt: Duration,
}

impl ReceiptTable {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self { map: HashMap::new(), order: Vec::new(), capacity: capacity.max(1), timeout }
    }

    pub fn track(&mut self, packet_hash: AddressHash, destination: AddressHash) {
        if self.map.contains_key(&packet_hash) {
            return;
        }
        while self.map.len() >= self.capacity {
            let Some(oldest) = self.order.first().copied() else {
                break;
            };
            self.order.remove(0);
            self.map.remove(&oldest);
        }
        let now = Instant::now();
        self.map.insert(
            packet_hash,
            ReceiptEntry { destination, sent_at: now, deadline: now + self.timeout },
        );
        self.order.push(packet_hash);
    }

    pub fn destination_of(&self, packet_hash: &AddressHash) -> Option<AddressHash> {
        self.map.get(packet_hash).map(|entry| entry.destination)
    }

    /// Resolves a tracked receipt after its proof verified.
    pub fn resolve(&mut self, packet_hash: &AddressHash) -> Option<ProvenReceipt> {
        let entry = self.map.remove(packet_hash)?;
        self.order.retain(|hash| hash != packet_hash);
        Some(ProvenReceipt {
            packet_hash: *packet_hash,
            destination: entry.destination,
            rtt: entry.sent_at.elapsed(),
        })
    }

    /// Drops receipts past their deadline, returning them for timeout
    /// notification.
    pub fn cull(&mut self, now: Instant) -> Vec<(AddressHash, AddressHash)> {
        let expired: Vec<AddressHash> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for hash in expired {
            if let Some(entry) = self.map.remove(&hash) {
                out.push((hash, entry.destination));
            }
            self.order.retain(|tracked| *tracked != hash);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Low-memory response: drop everything already past half its life.
    pub fn shed(&mut self, now: Instant) {
        let half = self.timeout / 2;
        self.map.retain(|_, entry| now.duration_since(entry.sent_at) < half);
        let map = &self.map;
        self.order.retain(|hash| map.contains_key(hash));
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::destination::link::{link_id_from_request, LinkId};
use crate::hash::AddressHash;
use crate::packet::Packet;

/// Pinned forwarding state for one link crossing this transport node. Link
/// packets are addressed to the link id; each node on the establishment
/// path holds an entry and shuttles traffic between the two interfaces the
/// handshake traversed.
pub struct LinkEntry {
    pub established_at: Instant,
    pub proof_deadline: Instant,
    pub last_activity: Instant,
    /// Interface toward the initiator.
    pub request_iface: AddressHash,
    /// Transport id of the next node toward the destination.
    pub next_hop: AddressHash,
    /// Interface toward the destination.
    pub next_hop_iface: AddressHash,
    pub destination: AddressHash,
    pub expected_hops: u8,
    pub validated: bool,
}

pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    proof_timeout: Duration,
    idle_timeout: Duration,
}

impl LinkTable {
    pub fn new(proof_timeout: Duration, idle_timeout: Duration) -> Self {
        Self { entries: HashMap::new(), proof_timeout, idle_timeout }
    }

    /// Pins an entry when a link request is forwarded. Duplicate requests
    /// keep the original pin; re-pinning would let a replay retarget an
    /// in-flight handshake.
    pub fn add(
        &mut self,
        link_request: &Packet,
        destination: AddressHash,
        request_iface: AddressHash,
        next_hop: AddressHash,
        next_hop_iface: AddressHash,
    ) {
        let link_id = link_id_from_request(link_request);
        if self.entries.contains_key(&link_id) {
            return;
        }

        let now = Instant::now();
        self.entries.insert(
            link_id,
            LinkEntry {
                established_at: now,
                proof_deadline: now + self.proof_timeout,
                last_activity: now,
                request_iface,
                next_hop,
                next_hop_iface,
                destination,
                expected_hops: link_request.header.hops.saturating_add(1),
                validated: false,
            },
        );
    }

    pub fn contains(&self, link_id: &LinkId) -> bool {
        self.entries.contains_key(link_id)
    }

    pub fn destination_of(&self, link_id: &LinkId) -> Option<AddressHash> {
        self.entries.get(link_id).filter(|entry| entry.validated).map(|entry| entry.destination)
    }

    /// Marks the link proven and returns the interface toward the
    /// initiator the proof should continue on.
    pub fn handle_proof(&mut self, link_id: &LinkId) -> Option<AddressHash> {
        let entry = self.entries.get_mut(link_id)?;
        entry.validated = true;
        entry.last_activity = Instant::now();
        Some(entry.request_iface)
    }

    /// Picks the egress interface for a link packet based on where it came
    /// from. Packets from the destination side flow toward the initiator
    /// and vice versa; anything arriving on an unrelated interface is not
    /// routed.
    pub fn route(&mut self, link_id: &LinkId, arrived_on: AddressHash) -> Option<AddressHash> {
        let entry = self.entries.get_mut(link_id)?;
        if !entry.validated {
            return None;
        }
        entry.last_activity = Instant::now();

        if arrived_on == entry.next_hop_iface {
            Some(entry.request_iface)
        } else if arrived_on == entry.request_iface {
            Some(entry.next_hop_iface)
        } else {
            None
        }
    }

    pub fn cull(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        let idle_timeout = self.idle_timeout;
        self.entries.retain(|_, entry| {
            if entry.validated {
                now.duration_since(entry.last_activity) < idle_timeout
            } else {
                now < entry.proof_deadline
            }
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketType, PayloadBuffer};

    fn link_request() -> Packet {
        Packet {
            header: crate::packet::Header {
                packet_type: PacketType::LinkRequest,
                ..Default::default()
            },
            destination: AddressHash::of(b"destination"),
            data: PayloadBuffer::from_slice(&[7u8; 64]),
            ..Default::default()
        }
    }

    #[test]
    fn proof_validates_and_routes_backwards() {
        let mut table = LinkTable::new(Duration::from_secs(10), Duration::from_secs(60));
        let request = link_request();
        let toward_initiator = AddressHash::of(b"iface-a");
        let toward_destination = AddressHash::of(b"iface-b");

        table.add(
            &request,
            request.destination,
            toward_initiator,
            AddressHash::of(b"next"),
            toward_destination,
        );
        let link_id = link_id_from_request(&request);

        // Unvalidated entries do not route data.
        assert_eq!(table.route(&link_id, toward_destination), None);

        assert_eq!(table.handle_proof(&link_id), Some(toward_initiator));
        assert_eq!(table.route(&link_id, toward_destination), Some(toward_initiator));
        assert_eq!(table.route(&link_id, toward_initiator), Some(toward_destination));
        assert_eq!(table.route(&link_id, AddressHash::of(b"elsewhere")), None);
    }

    #[test]
    fn duplicate_request_keeps_original_pin() {
        let mut table = LinkTable::new(Duration::from_secs(10), Duration::from_secs(60));
        let request = link_request();
        let first_iface = AddressHash::of(b"first");

        table.add(
            &request,
            request.destination,
            first_iface,
            AddressHash::of(b"next"),
            AddressHash::of(b"out"),
        );
        table.add(
            &request,
            request.destination,
            AddressHash::of(b"second"),
            AddressHash::of(b"next"),
            AddressHash::of(b"out"),
        );

        let link_id = link_id_from_request(&request);
        assert_eq!(table.handle_proof(&link_id), Some(first_iface));
    }

    #[test]
    fn unproven_entries_expire() {
        let mut table = LinkTable::new(Duration::from_millis(0), Duration::from_secs(60));
        let request = link_request();
        table.add(
            &request,
            request.destination,
            AddressHash::of(b"a"),
            AddressHash::of(b"n"),
            AddressHash::of(b"b"),
        );
        assert_eq!(table.cull(), 1);
        assert!(table.is_empty());
    }
}

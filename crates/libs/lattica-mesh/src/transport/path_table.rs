use std::collections::HashMap;

use crate::hash::AddressHash;
use crate::iface::InterfaceMode;
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, Packet, PacketContext, PacketType,
    PayloadBuffer, TransportType,
};

/// One known route to a destination.
pub struct PathEntry {
    /// Transport id of the node that relayed the announce (the announcer
    /// itself on a direct path). Packets for this destination beyond one hop
    /// are addressed to it.
    pub received_from: AddressHash,
    pub iface: AddressHash,
    pub hops: u8,
    pub expires_at: u64,
    pub announce_timestamp: u64,
    /// Cached announce payload, replayed for path responses and tunnels.
    pub announce_payload: Vec<u8>,
    pub announce_has_ratchet: bool,
    pub source_mode: InterfaceMode,
}

/// destination hash → best known path. One entry per destination; the
/// replacement rule prefers strictly fewer hops, then newer announces, and
/// always replaces an expired entry.
#[derive(Default)]
pub struct PathTable {
    map: HashMap<AddressHash, PathEntry>,
}

impl PathTable {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn should_accept(
        &self,
        destination: &AddressHash,
        hops: u8,
        announce_timestamp: u64,
        now: u64,
    ) -> bool {
        match self.map.get(destination) {
            None => true,
            Some(existing) => {
                now > existing.expires_at
                    || hops < existing.hops
                    || (hops == existing.hops
                        && announce_timestamp > existing.announce_timestamp)
            }
        }
    }

    pub fn insert(&mut self, destination: AddressHash, entry: PathEntry) {
        log::info!(
            "path: {} reachable over {} hops via {} on {}",
            destination,
            entry.hops,
            entry.received_from,
            entry.iface,
        );
        self.map.insert(destination, entry);
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.map.get(destination)
    }

    pub fn has_path(&self, destination: &AddressHash, now: u64) -> bool {
        self.map.get(destination).map(|entry| entry.expires_at >= now).unwrap_or(false)
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.map.get(destination).map(|entry| entry.hops)
    }

    pub fn next_hop_iface(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.map.get(destination).map(|entry| entry.iface)
    }

    pub fn remove(&mut self, destination: &AddressHash) -> Option<PathEntry> {
        self.map.remove(destination)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AddressHash, &PathEntry)> {
        self.map.iter()
    }

    /// Removes expired entries and entries whose interface is gone, keeping
    /// the invariant that a present entry always points at a live interface.
    pub fn cull<F: Fn(&AddressHash) -> bool>(&mut self, now: u64, iface_online: F) -> usize {
        let before = self.map.len();
        self.map.retain(|destination, entry| {
            let keep = now <= entry.expires_at && iface_online(&entry.iface);
            if !keep {
                log::debug!("path: dropping {}", destination);
            }
            keep
        });
        before - self.map.len()
    }

    /// Routes a locally-originated or delivered-for-forwarding packet. A
    /// one-hop path keeps the single-address header; longer paths are
    /// readdressed to the recorded relay.
    pub fn route_outbound(&self, packet: &Packet) -> (Packet, Option<AddressHash>) {
        if packet.header.header_type == HeaderType::Header2
            || packet.header.packet_type == PacketType::Announce
            || matches!(
                packet.header.destination_type,
                DestinationType::Plain | DestinationType::Group
            )
        {
            return (*packet, None);
        }

        let Some(entry) = self.map.get(&packet.destination) else {
            return (*packet, None);
        };

        if entry.hops <= 1 {
            return (*packet, Some(entry.iface));
        }

        let mut routed = *packet;
        routed.header.header_type = HeaderType::Header2;
        routed.header.transport_type = TransportType::Transport;
        routed.transport_id = Some(entry.received_from);
        (routed, Some(entry.iface))
    }

    /// Reconstructs an announce packet from the cached payload, used to
    /// answer path requests without waiting for the destination itself.
    pub fn cached_announce(
        &self,
        destination: &AddressHash,
        context: PacketContext,
    ) -> Option<Packet> {
        let entry = self.map.get(destination)?;
        Some(Packet {
            header: Header {
                context_flag: if entry.announce_has_ratchet {
                    ContextFlag::Set
                } else {
                    ContextFlag::Unset
                },
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: entry.hops,
                ..Default::default()
            },
            ifac: None,
            destination: *destination,
            transport_id: None,
            context,
            data: PayloadBuffer::from_slice(&entry.announce_payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PayloadBuffer;

    fn entry(hops: u8, timestamp: u64, expires_at: u64) -> PathEntry {
        PathEntry {
            received_from: AddressHash::of(b"relay"),
            iface: AddressHash::of(b"iface"),
            hops,
            expires_at,
            announce_timestamp: timestamp,
            announce_payload: Vec::new(),
            announce_has_ratchet: false,
            source_mode: InterfaceMode::Full,
        }
    }

    #[test]
    fn replacement_rule() {
        let mut table = PathTable::new();
        let destination = AddressHash::of(b"dst");
        let now = 1000u64;
        table.insert(destination, entry(3, 500, now + 3600));

        // More hops, same age: rejected.
        assert!(!table.should_accept(&destination, 4, 500, now));
        // Same hops, older: rejected.
        assert!(!table.should_accept(&destination, 3, 400, now));
        // Same hops, newer: accepted.
        assert!(table.should_accept(&destination, 3, 600, now));
        // Fewer hops, older: accepted.
        assert!(table.should_accept(&destination, 2, 100, now));
        // Anything goes once the entry expired.
        assert!(table.should_accept(&destination, 9, 1, now + 7200));
    }

    #[test]
    fn cull_removes_expired_and_offline() {
        let mut table = PathTable::new();
        let expired = AddressHash::of(b"expired");
        let live = AddressHash::of(b"live");
        table.insert(expired, entry(1, 0, 10));
        table.insert(live, entry(1, 0, 10_000));

        assert_eq!(table.cull(100, |_| true), 1);
        assert!(table.get(&live).is_some());

        // The remaining entry dies with its interface.
        assert_eq!(table.cull(100, |_| false), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn one_hop_routes_keep_single_address_header() {
        let mut table = PathTable::new();
        let destination = AddressHash::of(b"dst");
        table.insert(destination, entry(1, 0, u64::MAX));

        let packet = Packet { destination, ..Default::default() };
        let (routed, iface) = table.route_outbound(&packet);
        assert_eq!(iface, Some(AddressHash::of(b"iface")));
        assert_eq!(routed.header.header_type, HeaderType::Header1);
        assert_eq!(routed.transport_id, None);
    }

    #[test]
    fn multi_hop_routes_promote_to_two_address_header() {
        let mut table = PathTable::new();
        let destination = AddressHash::of(b"dst");
        table.insert(destination, entry(3, 0, u64::MAX));

        let packet = Packet { destination, ..Default::default() };
        let (routed, iface) = table.route_outbound(&packet);
        assert_eq!(iface, Some(AddressHash::of(b"iface")));
        assert_eq!(routed.header.header_type, HeaderType::Header2);
        assert_eq!(routed.header.transport_type, TransportType::Transport);
        assert_eq!(routed.transport_id, Some(AddressHash::of(b"relay")));
    }

    #[test]
    fn cached_announce_carries_stored_payload() {
        let mut table = PathTable::new();
        let destination = AddressHash::of(b"dst");
        let mut stored = entry(2, 0, u64::MAX);
        stored.announce_payload = b"announce payload".to_vec();
        stored.announce_has_ratchet = true;
        table.insert(destination, stored);

        let rebuilt = table
            .cached_announce(&destination, PacketContext::PathResponse)
            .expect("cached");
        assert_eq!(rebuilt.context, PacketContext::PathResponse);
        assert_eq!(rebuilt.header.context_flag, ContextFlag::Set);
        assert_eq!(rebuilt.header.hops, 2);
        assert_eq!(rebuilt.data, PayloadBuffer::from_slice(b"announce payload"));
    }
}

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand_core::OsRng;

use crate::destination::{DestinationName, PlainInputDestination};
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};
use crate::packet::{
    DestinationType, Header, Packet, PacketType, PayloadBuffer,
};

const TAG_CACHE_CAPACITY: usize = 256;

/// The well-known probe endpoint every node listens on.
pub fn path_request_destination() -> PlainInputDestination {
    let name = DestinationName::new("lattica", &["path", "request"])
        .expect("constant name is dot-free");
    PlainInputDestination::new(name)
}

pub struct PathRequest {
    pub destination: AddressHash,
    pub requesting_transport: Option<AddressHash>,
    pub tag: Vec<u8>,
}

impl PathRequest {
    /// Wire layout: `target(16) ‖ [requesting_transport(16)] ‖ tag(≤16)`.
    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() <= ADDRESS_HASH_SIZE {
            return None;
        }

        let destination = AddressHash::from_slice(&data[..ADDRESS_HASH_SIZE]).ok()?;

        let (requesting_transport, tag_start) = if data.len() > 2 * ADDRESS_HASH_SIZE {
            (
                AddressHash::from_slice(&data[ADDRESS_HASH_SIZE..2 * ADDRESS_HASH_SIZE]).ok(),
                2 * ADDRESS_HASH_SIZE,
            )
        } else {
            (None, ADDRESS_HASH_SIZE)
        };

        let tag_end = data.len().min(tag_start + ADDRESS_HASH_SIZE);
        Some(Self {
            destination,
            requesting_transport,
            tag: data[tag_start..tag_end].to_vec(),
        })
    }
}

/// Path request codec plus the bookkeeping that keeps a transport node from
/// amplifying probes: duplicate tags are ignored and recursive requests are
/// bounded both per destination and in total.
pub struct PathRequests {
    name: String,
    transport_id: Option<AddressHash>,
    probe_destination: AddressHash,
    seen_tags: VecDeque<(AddressHash, Vec<u8>)>,
    pending: HashMap<AddressHash, Instant>,
    pending_order: VecDeque<(AddressHash, Instant)>,
    max_pending: usize,
    request_timeout: Duration,
}

impl PathRequests {
    pub fn new(
        name: &str,
        transport_id: Option<AddressHash>,
        max_pending: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            transport_id,
            probe_destination: path_request_destination().address_hash,
            seen_tags: VecDeque::new(),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            max_pending: max_pending.max(1),
            request_timeout,
        }
    }

    pub fn probe_destination(&self) -> &AddressHash {
        &self.probe_destination
    }

    /// Decodes an inbound request, dropping duplicates by (target, tag).
    pub fn decode(&mut self, data: &[u8]) -> Option<PathRequest> {
        let request = PathRequest::decode(data)?;

        let key = (request.destination, request.tag.clone());
        if self.seen_tags.contains(&key) {
            log::debug!(
                "tp({}): duplicate path request for {} ignored",
                self.name,
                request.destination
            );
            return None;
        }
        if self.seen_tags.len() >= TAG_CACHE_CAPACITY {
            self.seen_tags.pop_front();
        }
        self.seen_tags.push_back(key);

        Some(request)
    }

    /// Builds an outbound path request for `destination`.
    pub fn generate(&self, destination: &AddressHash, tag: Option<&[u8]>) -> Packet {
        let mut data = PayloadBuffer::from_slice(destination.as_slice());
        if let Some(transport_id) = self.transport_id {
            let _ = data.write(transport_id.as_slice());
        }
        match tag {
            Some(tag) => {
                let _ = data.write(tag);
            }
            None => {
                let _ = data.write(AddressHash::random(OsRng).as_slice());
            }
        }

        Packet {
            header: Header {
                destination_type: DestinationType::Plain,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.probe_destination,
            transport_id: None,
            context: crate::packet::PacketContext::None,
            data,
        }
    }

    /// Rate-limited recursive request issued while serving someone else's
    /// probe for a destination this node has no path to.
    pub fn generate_recursive(&mut self, destination: &AddressHash) -> Option<Packet> {
        let now = Instant::now();

        while let Some((queued, deadline)) = self.pending_order.front().copied() {
            if deadline > now {
                break;
            }
            self.pending_order.pop_front();
            if self.pending.get(&queued).is_some_and(|entry| *entry <= now) {
                self.pending.remove(&queued);
            }
        }

        if let Some(deadline) = self.pending.get(destination) {
            if *deadline > now {
                log::debug!(
                    "tp({}): recursive path request for {} already pending",
                    self.name,
                    destination
                );
                return None;
            }
            self.pending.remove(destination);
        }

        if self.pending.len() >= self.max_pending {
            log::debug!(
                "tp({}): recursive path request budget exhausted, dropping {}",
                self.name,
                destination
            );
            return None;
        }

        let deadline = now + self.request_timeout;
        self.pending.insert(*destination, deadline);
        self.pending_order.push_back((*destination, deadline));

        Some(self.generate(destination, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_with_transport_id() {
        let transport_id = AddressHash::of(b"transport");
        let mut requests =
            PathRequests::new("tp", Some(transport_id), 8, Duration::from_secs(30));
        let target = AddressHash::of(b"target");

        let packet = requests.generate(&target, None);
        assert_eq!(packet.destination, *requests.probe_destination());

        let decoded = requests.decode(packet.data.as_slice()).expect("decoded");
        assert_eq!(decoded.destination, target);
        assert_eq!(decoded.requesting_transport, Some(transport_id));
        assert_eq!(decoded.tag.len(), ADDRESS_HASH_SIZE);
    }

    #[test]
    fn duplicate_tag_is_dropped() {
        let mut requests = PathRequests::new("tp", None, 8, Duration::from_secs(30));
        let packet = requests.generate(&AddressHash::of(b"target"), Some(b"tag-1"));

        assert!(requests.decode(packet.data.as_slice()).is_some());
        assert!(requests.decode(packet.data.as_slice()).is_none());
    }

    #[test]
    fn recursive_requests_are_bounded() {
        let mut requests = PathRequests::new("tp", None, 2, Duration::from_secs(30));

        assert!(requests.generate_recursive(&AddressHash::of(b"a")).is_some());
        // A pending destination is not asked twice.
        assert!(requests.generate_recursive(&AddressHash::of(b"a")).is_none());
        assert!(requests.generate_recursive(&AddressHash::of(b"b")).is_some());
        // Budget of two pending requests is spent.
        assert!(requests.generate_recursive(&AddressHash::of(b"c")).is_none());
    }

    #[test]
    fn short_payload_is_rejected() {
        let mut requests = PathRequests::new("tp", None, 8, Duration::from_secs(30));
        assert!(requests.decode(&[0u8; ADDRESS_HASH_SIZE]).is_none());
    }
}

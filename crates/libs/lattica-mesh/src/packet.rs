use core::fmt;

use sha2::Digest;

use crate::buffer::{InputBuffer, StaticBuffer};
use crate::error::MeshError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};

pub const MTU: usize = 500;
pub const HEADER_MIN_SIZE: usize = 2 + ADDRESS_HASH_SIZE + 1;
pub const HEADER_MAX_SIZE: usize = 2 + 2 * ADDRESS_HASH_SIZE + 1;
pub const PACKET_MDU: usize = MTU - HEADER_MAX_SIZE - 1;
pub const IFAC_TAG_MAX: usize = 16;

/// Hop ceiling. A packet claiming more hops than this is dropped on arrival
/// and leaves no state behind.
pub const MAX_HOPS: u8 = 128;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    /// One address field: destination only.
    Header1 = 0b0,
    /// Two address fields: transport id + destination.
    Header2 = 0b1,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TransportType {
    Broadcast = 0b0,
    Transport = 0b1,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContextFlag {
    Unset = 0b0,
    Set = 0b1,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => DestinationType::Single,
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            _ => DestinationType::Link,
        }
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => PacketType::Data,
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            _ => PacketType::Proof,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

/// First wire byte:
/// `ifac(1) | header_type(1) | context_flag(1) | transport_type(1) |
/// destination_type(2) | packet_type(2)`. The second byte carries hops.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub context_flag: ContextFlag,
    pub transport_type: TransportType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Header {
    pub fn to_flags(&self) -> u8 {
        (self.ifac_flag as u8) << 7
            | (self.header_type as u8) << 6
            | (self.context_flag as u8) << 5
            | (self.transport_type as u8) << 4
            | (self.destination_type as u8) << 2
            | self.packet_type as u8
    }

    pub fn from_flags(flags: u8) -> Self {
        Self {
            ifac_flag: if flags >> 7 & 0b1 == 1 { IfacFlag::Authenticated } else { IfacFlag::Open },
            header_type: if flags >> 6 & 0b1 == 1 { HeaderType::Header2 } else { HeaderType::Header1 },
            context_flag: if flags >> 5 & 0b1 == 1 { ContextFlag::Set } else { ContextFlag::Unset },
            transport_type: if flags >> 4 & 0b1 == 1 {
                TransportType::Transport
            } else {
                TransportType::Broadcast
            },
            destination_type: DestinationType::from(flags >> 2),
            packet_type: PacketType::from(flags),
            hops: 0,
        }
    }

    /// The four low bits (destination type + packet type) — the part of the
    /// flags that survives forwarding and feeds the packet hash.
    pub fn route_flags(&self) -> u8 {
        self.to_flags() & 0b0000_1111
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Header1,
            context_flag: ContextFlag::Unset,
            transport_type: TransportType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}.{}", self.to_flags(), self.hops)
    }
}

/// Truncated interface authentication tag as carried on the wire.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct IfacTag {
    bytes: [u8; IFAC_TAG_MAX],
    len: usize,
}

impl IfacTag {
    pub fn from_slice(slice: &[u8]) -> Result<Self, MeshError> {
        if slice.is_empty() || slice.len() > IFAC_TAG_MAX {
            return Err(MeshError::MalformedPacket);
        }
        let mut bytes = [0u8; IFAC_TAG_MAX];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self { bytes, len: slice.len() })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

pub type PayloadBuffer = StaticBuffer<PACKET_MDU>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub ifac: Option<IfacTag>,
    pub destination: AddressHash,
    pub transport_id: Option<AddressHash>,
    pub context: PacketContext,
    pub data: PayloadBuffer,
}

impl Packet {
    /// Serialized wire layout:
    /// `flags ‖ hops ‖ [transport_id] ‖ destination ‖ context ‖ [ifac] ‖ data`.
    pub fn pack(&self) -> Result<Vec<u8>, MeshError> {
        let mut out = Vec::with_capacity(HEADER_MAX_SIZE + IFAC_TAG_MAX + self.data.len());

        let mut header = self.header;
        header.ifac_flag =
            if self.ifac.is_some() { IfacFlag::Authenticated } else { IfacFlag::Open };

        out.push(header.to_flags());
        out.push(header.hops);

        match self.header.header_type {
            HeaderType::Header2 => {
                let transport_id = self.transport_id.ok_or(MeshError::MalformedPacket)?;
                out.extend_from_slice(transport_id.as_slice());
            }
            HeaderType::Header1 => {
                if self.transport_id.is_some() {
                    return Err(MeshError::MalformedPacket);
                }
            }
        }

        out.extend_from_slice(self.destination.as_slice());
        out.push(self.context as u8);

        if let Some(ifac) = &self.ifac {
            out.extend_from_slice(ifac.as_slice());
        }

        out.extend_from_slice(self.data.as_slice());
        Ok(out)
    }

    /// Parses a wire frame. `ifac_size` is the receiving interface's fixed
    /// tag length; it is needed to split tag from payload when the IFAC bit
    /// is set. A set bit with `ifac_size == 0` cannot be parsed and is
    /// treated as malformed.
    pub fn unpack(bytes: &[u8], ifac_size: usize) -> Result<Self, MeshError> {
        if bytes.len() < HEADER_MIN_SIZE {
            return Err(MeshError::MalformedPacket);
        }

        let mut input = InputBuffer::new(bytes);
        let mut header = Header::from_flags(input.read_byte()?);
        header.hops = input.read_byte()?;

        let transport_id = match header.header_type {
            HeaderType::Header2 => Some(AddressHash::new(input.read_array::<ADDRESS_HASH_SIZE>()?)),
            HeaderType::Header1 => None,
        };

        let destination = AddressHash::new(input.read_array::<ADDRESS_HASH_SIZE>()?);
        let context = PacketContext::from(input.read_byte()?);

        let ifac = match header.ifac_flag {
            IfacFlag::Authenticated => {
                if ifac_size == 0 {
                    return Err(MeshError::MalformedPacket);
                }
                Some(IfacTag::from_slice(input.read_slice(ifac_size)?)?)
            }
            IfacFlag::Open => None,
        };

        let payload = input.rest();
        if payload.len() > PACKET_MDU {
            return Err(MeshError::MalformedPacket);
        }

        Ok(Self {
            header,
            ifac,
            destination,
            transport_id,
            context,
            data: PayloadBuffer::from_slice(payload),
        })
    }

    /// Packet hash over the routable part: the low header bits (hops and
    /// addressing zeroed), destination, context and payload. A forwarded
    /// copy therefore hashes equal to its original, which the dedup
    /// hashlist depends on.
    pub fn hash(&self) -> AddressHash {
        self.hash_with_data(self.data.as_slice())
    }

    /// Same domain as `hash`, but over a caller-chosen payload prefix. Link
    /// ids are derived this way from the key material of a link request,
    /// excluding trailing negotiation bytes.
    pub fn hash_with_data(&self, data: &[u8]) -> AddressHash {
        let hash: Hash = Hash::hasher()
            .chain_update([self.header.route_flags()])
            .chain_update(self.destination.as_slice())
            .chain_update([self.context as u8])
            .chain_update(data)
            .into();
        AddressHash::truncating(&hash)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Header::default(),
            ifac: None,
            destination: AddressHash::zero(),
            transport_id: None,
            context: PacketContext::None,
            data: PayloadBuffer::new(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport_id) = self.transport_id {
            write!(f, " via {}", transport_id)?;
        }
        write!(f, " {} {}B]", self.destination, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            header: Header {
                packet_type: PacketType::Data,
                destination_type: DestinationType::Single,
                hops: 3,
                ..Default::default()
            },
            destination: AddressHash::of(b"destination"),
            context: PacketContext::Request,
            data: PayloadBuffer::from_slice(b"payload bytes"),
            ..Default::default()
        }
    }

    #[test]
    fn pack_unpack_round_trip_header1() {
        let packet = sample_packet();
        let wire = packet.pack().expect("packed");
        let parsed = Packet::unpack(&wire, 0).expect("unpacked");
        assert_eq!(parsed, packet);
    }

    #[test]
    fn pack_unpack_round_trip_header2() {
        let mut packet = sample_packet();
        packet.header.header_type = HeaderType::Header2;
        packet.header.transport_type = TransportType::Transport;
        packet.transport_id = Some(AddressHash::of(b"next hop"));

        let wire = packet.pack().expect("packed");
        assert_eq!(wire.len(), HEADER_MAX_SIZE + packet.data.len());
        let parsed = Packet::unpack(&wire, 0).expect("unpacked");
        assert_eq!(parsed, packet);
    }

    #[test]
    fn pack_unpack_round_trip_with_ifac_sizes() {
        for size in [1usize, 8, 16] {
            let mut packet = sample_packet();
            packet.ifac = Some(IfacTag::from_slice(&vec![0xA5u8; size]).expect("tag"));

            let wire = packet.pack().expect("packed");
            let parsed = Packet::unpack(&wire, size).expect("unpacked");
            assert_eq!(parsed.ifac.expect("tag present").as_slice(), &vec![0xA5u8; size][..]);
            assert_eq!(parsed.data, packet.data);
        }
    }

    #[test]
    fn ifac_bit_without_size_is_malformed() {
        let mut packet = sample_packet();
        packet.ifac = Some(IfacTag::from_slice(&[0u8; 8]).expect("tag"));
        let wire = packet.pack().expect("packed");
        assert_eq!(Packet::unpack(&wire, 0), Err(MeshError::MalformedPacket));
    }

    #[test]
    fn header2_without_transport_id_fails_to_pack() {
        let mut packet = sample_packet();
        packet.header.header_type = HeaderType::Header2;
        assert_eq!(packet.pack(), Err(MeshError::MalformedPacket));
    }

    #[test]
    fn hash_ignores_hops_and_transport_addressing() {
        let original = sample_packet();

        let mut forwarded = original;
        forwarded.header.hops += 1;
        forwarded.header.header_type = HeaderType::Header2;
        forwarded.header.transport_type = TransportType::Transport;
        forwarded.transport_id = Some(AddressHash::of(b"relay"));

        assert_eq!(original.hash(), forwarded.hash());

        let mut different = original;
        different.data = PayloadBuffer::from_slice(b"other payload");
        assert_ne!(original.hash(), different.hash());
    }

    #[test]
    fn truncated_wire_is_rejected() {
        let wire = sample_packet().pack().expect("packed");
        assert!(Packet::unpack(&wire[..HEADER_MIN_SIZE - 1], 0).is_err());
    }
}

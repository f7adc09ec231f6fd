use std::collections::HashMap;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use rand_core::{CryptoRngCore, OsRng};
use tokio::sync::broadcast;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::destination::DestinationDesc;
use crate::error::MeshError;
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};
use crate::identity::{
    DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketType, PayloadBuffer, PACKET_MDU,
};

/// A silent link turns stale after this long and a keepalive probe goes out.
pub const LINK_STALE_AFTER: Duration = Duration::from_secs(288);
/// A stale link with no reply closes after this long.
pub const LINK_CLOSE_AFTER: Duration = Duration::from_secs(360);
/// Establishment budget per path hop.
pub const ESTABLISHMENT_TIMEOUT_PER_HOP: Duration = Duration::from_secs(6);
/// Session payload ceiling when MTU discovery is off.
pub const LINK_MDU: usize = 325;

const MTU_FIELD_SIZE: usize = 3;
const KEEPALIVE_PROBE: u8 = 0xFF;
const KEEPALIVE_REPLY: u8 = 0xFE;
const KEY_MATERIAL_LENGTH: usize = 2 * PUBLIC_KEY_LENGTH;

pub type LinkId = AddressHash;
pub type RequestId = AddressHash;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        matches!(self, LinkStatus::Pending | LinkStatus::Handshake)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CloseReason {
    EstablishmentTimeout,
    InactivityTimeout,
    ProofInvalid,
    TeardownRequested,
    PeerClosed,
}

/// Application payload delivered over a link, with the packet context it
/// arrived under and, for requests, the peer's request id.
#[derive(Clone)]
pub struct LinkPayload {
    pub data: Vec<u8>,
    pub context: PacketContext,
    pub request_id: Option<RequestId>,
}

#[derive(Clone)]
pub enum LinkEvent {
    Activated,
    Data { sequence: u64, payload: Box<LinkPayload> },
    Response { request_id: RequestId, data: Vec<u8> },
    RequestFailed { request_id: RequestId, reason: MeshError },
    Closed(CloseReason),
}

#[derive(Clone)]
pub struct LinkEventData {
    pub id: LinkId,
    pub destination: AddressHash,
    pub event: LinkEvent,
}

/// What the owner must do with an inbound packet's outcome.
#[allow(clippy::large_enum_variant)]
pub enum LinkHandleResult {
    None,
    Activated,
    /// Send this packet back out (a proof or a keepalive reply).
    Reply(Packet),
    Closed(CloseReason),
}

struct PendingRequest {
    deadline: Instant,
}

/// Derives a link id from a link-request packet: the packet hash domain
/// restricted to the key material, so trailing negotiation bytes do not
/// change the id either side computes.
pub fn link_id_from_request(packet: &Packet) -> LinkId {
    let data = packet.data.as_slice();
    let keyed = data.len().min(KEY_MATERIAL_LENGTH);
    packet.hash_with_data(&data[..keyed])
}

/// Encrypted session between two destinations over the unreliable packet
/// substrate. One side initiates (`new` + `establishment_packet`), the other
/// answers (`new_from_request` + `prove`). Only ACTIVE links move data.
pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    ephemeral_identity: PrivateIdentity,
    peer_identity: Option<Identity>,
    derived_key: Option<DerivedKey>,
    status: LinkStatus,
    close_reason: Option<CloseReason>,
    is_initiator: bool,
    request_sent_at: Instant,
    last_activity: Instant,
    expected_hops: u8,
    rtt: Option<Duration>,
    peer_rtt: Option<Duration>,
    mtu: usize,
    mtu_discovery: bool,
    next_sequence: u64,
    pending_requests: HashMap<RequestId, PendingRequest>,
    event_tx: broadcast::Sender<LinkEventData>,
}

impl Link {
    pub fn new(destination: DestinationDesc, event_tx: broadcast::Sender<LinkEventData>) -> Self {
        Self {
            id: AddressHash::zero(),
            destination,
            ephemeral_identity: PrivateIdentity::generate(OsRng),
            peer_identity: None,
            derived_key: None,
            status: LinkStatus::Pending,
            close_reason: None,
            is_initiator: true,
            request_sent_at: Instant::now(),
            last_activity: Instant::now(),
            expected_hops: 1,
            rtt: None,
            peer_rtt: None,
            mtu: LINK_MDU,
            mtu_discovery: false,
            next_sequence: 0,
            pending_requests: HashMap::new(),
            event_tx,
        }
    }

    /// Responder construction from an inbound link request. Uses the
    /// destination's signing key for the proof and a fresh X25519 pair for
    /// the session.
    pub fn new_from_request(
        packet: &Packet,
        sign_key: SigningKey,
        destination: DestinationDesc,
        mtu_discovery: bool,
        event_tx: broadcast::Sender<LinkEventData>,
    ) -> Result<Self, MeshError> {
        let data = packet.data.as_slice();
        if data.len() < KEY_MATERIAL_LENGTH {
            return Err(MeshError::MalformedPacket);
        }

        let peer_identity = Identity::from_public_bytes(&data[..KEY_MATERIAL_LENGTH])?;

        let mtu = if mtu_discovery && data.len() >= KEY_MATERIAL_LENGTH + MTU_FIELD_SIZE {
            let offered = decode_mtu(&data[KEY_MATERIAL_LENGTH..KEY_MATERIAL_LENGTH + MTU_FIELD_SIZE]);
            offered.min(PACKET_MDU)
        } else {
            LINK_MDU
        };

        let id = link_id_from_request(packet);
        log::debug!("link({}): responder created from request", id);

        let mut link = Self {
            id,
            destination,
            ephemeral_identity: PrivateIdentity::new(
                StaticSecret::random_from_rng(OsRng),
                sign_key,
            ),
            peer_identity: Some(peer_identity),
            derived_key: None,
            status: LinkStatus::Pending,
            close_reason: None,
            is_initiator: false,
            request_sent_at: Instant::now(),
            last_activity: Instant::now(),
            expected_hops: packet.header.hops.max(1),
            rtt: None,
            peer_rtt: None,
            mtu,
            mtu_discovery,
            next_sequence: 0,
            pending_requests: HashMap::new(),
            event_tx,
        };

        link.handshake(peer_identity);
        Ok(link)
    }

    pub fn set_mtu_discovery(&mut self, enabled: bool, local_mtu: usize) {
        self.mtu_discovery = enabled;
        if enabled {
            self.mtu = local_mtu.min(PACKET_MDU);
        }
    }

    pub fn set_expected_hops(&mut self, hops: u8) {
        self.expected_hops = hops.max(1);
    }

    /// Initiator's LINKREQUEST packet: ephemeral public keys, plus the MTU
    /// trailer when discovery is on. Computes and pins the link id.
    pub fn establishment_packet(&mut self) -> Result<Packet, MeshError> {
        let identity = self.ephemeral_identity.as_identity();

        let mut data = PayloadBuffer::new();
        data.append(identity.public_key_bytes())?
            .append(identity.verifying_key_bytes())?;
        if self.mtu_discovery {
            data.append(&encode_mtu(self.mtu))?;
        }

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            ifac: None,
            destination: self.destination.address_hash,
            transport_id: None,
            context: PacketContext::None,
            data,
        };

        self.status = LinkStatus::Pending;
        self.id = link_id_from_request(&packet);
        self.request_sent_at = Instant::now();
        self.last_activity = Instant::now();

        log::debug!("link({}): establishment request for {}", self.id, self.destination);
        Ok(packet)
    }

    /// Responder's PROOF: signature over `link_id ‖ responder_pub ‖
    /// destination_verifying_key [‖ mtu]`, then `signature ‖ responder_pub
    /// [‖ mtu]` on the wire. Activates the responder side.
    pub fn prove(&mut self) -> Result<Packet, MeshError> {
        let responder_public = *self.ephemeral_identity.as_identity().public_key_bytes();
        let mtu_echo =
            if self.mtu_discovery { Some(encode_mtu(self.mtu)) } else { None };

        let mut signed = PayloadBuffer::new();
        signed
            .append(self.id.as_slice())?
            .append(&responder_public)?
            .append(self.destination.identity.verifying_key_bytes())?;
        if let Some(mtu) = &mtu_echo {
            signed.append(mtu)?;
        }

        let signature = self.ephemeral_identity.sign(signed.as_slice());

        let mut data = PayloadBuffer::new();
        data.append(&signature)?.append(&responder_public)?;
        if let Some(mtu) = &mtu_echo {
            data.append(mtu)?;
        }

        if self.status != LinkStatus::Active {
            self.status = LinkStatus::Active;
            self.last_activity = Instant::now();
            self.post(LinkEvent::Activated);
            log::debug!("link({}): responder active", self.id);
        }

        Ok(Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport_id: None,
            context: PacketContext::LinkRequestProof,
            data,
        })
    }

    pub fn handle_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if packet.destination != self.id {
            return LinkHandleResult::None;
        }

        match packet.header.packet_type {
            PacketType::Data => self.handle_data(packet),
            PacketType::Proof => self.handle_proof(packet),
            _ => LinkHandleResult::None,
        }
    }

    fn handle_proof(&mut self, packet: &Packet) -> LinkHandleResult {
        if !(self.is_initiator
            && self.status == LinkStatus::Pending
            && packet.context == PacketContext::LinkRequestProof)
        {
            return LinkHandleResult::None;
        }

        match self.validate_establishment_proof(packet) {
            Ok((peer_identity, agreed_mtu)) => {
                self.handshake(peer_identity);
                if let Some(mtu) = agreed_mtu {
                    self.mtu = mtu.min(self.mtu);
                }
                self.status = LinkStatus::Active;
                self.rtt = Some(self.request_sent_at.elapsed());
                self.last_activity = Instant::now();
                log::debug!(
                    "link({}): active, rtt {} ms",
                    self.id,
                    self.rtt.map(|rtt| rtt.as_millis()).unwrap_or_default()
                );
                self.post(LinkEvent::Activated);
                LinkHandleResult::Activated
            }
            Err(_) => {
                log::warn!("link({}): establishment proof invalid", self.id);
                self.close(CloseReason::ProofInvalid);
                LinkHandleResult::Closed(CloseReason::ProofInvalid)
            }
        }
    }

    fn validate_establishment_proof(
        &self,
        packet: &Packet,
    ) -> Result<(Identity, Option<usize>), MeshError> {
        let data = packet.data.as_slice();
        if data.len() < SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH {
            return Err(MeshError::ProofInvalid);
        }

        let signature = &data[..SIGNATURE_LENGTH];
        let responder_public = &data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH];
        let mtu_bytes = &data[SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH..];

        let mut signed = PayloadBuffer::new();
        signed
            .append(self.id.as_slice())?
            .append(responder_public)?
            .append(self.destination.identity.verifying_key_bytes())?;
        if !mtu_bytes.is_empty() {
            signed.append(mtu_bytes)?;
        }

        self.destination
            .identity
            .verify(signed.as_slice(), signature)
            .map_err(|_| MeshError::ProofInvalid)?;

        let mut public = [0u8; PUBLIC_KEY_LENGTH];
        public.copy_from_slice(responder_public);
        let peer_identity = Identity::new(
            PublicKey::from(public),
            *self.destination.identity.verifying_key(),
        );

        let agreed_mtu = if self.mtu_discovery && mtu_bytes.len() >= MTU_FIELD_SIZE {
            Some(decode_mtu(&mtu_bytes[..MTU_FIELD_SIZE]).min(PACKET_MDU))
        } else {
            None
        };

        Ok((peer_identity, agreed_mtu))
    }

    fn handle_data(&mut self, packet: &Packet) -> LinkHandleResult {
        match packet.context {
            PacketContext::None | PacketContext::LinkIdentify => {
                let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
                    // Replays and misroutes are tolerated; never close here.
                    log::trace!("link({}): undecryptable packet dropped", self.id);
                    return LinkHandleResult::None;
                };
                self.touch();
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.post(LinkEvent::Data {
                    sequence,
                    payload: Box::new(LinkPayload {
                        data: plaintext,
                        context: packet.context,
                        request_id: None,
                    }),
                });
                LinkHandleResult::Reply(self.prove_packet(packet))
            }
            PacketContext::Request => self.handle_request(packet),
            PacketContext::Response => self.handle_response(packet),
            PacketContext::KeepAlive => self.handle_keepalive(packet),
            PacketContext::LinkClose => self.handle_peer_close(packet),
            PacketContext::LinkRtt => self.handle_rtt(packet),
            _ => LinkHandleResult::None,
        }
    }

    fn handle_request(&mut self, packet: &Packet) -> LinkHandleResult {
        let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
            return LinkHandleResult::None;
        };
        if plaintext.len() < 2 * ADDRESS_HASH_SIZE {
            return LinkHandleResult::None;
        }
        self.touch();

        let request_id = AddressHash::from_slice(&plaintext[..ADDRESS_HASH_SIZE])
            .unwrap_or_else(|_| AddressHash::zero());
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.post(LinkEvent::Data {
            sequence,
            payload: Box::new(LinkPayload {
                data: plaintext[2 * ADDRESS_HASH_SIZE..].to_vec(),
                context: PacketContext::Request,
                request_id: Some(request_id),
            }),
        });
        LinkHandleResult::None
    }

    fn handle_response(&mut self, packet: &Packet) -> LinkHandleResult {
        let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
            return LinkHandleResult::None;
        };
        if plaintext.len() < ADDRESS_HASH_SIZE {
            return LinkHandleResult::None;
        }
        let Ok(request_id) = AddressHash::from_slice(&plaintext[..ADDRESS_HASH_SIZE]) else {
            return LinkHandleResult::None;
        };

        // Responses only resolve requests this side actually has pending.
        if self.pending_requests.remove(&request_id).is_none() {
            return LinkHandleResult::None;
        }
        self.touch();
        self.post(LinkEvent::Response {
            request_id,
            data: plaintext[ADDRESS_HASH_SIZE..].to_vec(),
        });
        LinkHandleResult::None
    }

    fn handle_keepalive(&mut self, packet: &Packet) -> LinkHandleResult {
        let data = packet.data.as_slice();
        if data.first() == Some(&KEEPALIVE_PROBE) {
            self.touch();
            return LinkHandleResult::Reply(self.keepalive_packet(false));
        }
        if data.first() == Some(&KEEPALIVE_REPLY) {
            self.touch();
        }
        LinkHandleResult::None
    }

    fn handle_rtt(&mut self, packet: &Packet) -> LinkHandleResult {
        let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
            return LinkHandleResult::None;
        };
        let Ok(millis) = <[u8; 4]>::try_from(plaintext.as_slice()) else {
            return LinkHandleResult::None;
        };
        self.peer_rtt = Some(Duration::from_millis(u64::from(u32::from_be_bytes(millis))));
        self.touch();
        LinkHandleResult::None
    }

    fn handle_peer_close(&mut self, packet: &Packet) -> LinkHandleResult {
        // The close payload is the encrypted link id; anything else is a
        // forgery or a stray and is ignored.
        let Ok(plaintext) = self.decrypt(packet.data.as_slice()) else {
            return LinkHandleResult::None;
        };
        if plaintext != self.id.as_slice() {
            return LinkHandleResult::None;
        }
        self.close(CloseReason::PeerClosed);
        LinkHandleResult::Closed(CloseReason::PeerClosed)
    }

    /// Encrypted application data packet. Valid only on an ACTIVE link.
    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, MeshError> {
        if self.status != LinkStatus::Active {
            return Err(MeshError::ConfigurationError);
        }
        if data.len() > self.mtu {
            return Err(MeshError::BufferExhausted);
        }
        self.encrypted_packet(data, PacketContext::None)
    }

    /// Starts a request/response exchange. Returns the request id the
    /// response will carry and the packet to transmit.
    pub fn start_request<R: CryptoRngCore>(
        &mut self,
        mut rng: R,
        path: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<(RequestId, Packet), MeshError> {
        if self.status != LinkStatus::Active {
            return Err(MeshError::ConfigurationError);
        }

        let request_id = RequestId::random(&mut rng);
        let path_hash = AddressHash::of(path.as_bytes());

        let mut plaintext = Vec::with_capacity(2 * ADDRESS_HASH_SIZE + body.len());
        plaintext.extend_from_slice(request_id.as_slice());
        plaintext.extend_from_slice(path_hash.as_slice());
        plaintext.extend_from_slice(body);

        let packet = self.encrypted_packet(&plaintext, PacketContext::Request)?;
        self.pending_requests
            .insert(request_id, PendingRequest { deadline: Instant::now() + timeout });
        Ok((request_id, packet))
    }

    /// Responder's reply to a request surfaced through a Data event.
    pub fn response_packet(
        &self,
        request_id: &RequestId,
        body: &[u8],
    ) -> Result<Packet, MeshError> {
        let mut plaintext = Vec::with_capacity(ADDRESS_HASH_SIZE + body.len());
        plaintext.extend_from_slice(request_id.as_slice());
        plaintext.extend_from_slice(body);
        self.encrypted_packet(&plaintext, PacketContext::Response)
    }

    /// Shares the measured round-trip time with the responder, which has no
    /// way to observe it from the handshake alone.
    pub fn rtt_packet(&self) -> Result<Packet, MeshError> {
        let rtt = self.rtt.ok_or(MeshError::ConfigurationError)?;
        let millis = u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX);
        self.encrypted_packet(&millis.to_be_bytes(), PacketContext::LinkRtt)
    }

    pub fn keepalive_packet(&self, probe: bool) -> Packet {
        let byte = if probe { KEEPALIVE_PROBE } else { KEEPALIVE_REPLY };
        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport_id: None,
            context: PacketContext::KeepAlive,
            data: PayloadBuffer::from_slice(&[byte]),
        }
    }

    /// Signed delivery proof for a packet received over this link.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.hash();
        let signature = self.ephemeral_identity.sign(hash.as_slice());

        let mut data = PayloadBuffer::new();
        let _ = data.write(hash.as_slice());
        let _ = data.write(&signature);

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport_id: None,
            context: PacketContext::LinkProof,
            data,
        }
    }

    /// Explicit local close. The returned packet tells the peer; the link is
    /// closed regardless of whether it can still be delivered.
    pub fn teardown(&mut self) -> Result<Packet, MeshError> {
        let packet = self.encrypted_packet(&self.id.to_bytes(), PacketContext::LinkClose)?;
        self.close(CloseReason::TeardownRequested);
        Ok(packet)
    }

    /// Drives the timeout state machine. Returns a keepalive probe when one
    /// should be sent.
    pub fn watchdog(&mut self, now: Instant) -> Option<Packet> {
        self.expire_requests(now);

        match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                let budget =
                    ESTABLISHMENT_TIMEOUT_PER_HOP * u32::from(self.expected_hops.max(1));
                if now.duration_since(self.request_sent_at) > budget {
                    log::debug!("link({}): establishment timed out", self.id);
                    self.close(CloseReason::EstablishmentTimeout);
                }
                None
            }
            LinkStatus::Active => {
                if now.duration_since(self.last_activity) > LINK_STALE_AFTER {
                    self.status = LinkStatus::Stale;
                    log::debug!("link({}): stale, probing", self.id);
                    return Some(self.keepalive_packet(true));
                }
                None
            }
            LinkStatus::Stale => {
                if now.duration_since(self.last_activity) > LINK_CLOSE_AFTER {
                    self.close(CloseReason::InactivityTimeout);
                }
                None
            }
            LinkStatus::Closed => None,
        }
    }

    fn expire_requests(&mut self, now: Instant) {
        let expired: Vec<RequestId> = self
            .pending_requests
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.pending_requests.remove(&request_id);
            self.post(LinkEvent::RequestFailed {
                request_id,
                reason: MeshError::RequestTimeout,
            });
        }
    }

    fn encrypted_packet(
        &self,
        plaintext: &[u8],
        context: PacketContext,
    ) -> Result<Packet, MeshError> {
        let mut data = PayloadBuffer::new();
        let written = {
            let key = self.token_key()?;
            key.encrypt(OsRng, plaintext, data.acquire_full())?.len()
        };
        data.resize(written);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport_id: None,
            context,
            data,
        })
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MeshError> {
        let key = self.token_key()?;
        let mut out = vec![0u8; ciphertext.len()];
        let len = key.decrypt(ciphertext, &mut out)?.len();
        out.truncate(len);
        Ok(out)
    }

    fn token_key(&self) -> Result<crate::crypt::token::TokenKey, MeshError> {
        self.derived_key
            .as_ref()
            .map(DerivedKey::token_key)
            .ok_or(MeshError::ConfigurationError)
    }

    fn handshake(&mut self, peer_identity: Identity) {
        self.status = LinkStatus::Handshake;
        self.peer_identity = Some(peer_identity);
        self.derived_key = Some(
            self.ephemeral_identity
                .derive_key(peer_identity.public_key(), self.id.as_slice()),
        );
    }

    fn close(&mut self, reason: CloseReason) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.close_reason = Some(reason);
        log::debug!("link({}): closed ({:?})", self.id, reason);
        self.post(LinkEvent::Closed(reason));
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
        }
    }

    fn post(&self, event: LinkEvent) {
        let _ = self.event_tx.send(LinkEventData {
            id: self.id,
            destination: self.destination.address_hash,
            event,
        });
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn peer_rtt(&self) -> Option<Duration> {
        self.peer_rtt
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> Option<&Identity> {
        self.peer_identity.as_ref()
    }

    pub fn elapsed_since_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Shared-key digest both sides can compare out of band.
    pub fn derived_key_digest(&self) -> Option<AddressHash> {
        self.derived_key.as_ref().map(|key| AddressHash::of(key.as_bytes()))
    }
}

fn encode_mtu(mtu: usize) -> [u8; MTU_FIELD_SIZE] {
    let clamped = mtu.min(0xFF_FFFF) as u32;
    let be = clamped.to_be_bytes();
    [be[1], be[2], be[3]]
}

fn decode_mtu(bytes: &[u8]) -> usize {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DestinationName, SingleInputDestination};
    use crate::identity::PrivateIdentity;

    fn responder_destination() -> SingleInputDestination {
        SingleInputDestination::new(
            PrivateIdentity::generate(OsRng),
            DestinationName::new("demo", &["link"]).expect("name"),
        )
    }

    fn established_pair() -> (Link, Link) {
        let destination = responder_destination();
        let desc = destination.desc();
        let (event_tx, _keep) = broadcast::channel(16);

        let mut initiator = Link::new(desc, event_tx.clone());
        let request = initiator.establishment_packet().expect("request");

        let mut responder = Link::new_from_request(
            &request,
            destination.identity.sign_key().clone(),
            desc,
            false,
            event_tx,
        )
        .expect("responder");
        let proof = responder.prove().expect("proof");

        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));
        (initiator, responder)
    }

    #[test]
    fn establishment_yields_matching_sessions() {
        let (initiator, responder) = established_pair();

        assert_eq!(initiator.status(), LinkStatus::Active);
        assert_eq!(responder.status(), LinkStatus::Active);
        assert_eq!(initiator.id(), responder.id());
        assert_eq!(initiator.derived_key_digest(), responder.derived_key_digest());
        assert!(initiator.rtt().is_some());
        assert!(responder.rtt().is_none());
    }

    #[test]
    fn data_round_trip_in_send_order() {
        let (initiator, mut responder) = established_pair();
        let (event_tx, mut events) = broadcast::channel(16);
        responder.event_tx = event_tx;

        for message in [&b"first"[..], b"second"] {
            let packet = initiator.data_packet(message).expect("data packet");
            match responder.handle_packet(&packet) {
                LinkHandleResult::Reply(proof) => {
                    assert_eq!(proof.context, PacketContext::LinkProof);
                }
                _ => panic!("expected delivery proof"),
            }
        }

        let mut sequences = Vec::new();
        for expected in [&b"first"[..], b"second"] {
            match events.try_recv().expect("event").event {
                LinkEvent::Data { sequence, payload } => {
                    assert_eq!(payload.data, expected);
                    sequences.push(sequence);
                }
                _ => panic!("expected data event"),
            }
        }
        assert!(sequences[0] < sequences[1]);
    }

    #[test]
    fn invalid_proof_closes_with_proof_invalid() {
        let destination = responder_destination();
        let desc = destination.desc();
        let (event_tx, _keep) = broadcast::channel(16);

        let mut initiator = Link::new(desc, event_tx.clone());
        let request = initiator.establishment_packet().expect("request");

        // A proof signed by the wrong identity must not activate the link.
        let rogue = responder_destination();
        let mut rogue_responder = Link::new_from_request(
            &request,
            rogue.identity.sign_key().clone(),
            desc,
            false,
            event_tx,
        )
        .expect("responder");
        let forged = rogue_responder.prove().expect("proof");

        assert!(matches!(
            initiator.handle_packet(&forged),
            LinkHandleResult::Closed(CloseReason::ProofInvalid)
        ));
        assert_eq!(initiator.status(), LinkStatus::Closed);
        assert_eq!(initiator.close_reason(), Some(CloseReason::ProofInvalid));
    }

    #[test]
    fn request_response_matches_by_id() {
        let (mut initiator, mut responder) = established_pair();

        let (request_id, request_packet) = initiator
            .start_request(OsRng, "status/ping", b"payload", Duration::from_secs(5))
            .expect("request");

        let (resp_event_tx, mut responder_events) = broadcast::channel(16);
        responder.event_tx = resp_event_tx;
        assert!(matches!(responder.handle_packet(&request_packet), LinkHandleResult::None));

        let incoming_id = match responder_events.try_recv().expect("event").event {
            LinkEvent::Data { payload, .. } => {
                assert_eq!(payload.context, PacketContext::Request);
                assert_eq!(payload.data, b"payload");
                payload.request_id.expect("request id")
            }
            _ => panic!("expected request data event"),
        };
        assert_eq!(incoming_id, request_id);

        let response = responder.response_packet(&incoming_id, b"pong").expect("response");

        let (init_event_tx, mut initiator_events) = broadcast::channel(16);
        initiator.event_tx = init_event_tx;
        assert!(matches!(initiator.handle_packet(&response), LinkHandleResult::None));
        match initiator_events.try_recv().expect("event").event {
            LinkEvent::Response { request_id: answered, data } => {
                assert_eq!(answered, request_id);
                assert_eq!(data, b"pong");
            }
            _ => panic!("expected response event"),
        }
    }

    #[test]
    fn request_timeout_fires_once() {
        let (mut initiator, _responder) = established_pair();
        let (event_tx, mut events) = broadcast::channel(16);
        initiator.event_tx = event_tx;

        let (request_id, _packet) = initiator
            .start_request(OsRng, "slow/path", b"", Duration::from_millis(0))
            .expect("request");

        initiator.watchdog(Instant::now() + Duration::from_millis(1));
        match events.try_recv().expect("event").event {
            LinkEvent::RequestFailed { request_id: failed, reason } => {
                assert_eq!(failed, request_id);
                assert_eq!(reason, MeshError::RequestTimeout);
            }
            _ => panic!("expected request failure"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn watchdog_walks_stale_then_closed() {
        let (mut initiator, _responder) = established_pair();

        let gone_stale = Instant::now() + LINK_STALE_AFTER + Duration::from_secs(1);
        let probe = initiator.watchdog(gone_stale).expect("keepalive probe");
        assert_eq!(probe.context, PacketContext::KeepAlive);
        assert_eq!(probe.data.as_slice(), &[KEEPALIVE_PROBE]);
        assert_eq!(initiator.status(), LinkStatus::Stale);

        let gone_silent = Instant::now() + LINK_CLOSE_AFTER + Duration::from_secs(1);
        assert!(initiator.watchdog(gone_silent).is_none());
        assert_eq!(initiator.status(), LinkStatus::Closed);
        assert_eq!(initiator.close_reason(), Some(CloseReason::InactivityTimeout));
    }

    #[test]
    fn keepalive_reply_revives_stale_link() {
        let (mut initiator, responder) = established_pair();

        initiator.watchdog(Instant::now() + LINK_STALE_AFTER + Duration::from_secs(1));
        assert_eq!(initiator.status(), LinkStatus::Stale);

        let reply = responder.keepalive_packet(false);
        initiator.handle_packet(&reply);
        assert_eq!(initiator.status(), LinkStatus::Active);
    }

    #[test]
    fn establishment_timeout_scales_with_hops() {
        let destination = responder_destination();
        let (event_tx, _keep) = broadcast::channel(16);
        let mut link = Link::new(destination.desc(), event_tx);
        link.set_expected_hops(3);
        let _request = link.establishment_packet().expect("request");

        // Inside the 3-hop budget nothing happens.
        link.watchdog(Instant::now() + ESTABLISHMENT_TIMEOUT_PER_HOP * 2);
        assert_eq!(link.status(), LinkStatus::Pending);

        link.watchdog(Instant::now() + ESTABLISHMENT_TIMEOUT_PER_HOP * 3 + Duration::from_secs(1));
        assert_eq!(link.status(), LinkStatus::Closed);
        assert_eq!(link.close_reason(), Some(CloseReason::EstablishmentTimeout));
    }

    #[test]
    fn rtt_packet_reaches_responder() {
        let (initiator, mut responder) = established_pair();
        assert!(responder.peer_rtt().is_none());

        let rtt_packet = initiator.rtt_packet().expect("rtt packet");
        assert!(matches!(responder.handle_packet(&rtt_packet), LinkHandleResult::None));
        assert!(responder.peer_rtt().is_some());
        // The responder's own rtt stays unmeasured.
        assert!(responder.rtt().is_none());
    }

    #[test]
    fn teardown_closes_peer() {
        let (mut initiator, mut responder) = established_pair();
        let close_packet = initiator.teardown().expect("close packet");
        assert_eq!(initiator.status(), LinkStatus::Closed);
        assert_eq!(initiator.close_reason(), Some(CloseReason::TeardownRequested));

        assert!(matches!(
            responder.handle_packet(&close_packet),
            LinkHandleResult::Closed(CloseReason::PeerClosed)
        ));
        assert_eq!(responder.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[test]
    fn tampered_link_packet_is_dropped_silently() {
        let (initiator, mut responder) = established_pair();
        let mut packet = initiator.data_packet(b"payload").expect("data");
        let last = packet.data.len() - 1;
        packet.data.as_mut_slice()[last] ^= 0x01;

        assert!(matches!(responder.handle_packet(&packet), LinkHandleResult::None));
        assert_eq!(responder.status(), LinkStatus::Active);
    }

    #[test]
    fn mtu_discovery_agrees_on_minimum() {
        let destination = responder_destination();
        let desc = destination.desc();
        let (event_tx, _keep) = broadcast::channel(16);

        let mut initiator = Link::new(desc, event_tx.clone());
        initiator.set_mtu_discovery(true, 430);
        let request = initiator.establishment_packet().expect("request");

        let mut responder = Link::new_from_request(
            &request,
            destination.identity.sign_key().clone(),
            desc,
            true,
            event_tx,
        )
        .expect("responder");
        // Responder accepted the offered MTU, bounded by its own.
        assert_eq!(responder.mtu(), 430);
        let proof = responder.prove().expect("proof");

        initiator.handle_packet(&proof);
        assert_eq!(initiator.mtu(), 430);
        assert_eq!(initiator.id(), responder.id());
    }

    #[test]
    fn default_mtu_without_discovery() {
        let (initiator, responder) = established_pair();
        assert_eq!(initiator.mtu(), LINK_MDU);
        assert_eq!(responder.mtu(), LINK_MDU);
    }
}

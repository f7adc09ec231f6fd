pub mod hdlc;
pub mod kiss;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::Digest;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crypt::ifac::{derive_ifac_key, ifac_tag, IFAC_KEY_LENGTH};
use crate::error::MeshError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::packet::Packet;

/// Interface mode, controlling announce propagation and path expiry.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum InterfaceMode {
    Full,
    PointToPoint,
    AccessPoint,
    Roaming,
    Boundary,
    Gateway,
}

impl InterfaceMode {
    /// How long a path learned over this mode stays valid.
    pub fn path_expiry_secs(&self) -> u64 {
        match self {
            InterfaceMode::Roaming => 6 * 60 * 60,
            InterfaceMode::AccessPoint => 24 * 60 * 60,
            _ => 7 * 24 * 60 * 60,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            InterfaceMode::Full => 0x01,
            InterfaceMode::PointToPoint => 0x04,
            InterfaceMode::AccessPoint => 0x08,
            InterfaceMode::Roaming => 0x10,
            InterfaceMode::Boundary => 0x20,
            InterfaceMode::Gateway => 0x02,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(InterfaceMode::Full),
            0x04 => Some(InterfaceMode::PointToPoint),
            0x08 => Some(InterfaceMode::AccessPoint),
            0x10 => Some(InterfaceMode::Roaming),
            0x20 => Some(InterfaceMode::Boundary),
            0x02 => Some(InterfaceMode::Gateway),
            _ => None,
        }
    }
}

/// Announce egress policy. Access points never rebroadcast; roaming and
/// boundary interfaces forward only announces that originate from the
/// stationary part of the network, unless the destination is local. An
/// unknown source mode counts as untrusted.
pub fn should_forward(
    out_mode: InterfaceMode,
    destination_is_local: bool,
    source_mode: Option<InterfaceMode>,
) -> bool {
    match out_mode {
        InterfaceMode::AccessPoint => false,
        InterfaceMode::Roaming => {
            destination_is_local
                || matches!(
                    source_mode,
                    Some(InterfaceMode::Full)
                        | Some(InterfaceMode::PointToPoint)
                        | Some(InterfaceMode::AccessPoint)
                        | Some(InterfaceMode::Gateway)
                )
        }
        InterfaceMode::Boundary => {
            destination_is_local
                || matches!(source_mode, Some(mode) if mode != InterfaceMode::Roaming)
        }
        _ => true,
    }
}

/// IFAC configuration as supplied by the embedder.
#[derive(Debug, Clone)]
pub struct IfacSpec {
    pub netname: String,
    pub netkey: Option<String>,
    pub size: usize,
}

impl IfacSpec {
    pub fn derive(&self) -> Result<IfacKey, MeshError> {
        if !matches!(self.size, 1 | 8 | 16) {
            return Err(MeshError::ConfigurationError);
        }
        Ok(IfacKey {
            key: derive_ifac_key(&self.netname, self.netkey.as_deref()),
            size: self.size,
        })
    }
}

/// Derived per-interface authentication key plus its tag size.
#[derive(Clone)]
pub struct IfacKey {
    pub key: [u8; IFAC_KEY_LENGTH],
    pub size: usize,
}

/// The capability contract every driver registers with.
#[derive(Clone)]
pub struct InterfaceProperties {
    pub name: String,
    pub mode: InterfaceMode,
    pub bitrate: u64,
    pub hw_mtu: usize,
    pub can_send: bool,
    pub can_receive: bool,
    pub ifac: Option<IfacKey>,
    pub wants_tunnel: bool,
    /// Driver identity public key; tunnel ids are derived from it.
    pub tunnel_identity_public: Option<[u8; 32]>,
}

impl InterfaceProperties {
    pub fn new<T: Into<String>>(name: T, mode: InterfaceMode) -> Self {
        Self {
            name: name.into(),
            mode,
            bitrate: 10_000_000,
            hw_mtu: crate::packet::MTU,
            can_send: true,
            can_receive: true,
            ifac: None,
            wants_tunnel: false,
            tunnel_identity_public: None,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_ifac(mut self, spec: &IfacSpec) -> Result<Self, MeshError> {
        self.ifac = Some(spec.derive()?);
        Ok(self)
    }

    pub fn with_tunnel(mut self, identity_public: [u8; 32]) -> Self {
        self.wants_tunnel = true;
        self.tunnel_identity_public = Some(identity_public);
        self
    }

    pub fn tunnel_id(&self) -> Option<AddressHash> {
        self.tunnel_identity_public.map(|public| AddressHash::of(&public))
    }

    pub fn ifac_size(&self) -> usize {
        self.ifac.as_ref().map(|ifac| ifac.size).unwrap_or(0)
    }
}

//***************************************************************************//

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TxMessageType {
    /// All sendable interfaces, except the named one.
    Broadcast(Option<AddressHash>),
    Direct(AddressHash),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct TxMessage {
    pub tx_type: TxMessageType,
    pub packet: Packet,
}

/// One deframed wire frame as received by a driver, before any transport
/// processing (hop cap, dedup, IFAC all happen in the inbound pipeline).
#[derive(Debug, Clone)]
pub struct RxMessage {
    pub iface: AddressHash,
    pub raw: Vec<u8>,
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct DispatchTrace {
    pub matched: usize,
    pub sent: usize,
    pub failed: usize,
}

pub type RxSender = mpsc::Sender<RxMessage>;
pub type RxReceiver = mpsc::Receiver<RxMessage>;
pub type TxSender = mpsc::Sender<TxMessage>;
pub type TxReceiver = mpsc::Receiver<TxMessage>;

const TX_QUEUE_CAPACITY: usize = 128;

/// Driver-side handle: receives outbound messages, delivers inbound frames,
/// and owns the egress IFAC application for its interface.
pub struct InterfaceChannel {
    pub address: AddressHash,
    pub rx_sender: RxSender,
    pub tx_receiver: TxReceiver,
    pub stop: CancellationToken,
    online: Arc<AtomicBool>,
    network_change: Arc<Notify>,
    ifac: Option<IfacKey>,
}

impl InterfaceChannel {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Resolves when the embedder signals a network-type change.
    /// Reconnecting drivers reset their backoff and retry immediately.
    pub async fn network_changed(&self) {
        self.network_change.notified().await;
    }

    /// Serializes a packet for this interface, inserting the IFAC tag when
    /// the interface is authenticated.
    pub fn encode_outgoing(&self, packet: &Packet) -> Result<Vec<u8>, MeshError> {
        match &self.ifac {
            Some(ifac) => seal_with_ifac(packet, ifac),
            None => {
                let mut open = *packet;
                open.ifac = None;
                open.pack()
            }
        }
    }

    pub async fn deliver_raw(&self, raw: Vec<u8>) {
        let _ = self.rx_sender.send(RxMessage { iface: self.address, raw }).await;
    }
}

/// Applies the interface authentication tag: the packet is packed with the
/// authenticated bit set and no tag field, HMAC'd, and the truncated tag is
/// spliced in between context byte and payload.
pub fn seal_with_ifac(packet: &Packet, ifac: &IfacKey) -> Result<Vec<u8>, MeshError> {
    let mut open = *packet;
    open.ifac = None;
    let mut bytes = open.pack()?;
    bytes[0] |= 0b1000_0000;

    let tag = ifac_tag(&ifac.key, &bytes, ifac.size)?;
    let offset = ifac_field_offset(bytes[0]);
    let tail = bytes.split_off(offset);
    bytes.extend_from_slice(&tag);
    bytes.extend_from_slice(&tail);
    Ok(bytes)
}

/// Checks the tag of a raw authenticated frame in constant time.
pub fn verify_ifac_frame(raw: &[u8], ifac: &IfacKey) -> bool {
    if raw.is_empty() || raw[0] & 0b1000_0000 == 0 {
        return false;
    }
    let offset = ifac_field_offset(raw[0]);
    if raw.len() < offset + ifac.size {
        return false;
    }

    let mut unsealed = Vec::with_capacity(raw.len() - ifac.size);
    unsealed.extend_from_slice(&raw[..offset]);
    unsealed.extend_from_slice(&raw[offset + ifac.size..]);

    match ifac_tag(&ifac.key, &unsealed, ifac.size) {
        Ok(expected) => crate::crypt::ct_eq(&expected, &raw[offset..offset + ifac.size]),
        Err(_) => false,
    }
}

/// Byte offset of the IFAC field for a frame starting with `flags`:
/// after flags, hops, optional transport id, destination and context.
fn ifac_field_offset(flags: u8) -> usize {
    let transport = if flags & 0b0100_0000 != 0 { ADDRESS_HASH_SIZE } else { 0 };
    2 + transport + ADDRESS_HASH_SIZE + 1
}

//***************************************************************************//

struct RegisteredInterface {
    address: AddressHash,
    properties: InterfaceProperties,
    tx_sender: TxSender,
    stop: CancellationToken,
    online: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

/// Snapshot of one registered interface, as seen by the transport.
#[derive(Clone)]
pub struct InterfaceInfo {
    pub address: AddressHash,
    pub name: String,
    pub mode: InterfaceMode,
    pub bitrate: u64,
    pub online: bool,
    pub can_send: bool,
    pub can_receive: bool,
    pub wants_tunnel: bool,
    pub tunnel_id: Option<AddressHash>,
    pub ifac: Option<IfacKey>,
}

/// Registry of active interfaces. Allocates addresses and channel pairs,
/// and fans outbound messages to the drivers that should carry them.
pub struct InterfaceManager {
    counter: usize,
    rx_sender: RxSender,
    rx_receiver: Arc<tokio::sync::Mutex<RxReceiver>>,
    cancel: CancellationToken,
    network_change: Arc<Notify>,
    ifaces: Vec<RegisteredInterface>,
}

impl InterfaceManager {
    pub fn new(rx_capacity: usize) -> Self {
        let (rx_sender, rx_receiver) = mpsc::channel(rx_capacity);
        Self {
            counter: 0,
            rx_sender,
            rx_receiver: Arc::new(tokio::sync::Mutex::new(rx_receiver)),
            cancel: CancellationToken::new(),
            network_change: Arc::new(Notify::new()),
            ifaces: Vec::new(),
        }
    }

    /// External signal that the underlying network type changed (wifi to
    /// cellular and the like). Wakes every driver waiting out a reconnect
    /// backoff.
    pub fn notify_network_change(&self) {
        self.network_change.notify_waiters();
    }

    pub fn receiver(&self) -> Arc<tokio::sync::Mutex<RxReceiver>> {
        self.rx_receiver.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers an interface and hands back the driver-side channel.
    /// Interfaces start online; drivers flip the flag on disconnect.
    pub fn register(&mut self, properties: InterfaceProperties) -> InterfaceChannel {
        self.counter += 1;
        let address = AddressHash::truncating(&Hash::from(
            Hash::hasher()
                .chain_update(properties.name.as_bytes())
                .chain_update(self.counter.to_be_bytes()),
        ));

        let (tx_sender, tx_receiver) = mpsc::channel(TX_QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let online = Arc::new(AtomicBool::new(true));
        let ifac = properties.ifac.clone();

        log::debug!("iface: register {} as {}", properties.name, address);

        self.ifaces.push(RegisteredInterface {
            address,
            properties,
            tx_sender,
            stop: stop.clone(),
            online: online.clone(),
            driver: None,
        });

        InterfaceChannel {
            address,
            rx_sender: self.rx_sender.clone(),
            tx_receiver,
            stop,
            online,
            network_change: self.network_change.clone(),
            ifac,
        }
    }

    /// Records the task driving an interface, so teardown can join it
    /// within the shutdown budget.
    pub fn attach_driver(&mut self, address: &AddressHash, handle: JoinHandle<()>) {
        match self.ifaces.iter_mut().find(|iface| iface.address == *address) {
            Some(iface) => iface.driver = Some(handle),
            None => {
                log::warn!("iface: driver attached to unknown interface {}", address);
                handle.abort();
            }
        }
    }

    /// Cancels the interface's stop token and hands back its driver task,
    /// if one was attached, for a bounded join.
    pub fn deregister(&mut self, address: &AddressHash) -> Option<JoinHandle<()>> {
        let index = self.ifaces.iter().position(|iface| iface.address == *address)?;
        let mut iface = self.ifaces.remove(index);
        iface.stop.cancel();
        iface.driver.take()
    }

    pub fn cleanup(&mut self) {
        self.ifaces.retain(|iface| !iface.stop.is_cancelled());
    }

    pub fn info(&self, address: &AddressHash) -> Option<InterfaceInfo> {
        self.ifaces.iter().find(|iface| iface.address == *address).map(Self::snapshot_of)
    }

    pub fn snapshot(&self) -> Vec<InterfaceInfo> {
        self.ifaces.iter().map(Self::snapshot_of).collect()
    }

    fn snapshot_of(iface: &RegisteredInterface) -> InterfaceInfo {
        InterfaceInfo {
            address: iface.address,
            name: iface.properties.name.clone(),
            mode: iface.properties.mode,
            bitrate: iface.properties.bitrate,
            online: iface.online.load(Ordering::Relaxed) && !iface.stop.is_cancelled(),
            can_send: iface.properties.can_send,
            can_receive: iface.properties.can_receive,
            wants_tunnel: iface.properties.wants_tunnel,
            tunnel_id: iface.properties.tunnel_id(),
            ifac: iface.properties.ifac.clone(),
        }
    }

    pub async fn send(&self, message: TxMessage) -> DispatchTrace {
        let mut trace = DispatchTrace::default();

        for iface in &self.ifaces {
            let selected = match message.tx_type {
                TxMessageType::Broadcast(except) => except != Some(iface.address),
                TxMessageType::Direct(address) => address == iface.address,
            };
            if !selected
                || !iface.properties.can_send
                || iface.stop.is_cancelled()
                || !iface.online.load(Ordering::Relaxed)
            {
                continue;
            }

            trace.matched += 1;
            match iface.tx_sender.try_send(message) {
                Ok(()) => trace.sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace.failed += 1;
                    log::warn!("iface: tx queue full on {}, dropping", iface.address);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace.failed += 1;
                    log::warn!("iface: tx queue closed on {}", iface.address);
                }
            }
        }

        trace
    }
}

impl Drop for InterfaceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

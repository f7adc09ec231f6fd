use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::hash::AddressHash;
use crate::iface::InterfaceMode;
use crate::time::epoch_secs;

/// Tunnels older than this without a reconnect are forgotten.
pub const TUNNEL_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// One announce retained for replay when a tunnel's interface returns.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredAnnounce {
    pub destination: ByteBuf,
    pub payload: ByteBuf,
    pub has_ratchet: bool,
    pub hops: u8,
    pub announce_timestamp: u64,
    pub mode: u8,
}

#[derive(Default, Serialize, Deserialize)]
pub struct Tunnel {
    pub announces: HashMap<String, StoredAnnounce>,
    pub last_seen: u64,
}

/// Named interfaces (`wants_tunnel`) keep their learned announces across
/// disconnections. When the interface reappears the stored announces are
/// replayed into the path table so routes recover without waiting for the
/// network to re-announce.
#[derive(Default, Serialize, Deserialize)]
pub struct TunnelStore {
    tunnels: HashMap<String, Tunnel>,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self { tunnels: HashMap::new() }
    }

    pub fn record(
        &mut self,
        tunnel_id: &AddressHash,
        destination: &AddressHash,
        payload: &[u8],
        has_ratchet: bool,
        hops: u8,
        announce_timestamp: u64,
        mode: InterfaceMode,
    ) {
        let tunnel = self.tunnels.entry(tunnel_id.to_hex()).or_default();
        tunnel.last_seen = epoch_secs();
        tunnel.announces.insert(
            destination.to_hex(),
            StoredAnnounce {
                destination: ByteBuf::from(destination.as_slice().to_vec()),
                payload: ByteBuf::from(payload.to_vec()),
                has_ratchet,
                hops,
                announce_timestamp,
                mode: mode.to_wire(),
            },
        );
    }

    /// Marks the tunnel alive and returns its stored announces for replay.
    pub fn attach(&mut self, tunnel_id: &AddressHash) -> Vec<StoredAnnounce> {
        match self.tunnels.get_mut(&tunnel_id.to_hex()) {
            Some(tunnel) => {
                tunnel.last_seen = epoch_secs();
                tunnel.announces.values().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn contains(&self, tunnel_id: &AddressHash) -> bool {
        self.tunnels.contains_key(&tunnel_id.to_hex())
    }

    pub fn cull(&mut self) -> usize {
        let now = epoch_secs();
        let before = self.tunnels.len();
        self.tunnels
            .retain(|_, tunnel| now.saturating_sub(tunnel.last_seen) <= TUNNEL_EXPIRY_SECS);
        before - self.tunnels.len()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_attach_round_trip() {
        let mut store = TunnelStore::new();
        let tunnel_id = AddressHash::of(b"tunnel");
        let destination = AddressHash::of(b"dest");

        store.record(&tunnel_id, &destination, b"payload", true, 3, 42, InterfaceMode::Gateway);

        let replayed = store.attach(&tunnel_id);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].destination.as_ref(), destination.as_slice());
        assert_eq!(replayed[0].payload.as_ref(), b"payload");
        assert_eq!(replayed[0].hops, 3);
        assert_eq!(InterfaceMode::from_wire(replayed[0].mode), Some(InterfaceMode::Gateway));
    }

    #[test]
    fn newer_announce_replaces_stored_one() {
        let mut store = TunnelStore::new();
        let tunnel_id = AddressHash::of(b"tunnel");
        let destination = AddressHash::of(b"dest");

        store.record(&tunnel_id, &destination, b"old", false, 5, 1, InterfaceMode::Full);
        store.record(&tunnel_id, &destination, b"new", false, 2, 2, InterfaceMode::Full);

        let replayed = store.attach(&tunnel_id);
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload.as_ref(), b"new");
    }

    #[test]
    fn unknown_tunnel_replays_nothing() {
        let mut store = TunnelStore::new();
        assert!(store.attach(&AddressHash::of(b"nothing")).is_empty());
    }

    #[test]
    fn msgpack_round_trip() {
        let mut store = TunnelStore::new();
        store.record(
            &AddressHash::of(b"tunnel"),
            &AddressHash::of(b"dest"),
            b"payload",
            false,
            1,
            9,
            InterfaceMode::Full,
        );

        let encoded = rmp_serde::to_vec_named(&store).expect("encode");
        let mut decoded: TunnelStore = rmp_serde::from_slice(&encoded).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.attach(&AddressHash::of(b"tunnel")).len(), 1);
    }
}

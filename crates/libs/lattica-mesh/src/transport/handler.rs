use std::sync::Arc;

use rand_core::OsRng;
use tokio::sync::Mutex;

use crate::destination::link::{
    link_id_from_request, Link, LinkHandleResult, LinkStatus,
};
use crate::destination::{validate_announce, AnnounceInfo};
use crate::hash::AddressHash;
use crate::iface::{
    should_forward, verify_ifac_frame, InterfaceInfo, InterfaceProperties, TxMessage,
    TxMessageType,
};
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketContext, PacketType, PayloadBuffer,
    TransportType, MAX_HOPS,
};
use crate::time::epoch_secs;

use super::announce_queue::QueuedAnnounce;
use super::path_table::PathEntry;
use super::storage::PersistedPathEntry;
use super::{AnnounceEvent, DeliveryEvent, ReceivedData, TransportHandler};

impl TransportHandler {
    /// The inbound pipeline: parse, hop cap, dedup, interface
    /// authentication, then dispatch by packet type. Every drop before
    /// dispatch is silent.
    pub(crate) async fn process_inbound(&mut self, raw: &[u8], iface: AddressHash) {
        let Some(info) = self.iface_manager.lock().await.info(&iface) else {
            return;
        };
        if !info.can_receive {
            return;
        }

        let Ok(packet) = Packet::unpack(raw, info.ifac.as_ref().map(|i| i.size).unwrap_or(0))
        else {
            self.counters.malformed += 1;
            return;
        };

        if packet.header.hops > MAX_HOPS {
            self.counters.hop_limit += 1;
            return;
        }

        if !self.filter_duplicate(&packet).await {
            log::trace!(
                "tp({}): replayed packet for {} dropped",
                self.config.name,
                packet.destination
            );
            self.counters.replays += 1;
            return;
        }

        // Interface authentication: the packet's IFAC bit must agree with
        // the interface configuration, and the tag must verify.
        match (&info.ifac, packet.ifac.is_some()) {
            (Some(key), true) => {
                if !verify_ifac_frame(raw, key) {
                    self.counters.auth_failures += 1;
                    return;
                }
            }
            (None, false) => {}
            _ => {
                self.counters.auth_failures += 1;
                return;
            }
        }

        match packet.header.packet_type {
            PacketType::Announce => self.handle_announce(&packet, &info).await,
            PacketType::LinkRequest => self.handle_link_request(&packet, &info).await,
            PacketType::Proof => self.handle_proof(&packet, &info).await,
            PacketType::Data => self.handle_data(&packet, &info).await,
        }
    }

    /// Hashlist check with the protocol's deliberate exemptions: keepalives
    /// repeat verbatim, link requests are retried with identical key
    /// material, and an establishment proof may be retransmitted while the
    /// requesting link is still pending.
    async fn filter_duplicate(&mut self, packet: &Packet) -> bool {
        let mut allow_duplicate = false;
        match packet.header.packet_type {
            PacketType::LinkRequest => allow_duplicate = true,
            PacketType::Data => {
                allow_duplicate = packet.context == PacketContext::KeepAlive;
            }
            PacketType::Proof => {
                if packet.context == PacketContext::LinkRequestProof {
                    if let Some(link) = self.out_links.get(&packet.destination) {
                        allow_duplicate = link.lock().await.status().not_yet_active();
                    }
                }
            }
            PacketType::Announce => {}
        }

        self.hashlist.insert(packet.hash()) || allow_duplicate
    }

    //***********************************************************************//

    async fn handle_announce(&mut self, packet: &Packet, info: &InterfaceInfo) {
        if let Some(blocked) = self.announce_limits.check(&packet.destination) {
            log::debug!(
                "tp({}): announces from {} blocked for {}s",
                self.config.name,
                packet.destination,
                blocked.as_secs()
            );
            return;
        }

        let now = epoch_secs();
        let announce = match validate_announce(packet) {
            Ok(announce) => announce,
            Err(_) => {
                self.counters.auth_failures += 1;
                return;
            }
        };

        // Freshness window: stale replays and future-dated announces are
        // rejected before they can displace a live path.
        let timestamp = announce.timestamp();
        if now.saturating_sub(timestamp) > self.config.announce_max_age_secs
            || timestamp.saturating_sub(now) > self.config.announce_max_skew_secs
        {
            log::debug!(
                "tp({}): announce for {} outside freshness window",
                self.config.name,
                packet.destination
            );
            return;
        }

        self.known_destinations.remember(
            packet.destination,
            announce.identity,
            announce.name_hash(),
            announce.app_data,
        );
        if let (Some(store), Some(ratchet)) = (self.ratchet_store.as_mut(), announce.ratchet) {
            log::trace!(
                "tp({}): ratchet {} announced by {}",
                self.config.name,
                hex::encode(crate::destination::ratchet_id(&ratchet)),
                packet.destination
            );
            if let Err(err) = store.remember(&packet.destination, ratchet) {
                log::warn!(
                    "tp({}): could not persist ratchet for {}: {}",
                    self.config.name,
                    packet.destination,
                    err
                );
            }
        }

        // Our own destinations do not need a path entry.
        if self.in_destinations.contains_key(&packet.destination) {
            return;
        }

        let hops = packet.header.hops.saturating_add(1);
        if !self.path_table.should_accept(&packet.destination, hops, timestamp, now) {
            return;
        }

        self.path_table.insert(
            packet.destination,
            PathEntry {
                received_from: packet.transport_id.unwrap_or(packet.destination),
                iface: info.address,
                hops,
                expires_at: now + info.mode.path_expiry_secs(),
                announce_timestamp: timestamp,
                announce_payload: packet.data.as_slice().to_vec(),
                announce_has_ratchet: announce.ratchet.is_some(),
                source_mode: info.mode,
            },
        );

        if let Some(tunnel_id) = info.tunnel_id {
            self.tunnels.record(
                &tunnel_id,
                &packet.destination,
                packet.data.as_slice(),
                announce.ratchet.is_some(),
                hops,
                timestamp,
                info.mode,
            );
        }

        self.emit_announce_event(packet, &announce, info, timestamp);

        if self.config.enable_transport {
            self.enqueue_rebroadcast(packet, info, timestamp).await;
        }
    }

    fn emit_announce_event(
        &self,
        packet: &Packet,
        announce: &AnnounceInfo<'_>,
        info: &InterfaceInfo,
        timestamp: u64,
    ) {
        let _ = self.announce_tx.send(AnnounceEvent {
            destination: packet.destination,
            identity: announce.identity,
            name_hash: announce.name_hash(),
            app_data: announce.app_data.to_vec(),
            ratchet: announce.ratchet,
            hops: packet.header.hops,
            iface: info.address,
            timestamp,
        });
    }

    /// Queues the announce for retransmission on every other interface the
    /// mode filter permits. Actual emission is budgeted by the drain job.
    async fn enqueue_rebroadcast(
        &mut self,
        packet: &Packet,
        info: &InterfaceInfo,
        timestamp: u64,
    ) {
        let mut rebroadcast = *packet;
        rebroadcast.header.hops = packet.header.hops.saturating_add(1);
        rebroadcast.header.header_type = HeaderType::Header2;
        rebroadcast.header.transport_type = TransportType::Transport;
        rebroadcast.transport_id = Some(*self.identity.address_hash());
        rebroadcast.ifac = None;

        if rebroadcast.header.hops > MAX_HOPS {
            return;
        }

        let snapshot = self.iface_manager.lock().await.snapshot();
        for out in snapshot {
            if out.address == info.address || !out.can_send || !out.online {
                continue;
            }
            let destination_is_local =
                self.in_destinations.contains_key(&packet.destination);
            if !should_forward(out.mode, destination_is_local, Some(info.mode)) {
                continue;
            }
            self.announce_queue.enqueue(
                out.address,
                QueuedAnnounce {
                    destination: packet.destination,
                    packet: rebroadcast,
                    announce_timestamp: timestamp,
                },
            );
        }
    }

    //***********************************************************************//

    async fn handle_link_request(&mut self, packet: &Packet, info: &InterfaceInfo) {
        let link_id = link_id_from_request(packet);

        // A retried request for an existing responder link re-sends the
        // proof instead of minting a second session.
        if let Some(link) = self.in_links.get(&link_id) {
            let proof = link.lock().await.prove();
            if let Ok(proof) = proof {
                self.send(TxMessage {
                    tx_type: TxMessageType::Direct(info.address),
                    packet: proof,
                })
                .await;
            }
            return;
        }

        if let Some(destination) = self.in_destinations.get(&packet.destination).cloned() {
            let guard = destination.lock().await;
            if !guard.accepts_link_requests() {
                return;
            }
            let link = match Link::new_from_request(
                packet,
                guard.identity.sign_key().clone(),
                guard.desc(),
                self.config.link_mtu_discovery,
                self.link_event_tx.clone(),
            ) {
                Ok(link) => link,
                Err(_) => {
                    self.counters.malformed += 1;
                    return;
                }
            };
            drop(guard);

            let mut link = link;
            let proof = link.prove();
            self.in_links.insert(link_id, Arc::new(Mutex::new(link)));
            if let Ok(proof) = proof {
                self.send(TxMessage {
                    tx_type: TxMessageType::Direct(info.address),
                    packet: proof,
                })
                .await;
            }
            return;
        }

        // Transit: pin the link through this node and pass the request on.
        if !self.config.enable_transport {
            return;
        }
        let now = epoch_secs();
        if !self.path_table.has_path(&packet.destination, now) {
            self.counters.no_route += 1;
            return;
        }
        let Some(entry) = self.path_table.get(&packet.destination) else {
            return;
        };
        if entry.iface == info.address {
            return;
        }
        let next_hop = entry.received_from;
        let next_hop_iface = entry.iface;

        self.link_table.add(packet, packet.destination, info.address, next_hop, next_hop_iface);

        let mut forwarded = *packet;
        forwarded.header.hops = packet.header.hops.saturating_add(1);
        forwarded.ifac = None;
        if forwarded.header.hops > MAX_HOPS {
            return;
        }
        let (routed, _) = self.path_table.route_outbound(&forwarded);
        self.send(TxMessage { tx_type: TxMessageType::Direct(next_hop_iface), packet: routed })
            .await;
    }

    //***********************************************************************//

    async fn handle_proof(&mut self, packet: &Packet, info: &InterfaceInfo) {
        if packet.context == PacketContext::LinkRequestProof {
            if let Some(link) = self.out_links.get(&packet.destination).cloned() {
                let mut guard = link.lock().await;
                match guard.handle_packet(packet) {
                    LinkHandleResult::Closed(_) => {
                        drop(guard);
                        self.out_links.remove(&packet.destination);
                    }
                    LinkHandleResult::Activated => {
                        // Tell the responder what the handshake measured.
                        let rtt_packet = guard.rtt_packet();
                        drop(guard);
                        if let Ok(rtt_packet) = rtt_packet {
                            self.send(TxMessage {
                                tx_type: TxMessageType::Direct(info.address),
                                packet: rtt_packet,
                            })
                            .await;
                        }
                    }
                    _ => {}
                }
                return;
            }

            // Transit: a proof flowing back toward the initiator validates
            // the pinned entry.
            if self.config.enable_transport {
                if let Some(back_iface) = self.link_table.handle_proof(&packet.destination) {
                    if back_iface != info.address {
                        let mut forwarded = *packet;
                        forwarded.header.hops = packet.header.hops.saturating_add(1);
                        forwarded.ifac = None;
                        if forwarded.header.hops <= MAX_HOPS {
                            self.send(TxMessage {
                                tx_type: TxMessageType::Direct(back_iface),
                                packet: forwarded,
                            })
                            .await;
                        }
                    }
                }
            }
            return;
        }

        // Delivery receipt: destination field carries the proved packet's
        // hash, payload is the destination identity's signature over it.
        if packet.context == PacketContext::None
            && packet.data.len() == crate::identity::SIGNATURE_LENGTH
        {
            if let Some(destination) = self.receipts.destination_of(&packet.destination) {
                let Some(identity) = self.known_destinations.recall_identity(&destination)
                else {
                    return;
                };
                if identity.verify(packet.destination.as_slice(), packet.data.as_slice()).is_err()
                {
                    self.counters.auth_failures += 1;
                    return;
                }
                if let Some(proven) = self.receipts.resolve(&packet.destination) {
                    let _ = self.delivery_tx.send(DeliveryEvent::Delivered {
                        packet_hash: proven.packet_hash,
                        destination: proven.destination,
                        rtt: proven.rtt,
                    });
                }
                return;
            }
        }

        // Link-layer proofs in transit follow the pinned path.
        if self.config.enable_transport {
            self.forward_link_packet(packet, info).await;
        }
    }

    //***********************************************************************//

    async fn handle_data(&mut self, packet: &Packet, info: &InterfaceInfo) {
        if packet.header.destination_type == DestinationType::Link {
            self.handle_link_data(packet, info).await;
            return;
        }

        if packet.header.destination_type == DestinationType::Plain
            && packet.destination == *self.path_requests.probe_destination()
        {
            self.handle_path_request(packet, info).await;
            return;
        }

        if let Some(destination) = self.in_destinations.get(&packet.destination).cloned() {
            self.deliver_local(packet, info, destination).await;
            return;
        }

        // Transit forwarding with the hop budget enforced.
        if !self.config.enable_transport {
            return;
        }
        let now = epoch_secs();
        if !self.path_table.has_path(&packet.destination, now) {
            self.counters.no_route += 1;
            return;
        }
        let Some(entry) = self.path_table.get(&packet.destination) else {
            return;
        };
        if entry.iface == info.address {
            return;
        }
        let egress = entry.iface;

        let mut forwarded = *packet;
        forwarded.header.hops = packet.header.hops.saturating_add(1);
        forwarded.ifac = None;
        if forwarded.header.hops > MAX_HOPS {
            self.counters.hop_limit += 1;
            return;
        }
        let (routed, _) = self.path_table.route_outbound(&forwarded);
        self.send(TxMessage { tx_type: TxMessageType::Direct(egress), packet: routed }).await;
    }

    async fn handle_link_data(&mut self, packet: &Packet, info: &InterfaceInfo) {
        let local = self
            .in_links
            .get(&packet.destination)
            .or_else(|| self.out_links.get(&packet.destination))
            .cloned();

        if let Some(link) = local {
            let result = link.lock().await.handle_packet(packet);
            match result {
                LinkHandleResult::Reply(reply) => {
                    self.send(TxMessage {
                        tx_type: TxMessageType::Direct(info.address),
                        packet: reply,
                    })
                    .await;
                }
                LinkHandleResult::Closed(_) => {
                    self.in_links.remove(&packet.destination);
                    self.out_links.remove(&packet.destination);
                }
                _ => {}
            }
            return;
        }

        if self.config.enable_transport {
            self.forward_link_packet(packet, info).await;
        }
    }

    async fn forward_link_packet(&mut self, packet: &Packet, info: &InterfaceInfo) {
        let Some(egress) = self.link_table.route(&packet.destination, info.address) else {
            return;
        };
        let mut forwarded = *packet;
        forwarded.header.hops = packet.header.hops.saturating_add(1);
        forwarded.ifac = None;
        if forwarded.header.hops > MAX_HOPS {
            self.counters.hop_limit += 1;
            return;
        }
        self.send(TxMessage { tx_type: TxMessageType::Direct(egress), packet: forwarded }).await;
    }

    async fn deliver_local(
        &mut self,
        packet: &Packet,
        info: &InterfaceInfo,
        destination: Arc<Mutex<crate::destination::SingleInputDestination>>,
    ) {
        let guard = destination.lock().await;
        let decrypted = guard.decrypt(packet.data.as_slice());
        let (plaintext, ratchet_used) = match decrypted {
            Ok(result) => result,
            Err(_) => {
                // Undecryptable traffic is dropped without telling anyone.
                self.counters.auth_failures += 1;
                return;
            }
        };

        // Prove delivery back along the arrival interface so the sender's
        // receipt can resolve.
        let proof = Packet {
            header: Header { packet_type: PacketType::Proof, ..Default::default() },
            ifac: None,
            destination: packet.hash(),
            transport_id: None,
            context: PacketContext::None,
            data: PayloadBuffer::from_slice(&guard.identity.sign(packet.hash().as_slice())),
        };
        drop(guard);

        let _ = self.data_tx.send(ReceivedData {
            destination: packet.destination,
            data: plaintext,
            context: packet.context,
            ratchet_used,
            iface: info.address,
        });

        self.send(TxMessage { tx_type: TxMessageType::Direct(info.address), packet: proof })
            .await;
    }

    //***********************************************************************//

    async fn handle_path_request(&mut self, packet: &Packet, info: &InterfaceInfo) {
        let Some(request) = self.path_requests.decode(packet.data.as_slice()) else {
            return;
        };

        // A probe for one of our own destinations.
        if let Some(destination) = self.in_destinations.get(&request.destination).cloned() {
            if !self.config.respond_to_probes {
                return;
            }
            let response = destination.lock().await.path_response(OsRng, None);
            if let Ok(response) = response {
                self.send(TxMessage {
                    tx_type: TxMessageType::Direct(info.address),
                    packet: response,
                })
                .await;
            }
            return;
        }

        if !self.config.enable_transport {
            return;
        }

        // Answer from the cached announce when a path is known.
        let now = epoch_secs();
        if self.path_table.has_path(&request.destination, now) {
            if let Some(mut response) = self
                .path_table
                .cached_announce(&request.destination, PacketContext::PathResponse)
            {
                response.header.header_type = HeaderType::Header2;
                response.header.transport_type = TransportType::Transport;
                response.transport_id = Some(*self.identity.address_hash());
                self.send(TxMessage {
                    tx_type: TxMessageType::Direct(info.address),
                    packet: response,
                })
                .await;
            }
            return;
        }

        // Unknown destination: ask the rest of the mesh, bounded.
        if let Some(recursive) = self.path_requests.generate_recursive(&request.destination) {
            self.send(TxMessage {
                tx_type: TxMessageType::Broadcast(Some(info.address)),
                packet: recursive,
            })
            .await;
        }
    }

    //***********************************************************************//

    /// The outbound pipeline: routed directly when a path is known,
    /// broadcast for announces and plain-addressed packets, dropped
    /// otherwise.
    pub(crate) async fn dispatch_outbound(
        &mut self,
        packet: Packet,
        want_receipt: bool,
    ) -> super::SendOutcome {
        if want_receipt {
            self.receipts.track(packet.hash(), packet.destination);
        }

        let (routed, iface) = self.path_table.route_outbound(&packet);
        if let Some(iface) = iface {
            self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: routed }).await;
            return super::SendOutcome::SentDirect;
        }

        let broadcastable = packet.header.packet_type == PacketType::Announce
            || matches!(
                packet.header.destination_type,
                DestinationType::Plain | DestinationType::Group
            )
            || packet.header.destination_type == DestinationType::Link;
        if broadcastable {
            self.send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet: routed })
                .await;
            return super::SendOutcome::SentBroadcast;
        }

        log::trace!(
            "tp({}): no route for outbound packet to {}",
            self.config.name,
            packet.destination
        );
        self.counters.no_route += 1;
        super::SendOutcome::NoRoute
    }

    pub(crate) async fn send(&self, message: TxMessage) {
        self.iface_manager.lock().await.send(message).await;
    }

    //***********************************************************************//

    /// Called when an interface registers: restored path-table rows bound
    /// to its name come back, and tunnel announces replay.
    pub(crate) async fn adopt_interface(
        &mut self,
        properties: &InterfaceProperties,
        address: AddressHash,
    ) {
        let now = epoch_secs();

        let mut remaining = Vec::new();
        for persisted in std::mem::take(&mut self.restored_paths) {
            if persisted.iface_name != properties.name {
                remaining.push(persisted);
                continue;
            }
            if persisted.expires_at < now {
                continue;
            }
            let (Ok(destination), Ok(received_from)) = (
                AddressHash::from_slice(persisted.destination.as_ref()),
                AddressHash::from_slice(persisted.received_from.as_ref()),
            ) else {
                continue;
            };
            let Some(mode) = crate::iface::InterfaceMode::from_wire(persisted.mode) else {
                continue;
            };
            self.path_table.insert(
                destination,
                PathEntry {
                    received_from,
                    iface: address,
                    hops: persisted.hops,
                    expires_at: persisted.expires_at,
                    announce_timestamp: persisted.announce_timestamp,
                    announce_payload: persisted.announce_payload.to_vec(),
                    announce_has_ratchet: persisted.announce_has_ratchet,
                    source_mode: mode,
                },
            );
        }
        self.restored_paths = remaining;

        if let Some(tunnel_id) = properties.tunnel_id() {
            self.replay_tunnel(&tunnel_id, address, properties.mode).await;
        }
    }

    /// Feeds a tunnel's stored announces back into the path table.
    pub(crate) async fn replay_tunnel(
        &mut self,
        tunnel_id: &AddressHash,
        iface: AddressHash,
        mode: crate::iface::InterfaceMode,
    ) {
        let now = epoch_secs();
        for stored in self.tunnels.attach(tunnel_id) {
            let Ok(destination) = AddressHash::from_slice(stored.destination.as_ref()) else {
                continue;
            };
            if !self.path_table.should_accept(
                &destination,
                stored.hops,
                stored.announce_timestamp,
                now,
            ) {
                continue;
            }
            let Some(source_mode) = crate::iface::InterfaceMode::from_wire(stored.mode) else {
                continue;
            };
            log::debug!("tp({}): tunnel replay for {}", self.config.name, destination);
            self.path_table.insert(
                destination,
                PathEntry {
                    received_from: destination,
                    iface,
                    hops: stored.hops,
                    expires_at: now + mode.path_expiry_secs(),
                    announce_timestamp: stored.announce_timestamp,
                    announce_payload: stored.payload.to_vec(),
                    announce_has_ratchet: stored.has_ratchet,
                    source_mode,
                },
            );
        }
    }

    /// Serializes the path table and tunnel set to instance storage.
    pub(crate) async fn persist_state(&mut self) {
        let names: std::collections::HashMap<AddressHash, String> = self
            .iface_manager
            .lock()
            .await
            .snapshot()
            .into_iter()
            .map(|iface| (iface.address, iface.name))
            .collect();
        self.persist_state_with(&names).await;
    }

    /// Persistence with the interface-name bindings supplied by the
    /// caller; shutdown captures them before the registry empties.
    pub(crate) async fn persist_state_with(
        &mut self,
        names: &std::collections::HashMap<AddressHash, String>,
    ) {
        let Some(storage) = &self.storage else {
            return;
        };

        let mut entries = Vec::with_capacity(self.path_table.len());
        for (destination, entry) in self.path_table.iter() {
            let Some(iface_name) = names.get(&entry.iface) else {
                continue;
            };
            entries.push(PersistedPathEntry {
                destination: serde_bytes::ByteBuf::from(destination.as_slice().to_vec()),
                received_from: serde_bytes::ByteBuf::from(
                    entry.received_from.as_slice().to_vec(),
                ),
                iface_name: iface_name.clone(),
                hops: entry.hops,
                expires_at: entry.expires_at,
                announce_timestamp: entry.announce_timestamp,
                announce_payload: serde_bytes::ByteBuf::from(entry.announce_payload.clone()),
                announce_has_ratchet: entry.announce_has_ratchet,
                mode: entry.source_mode.to_wire(),
            });
        }

        if let Err(err) = storage.save_path_table(&entries) {
            log::warn!("tp({}): path table persist failed: {}", self.config.name, err);
        }
        if let Err(err) = storage.save_tunnels(&self.tunnels) {
            log::warn!("tp({}): tunnel persist failed: {}", self.config.name, err);
        }
    }

    /// Responder links that closed are dropped from the maps; pending
    /// initiator links get their watchdog driven by the tick loop.
    pub(crate) async fn drive_link_watchdogs(&mut self) {
        let now = std::time::Instant::now();
        let mut keepalives = Vec::new();
        let mut closed = Vec::new();

        for (link_id, link) in self.in_links.iter().chain(self.out_links.iter()) {
            let mut guard = link.lock().await;
            if let Some(probe) = guard.watchdog(now) {
                keepalives.push(probe);
            }
            if guard.status() == LinkStatus::Closed {
                closed.push(*link_id);
            }
        }

        for link_id in closed {
            self.in_links.remove(&link_id);
            self.out_links.remove(&link_id);
        }

        for probe in keepalives {
            self.dispatch_outbound(probe, false).await;
        }
    }
}

use std::time::Duration;

use rand_core::OsRng;

use lattica_mesh::destination::{DestinationName, SingleInputDestination, SingleOutputDestination};
use lattica_mesh::identity::PrivateIdentity;
use lattica_mesh::iface::{
    seal_with_ifac, InterfaceChannel, InterfaceMode, InterfaceProperties, IfacSpec,
};
use lattica_mesh::packet::{HeaderType, PacketContext, PacketType, TransportType};
use lattica_mesh::transport::path_requests::PathRequests;
use lattica_mesh::transport::{Transport, TransportConfig};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn fast_iface(name: &str, mode: InterfaceMode) -> InterfaceProperties {
    InterfaceProperties::new(name, mode).with_bitrate(1_000_000_000)
}

fn remote_destination(app: &str, aspect: &str) -> SingleInputDestination {
    SingleInputDestination::new(
        PrivateIdentity::generate(OsRng),
        DestinationName::new(app, &[aspect]).expect("name"),
    )
}

async fn next_tx(
    channel: &mut InterfaceChannel,
) -> Option<lattica_mesh::iface::TxMessage> {
    tokio::time::timeout(RECV_TIMEOUT, channel.tx_receiver.recv()).await.ok().flatten()
}

#[tokio::test]
async fn announce_rebroadcast_honors_mode_filter() {
    let transport = Transport::start(
        TransportConfig::new("relay").with_transport_enabled(true),
    )
    .await
    .expect("start");

    let i1 = transport.register_interface(fast_iface("i1", InterfaceMode::Full)).await;
    let mut i2 = transport.register_interface(fast_iface("i2", InterfaceMode::Roaming)).await;
    let mut i3 =
        transport.register_interface(fast_iface("i3", InterfaceMode::AccessPoint)).await;

    let mut announces = transport.recv_announces();

    let mut remote = remote_destination("flowtest", "announce");
    let announce = remote.announce(OsRng, Some(b"hello mesh")).expect("announce");
    let original_hops = announce.header.hops;
    let wire = announce.pack().expect("pack");

    transport.inbound(&wire, i1.address).await.expect("inbound");

    let event = tokio::time::timeout(RECV_TIMEOUT, announces.recv())
        .await
        .expect("announce event timely")
        .expect("announce event");
    assert_eq!(event.destination, remote.address_hash);
    assert_eq!(event.app_data, b"hello mesh");
    assert_eq!(event.iface, i1.address);

    assert!(transport.has_path(&remote.address_hash).await);
    assert_eq!(transport.hops_to(&remote.address_hash).await, Some(1));

    // Let the announce budget accumulate, then drain the queues.
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.run_maintenance_jobs().await;

    // Roaming egress forwards announces sourced on a FULL interface.
    let rebroadcast = next_tx(&mut i2).await.expect("rebroadcast on roaming iface");
    assert_eq!(rebroadcast.packet.header.packet_type, PacketType::Announce);
    assert_eq!(rebroadcast.packet.header.hops, original_hops + 1);
    assert_eq!(rebroadcast.packet.header.header_type, HeaderType::Header2);
    assert_eq!(rebroadcast.packet.header.transport_type, TransportType::Transport);
    assert_eq!(rebroadcast.packet.transport_id, Some(transport.address_hash().await));

    // Access points never rebroadcast.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(i3.tx_receiver.try_recv().is_err());

    // The same announce arriving again is blocked by the hashlist: no new
    // event, no further rebroadcast.
    let replays_before = transport.drop_counters().await.replays;
    transport.inbound(&wire, i2.address).await.expect("inbound replay");
    assert_eq!(transport.drop_counters().await.replays, replays_before + 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.run_maintenance_jobs().await;
    assert!(i2.tx_receiver.try_recv().is_err());

    transport.stop().await;
}

#[tokio::test]
async fn duplicate_delivery_invokes_callback_once() {
    let transport = Transport::start(TransportConfig::new("dedup")).await.expect("start");

    let i1 = transport.register_interface(fast_iface("i1", InterfaceMode::Full)).await;
    let i2 = transport.register_interface(fast_iface("i2", InterfaceMode::Full)).await;

    let local = remote_destination("dedup", "inbox");
    let local_identity = *local.identity.as_identity();
    let name = DestinationName::new("dedup", &["inbox"]).expect("name");
    let address = local.address_hash;
    transport.register_destination(local).await;

    let mut received = transport.received_data();

    let sender = SingleOutputDestination::new(local_identity, name);
    let ciphertext = sender.encrypt(OsRng, b"exactly once", None).expect("encrypt");

    let packet = lattica_mesh::packet::Packet {
        destination: address,
        data: lattica_mesh::packet::PayloadBuffer::from_slice(&ciphertext),
        ..Default::default()
    };
    let wire = packet.pack().expect("pack");

    // The same packet arrives on two interfaces within a tick.
    transport.inbound(&wire, i1.address).await.expect("inbound 1");
    transport.inbound(&wire, i2.address).await.expect("inbound 2");

    let event = tokio::time::timeout(RECV_TIMEOUT, received.recv())
        .await
        .expect("delivery timely")
        .expect("delivery");
    assert_eq!(event.destination, address);
    assert_eq!(event.data, b"exactly once");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.try_recv().is_err(), "second delivery must be deduplicated");

    transport.stop().await;
}

#[tokio::test]
async fn path_request_answered_from_cached_announce() {
    let transport = Transport::start(
        TransportConfig::new("resolver").with_transport_enabled(true),
    )
    .await
    .expect("start");

    let i1 = transport.register_interface(fast_iface("i1", InterfaceMode::Full)).await;
    let mut i2 = transport.register_interface(fast_iface("i2", InterfaceMode::Full)).await;

    // Learn a path on i1.
    let mut remote = remote_destination("resolver", "target");
    let wire = remote.announce(OsRng, None).expect("announce").pack().expect("pack");
    transport.inbound(&wire, i1.address).await.expect("inbound");
    assert!(transport.has_path(&remote.address_hash).await);

    // A probe for that destination arrives on i2.
    let requester = PathRequests::new("probe", None, 4, Duration::from_secs(30));
    let request = requester.generate(&remote.address_hash, None);
    transport
        .inbound(&request.pack().expect("pack"), i2.address)
        .await
        .expect("inbound request");

    let response = next_tx(&mut i2).await.expect("path response");
    assert_eq!(response.packet.header.packet_type, PacketType::Announce);
    assert_eq!(response.packet.context, PacketContext::PathResponse);
    assert_eq!(response.packet.destination, remote.address_hash);

    transport.stop().await;
}

#[tokio::test]
async fn ifac_gates_inbound_traffic() {
    let transport = Transport::start(TransportConfig::new("ifac")).await.expect("start");

    let spec = IfacSpec { netname: "closed-net".into(), netkey: Some("secret".into()), size: 8 };
    let props = fast_iface("private", InterfaceMode::Full).with_ifac(&spec).expect("props");
    let iface = transport.register_interface(props).await;

    let mut announces = transport.recv_announces();
    let mut remote = remote_destination("ifac", "peer");
    let announce = remote.announce(OsRng, None).expect("announce");

    // Correctly sealed: passes and produces an announce event.
    let sealed = seal_with_ifac(&announce, &spec.derive().expect("key")).expect("sealed");
    transport.inbound(&sealed, iface.address).await.expect("inbound sealed");
    let event = tokio::time::timeout(RECV_TIMEOUT, announces.recv())
        .await
        .expect("event timely")
        .expect("event");
    assert_eq!(event.destination, remote.address_hash);

    // Unsealed traffic on an authenticated interface is dropped.
    let failures_before = transport.drop_counters().await.auth_failures;
    let mut second = remote_destination("ifac", "other");
    let open_wire = second.announce(OsRng, None).expect("announce").pack().expect("pack");
    transport.inbound(&open_wire, iface.address).await.expect("inbound open");
    assert_eq!(transport.drop_counters().await.auth_failures, failures_before + 1);

    // A tampered seal fails tag verification.
    let mut third = remote_destination("ifac", "third");
    let mut tampered =
        seal_with_ifac(&third.announce(OsRng, None).expect("announce"), &spec.derive().expect("key"))
            .expect("sealed");
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    transport.inbound(&tampered, iface.address).await.expect("inbound tampered");
    assert_eq!(transport.drop_counters().await.auth_failures, failures_before + 2);

    transport.stop().await;
}

#[tokio::test]
async fn path_table_survives_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut remote = remote_destination("persist", "target");
    let wire = remote.announce(OsRng, None).expect("announce").pack().expect("pack");
    let destination = remote.address_hash;

    {
        let transport = Transport::start(
            TransportConfig::new("node").with_storage_dir(dir.path().to_path_buf()),
        )
        .await
        .expect("start");
        let iface = transport.register_interface(fast_iface("wire", InterfaceMode::Full)).await;
        transport.inbound(&wire, iface.address).await.expect("inbound");
        assert!(transport.has_path(&destination).await);
        transport.stop().await;
    }

    let reborn = Transport::start(
        TransportConfig::new("node").with_storage_dir(dir.path().to_path_buf()),
    )
    .await
    .expect("restart");

    // Until the named interface returns, the restored path stays parked.
    assert!(!reborn.has_path(&destination).await);

    reborn.register_interface(fast_iface("wire", InterfaceMode::Full)).await;
    assert!(reborn.has_path(&destination).await);
    assert_eq!(reborn.hops_to(&destination).await, Some(1));

    reborn.stop().await;
}

#[tokio::test]
async fn tunnel_interface_rehydrates_paths_on_return() {
    let transport = Transport::start(TransportConfig::new("tunneled")).await.expect("start");

    let tunnel_identity = PrivateIdentity::generate(OsRng);
    let props = fast_iface("uplink", InterfaceMode::Gateway)
        .with_tunnel(*tunnel_identity.as_identity().public_key_bytes());

    let iface = transport.register_interface(props.clone()).await;

    let mut remote = remote_destination("tunnel", "peer");
    let wire = remote.announce(OsRng, None).expect("announce").pack().expect("pack");
    transport.inbound(&wire, iface.address).await.expect("inbound");
    assert!(transport.has_path(&remote.address_hash).await);

    // The uplink goes away and takes its paths with it.
    transport.deregister_interface(&iface.address).await;
    assert!(!transport.has_path(&remote.address_hash).await);

    // On reconnect the tunnel replays its stored announces; no fresh
    // announce from the network is needed.
    transport.register_interface(props).await;
    assert!(transport.has_path(&remote.address_hash).await);
    assert_eq!(transport.hops_to(&remote.address_hash).await, Some(1));

    transport.stop().await;
}

#[tokio::test]
async fn oversized_hop_count_leaves_no_state() {
    let transport = Transport::start(TransportConfig::new("hops")).await.expect("start");
    let iface = transport.register_interface(fast_iface("i1", InterfaceMode::Full)).await;

    let mut remote = remote_destination("hops", "far");
    let mut announce = remote.announce(OsRng, None).expect("announce");
    announce.header.hops = lattica_mesh::packet::MAX_HOPS + 1;
    let wire = announce.pack().expect("pack");

    transport.inbound(&wire, iface.address).await.expect("inbound");
    assert_eq!(transport.drop_counters().await.hop_limit, 1);
    assert!(!transport.has_path(&remote.address_hash).await);
    assert!(transport.known_identity(&remote.address_hash).await.is_none());

    transport.stop().await;
}

#[tokio::test]
async fn stopped_transport_rejects_traffic() {
    let transport = Transport::start(TransportConfig::new("halted")).await.expect("start");
    let iface = transport.register_interface(fast_iface("i1", InterfaceMode::Full)).await;
    let iface_address = iface.address;
    transport.stop().await;

    assert_eq!(
        transport.inbound(&[0u8; 32], iface_address).await,
        Err(lattica_mesh::MeshError::TransportNotStarted)
    );
    assert!(matches!(
        transport.outbound(lattica_mesh::packet::Packet::default()).await,
        Err(lattica_mesh::MeshError::TransportNotStarted)
    ));
}

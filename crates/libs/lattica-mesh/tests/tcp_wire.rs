//! Announce propagation over a real TCP socket pair: HDLC framing, the
//! streaming deframer and the driver reconnect scaffolding in one path.

use std::time::Duration;

use rand_core::OsRng;

use lattica_mesh::destination::{DestinationName, SingleInputDestination};
use lattica_mesh::identity::PrivateIdentity;
use lattica_mesh::iface::tcp_client::TcpClient;
use lattica_mesh::iface::tcp_server::TcpServer;
use lattica_mesh::iface::{InterfaceMode, InterfaceProperties};
use lattica_mesh::transport::{Transport, TransportConfig};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

#[tokio::test]
async fn announce_crosses_a_tcp_wire() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");

    let server_side = Transport::start(TransportConfig::new("server")).await.expect("start");
    let client_side = Transport::start(TransportConfig::new("client")).await.expect("start");

    // Server: a listener interface whose accepted connections register as
    // child interfaces on the same transport.
    let template = InterfaceProperties::new("tcp-in", InterfaceMode::Full);
    let server_channel = server_side
        .register_interface(InterfaceProperties::new("tcp-listen", InterfaceMode::Full))
        .await;
    let listener_address = server_channel.address;
    let listener_driver = tokio::spawn(
        TcpServer::new(addr.clone(), template, server_side.interface_manager())
            .run(server_channel),
    );
    server_side.attach_driver(&listener_address, listener_driver).await;

    // Client: one connecting interface.
    let client_channel = client_side
        .register_interface(InterfaceProperties::new("tcp-out", InterfaceMode::Full))
        .await;
    let client_address = client_channel.address;
    let client_driver = tokio::spawn(TcpClient::new(addr).run(client_channel));
    client_side.attach_driver(&client_address, client_driver).await;

    // Give the connection a moment to come up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut announces = server_side.recv_announces();

    let destination = SingleInputDestination::new(
        PrivateIdentity::generate(OsRng),
        DestinationName::new("tcptest", &["node"]).expect("name"),
    );
    let address = destination.address_hash;
    let registered = client_side.register_destination(destination).await;
    client_side.announce(&registered, Some(b"over tcp")).await.expect("announce");

    let event = tokio::time::timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce crossed the wire")
        .expect("announce event");
    assert_eq!(event.destination, address);
    assert_eq!(event.app_data, b"over tcp");
    assert!(server_side.has_path(&address).await);

    client_side.stop().await;
    server_side.stop().await;
}

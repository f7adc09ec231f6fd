use std::sync::Arc;

use tokio::net::TcpListener;

use crate::iface::tcp_client::TcpClient;
use crate::iface::{InterfaceChannel, InterfaceManager, InterfaceProperties};

/// Listening TCP driver. Each accepted connection is registered as its own
/// interface (cloned from the server's property template) and served by a
/// `TcpClient` task, so routing and IFAC treat every peer independently.
pub struct TcpServer {
    addr: String,
    template: InterfaceProperties,
    manager: Arc<tokio::sync::Mutex<InterfaceManager>>,
}

impl TcpServer {
    pub fn new<T: Into<String>>(
        addr: T,
        template: InterfaceProperties,
        manager: Arc<tokio::sync::Mutex<InterfaceManager>>,
    ) -> Self {
        Self { addr: addr.into(), template, manager }
    }

    pub async fn run(self, mut channel: InterfaceChannel) {
        loop {
            if channel.stop.is_cancelled() {
                break;
            }

            let listener = match TcpListener::bind(&self.addr).await {
                Ok(listener) => listener,
                Err(_) => {
                    log::warn!("tcp_server: couldn't bind <{}>", self.addr);
                    channel.set_online(false);
                    tokio::select! {
                        _ = channel.stop.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    }
                    continue;
                }
            };

            log::info!("tcp_server: listening on <{}>", self.addr);
            channel.set_online(true);

            loop {
                tokio::select! {
                    _ = channel.stop.cancelled() => {
                        return;
                    }
                    // The listener itself carries no packets; outbound
                    // messages go to the per-connection interfaces.
                    _ = channel.tx_receiver.recv() => {}
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else {
                            continue;
                        };
                        log::info!("tcp_server: client <{}> on <{}>", peer, self.addr);

                        let mut properties = self.template.clone();
                        properties.name = format!("{}/{}", properties.name, peer);

                        let mut manager = self.manager.lock().await;
                        let client_channel = manager.register(properties);
                        let client_address = client_channel.address;
                        let driver = tokio::spawn(
                            TcpClient::from_stream(peer.to_string(), stream)
                                .run(client_channel),
                        );
                        manager.attach_driver(&client_address, driver);
                    }
                }
            }
        }
    }
}

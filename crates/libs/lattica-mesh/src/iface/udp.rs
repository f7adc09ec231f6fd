use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::iface::InterfaceChannel;

const DATAGRAM_BUFFER: usize = 2048;

/// UDP datagram driver: one datagram is one packet, no framing layer.
pub struct UdpInterface {
    bind_addr: String,
    forward_addr: Option<String>,
}

impl UdpInterface {
    pub fn new<T: Into<String>>(bind_addr: T, forward_addr: Option<T>) -> Self {
        Self { bind_addr: bind_addr.into(), forward_addr: forward_addr.map(Into::into) }
    }

    pub async fn run(self, mut channel: InterfaceChannel) {
        loop {
            if channel.stop.is_cancelled() {
                break;
            }

            let socket = match UdpSocket::bind(&self.bind_addr).await {
                Ok(socket) => Arc::new(socket),
                Err(_) => {
                    log::info!("udp: couldn't bind <{}>", self.bind_addr);
                    channel.set_online(false);
                    tokio::select! {
                        _ = channel.stop.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    }
                    continue;
                }
            };

            log::info!("udp: bound to <{}>", self.bind_addr);
            channel.set_online(true);

            let mut datagram = [0u8; DATAGRAM_BUFFER];
            loop {
                tokio::select! {
                    _ = channel.stop.cancelled() => {
                        return;
                    }
                    result = socket.recv_from(&mut datagram) => {
                        match result {
                            Ok((n, _from)) if n > 0 => {
                                channel.deliver_raw(datagram[..n].to_vec()).await;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                log::warn!("udp: recv error on <{}>: {}", self.bind_addr, err);
                                break;
                            }
                        }
                    }
                    maybe = channel.tx_receiver.recv() => {
                        let Some(message) = maybe else {
                            channel.set_online(false);
                            return;
                        };
                        let Some(forward_addr) = &self.forward_addr else {
                            continue;
                        };
                        let Ok(wire) = channel.encode_outgoing(&message.packet) else {
                            continue;
                        };
                        let _ = socket.send_to(&wire, forward_addr.as_str()).await;
                    }
                }
            }

            channel.set_online(false);
        }
    }
}

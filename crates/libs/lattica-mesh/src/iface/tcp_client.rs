use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::buffer::OutputBuffer;
use crate::iface::hdlc;
use crate::iface::InterfaceChannel;

const READ_BUFFER: usize = 4096;
const MAX_FRAME: usize = 2048;
const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_CEILING: Duration = Duration::from_secs(60);

/// TCP byte-stream driver. Wraps packets in HDLC frames and runs a
/// streaming deframer on the inbound side. Connection loss flips the
/// interface offline and reconnects with doubling backoff.
pub struct TcpClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpClient {
    pub fn new<T: Into<String>>(addr: T) -> Self {
        Self { addr: addr.into(), stream: None }
    }

    /// Server-accepted connections arrive with a live stream; these do not
    /// reconnect, the server registers a new interface per connection.
    pub fn from_stream<T: Into<String>>(addr: T, stream: TcpStream) -> Self {
        Self { addr: addr.into(), stream: Some(stream) }
    }

    pub async fn run(mut self, mut channel: InterfaceChannel) {
        let reconnecting = self.stream.is_none();
        let mut backoff = RECONNECT_FLOOR;

        loop {
            if channel.stop.is_cancelled() {
                break;
            }

            let stream = match self.stream.take() {
                Some(stream) => stream,
                None => match TcpStream::connect(&self.addr).await {
                    Ok(stream) => stream,
                    Err(_) => {
                        log::info!("tcp_client: connect to <{}> failed", self.addr);
                        channel.set_online(false);
                        tokio::select! {
                            _ = channel.stop.cancelled() => break,
                            // A network-type change restarts the schedule
                            // from the floor and retries right away.
                            _ = channel.network_changed() => {
                                backoff = RECONNECT_FLOOR;
                                continue;
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_CEILING);
                        continue;
                    }
                },
            };

            log::info!("tcp_client: connected to <{}>", self.addr);
            channel.set_online(true);
            backoff = RECONNECT_FLOOR;

            let (mut read_half, mut write_half) = stream.into_split();
            let mut deframer = hdlc::Deframer::new(MAX_FRAME);
            let mut read_buf = [0u8; READ_BUFFER];

            'connected: loop {
                tokio::select! {
                    _ = channel.stop.cancelled() => {
                        channel.set_online(false);
                        return;
                    }
                    result = read_half.read(&mut read_buf) => {
                        match result {
                            Ok(0) => {
                                log::info!("tcp_client: <{}> closed", self.addr);
                                break 'connected;
                            }
                            Ok(n) => {
                                let mut frames: Vec<Vec<u8>> = Vec::new();
                                deframer.push(&read_buf[..n], |frame| {
                                    frames.push(frame.to_vec());
                                });
                                for frame in frames {
                                    channel.deliver_raw(frame).await;
                                }
                            }
                            Err(err) => {
                                log::warn!("tcp_client: read error on <{}>: {}", self.addr, err);
                                break 'connected;
                            }
                        }
                    }
                    maybe = channel.tx_receiver.recv() => {
                        let Some(message) = maybe else {
                            channel.set_online(false);
                            return;
                        };
                        let Ok(wire) = channel.encode_outgoing(&message.packet) else {
                            log::warn!("tcp_client: unencodable packet dropped");
                            continue;
                        };
                        let mut frame_buf = vec![0u8; wire.len() * 2 + 2];
                        let mut out = OutputBuffer::new(&mut frame_buf);
                        if hdlc::frame(&wire, &mut out).is_err() {
                            continue;
                        }
                        if write_half.write_all(out.as_slice()).await.is_err()
                            || write_half.flush().await.is_err()
                        {
                            log::warn!("tcp_client: write failed on <{}>", self.addr);
                            break 'connected;
                        }
                    }
                }
            }

            channel.set_online(false);
            if !reconnecting {
                // A server-side connection is gone for good.
                channel.stop.cancel();
                break;
            }
        }
    }
}

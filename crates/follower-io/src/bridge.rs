//! Newline-delimited JSON status bridge for one front-end client.
//!
//! Publishes a `status` message at a fixed interval and accepts `hello` and
//! `stop`. A `stop` request goes through the same path as an operator
//! interrupt.

use crate::metrics::BRIDGE_CONNECTED;
use crate::protocol::{IncomingMessage, StatusMsg};
use follower_core::{StatusExchange, TimeBase};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest line accepted from a client before the connection is dropped.
const MAX_LINE_BYTES: usize = 16 * 1024;

pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            publish_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct ClientSession {
    handshake_seen: bool,
    client_id: Option<String>,
}

pub struct Bridge {
    listener: TcpListener,
    publish_interval: Duration,
}

impl Bridge {
    pub fn bind(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let bind_error = |source| BridgeError::Bind {
            addr: config.bind_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&config.bind_addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        Ok(Self {
            listener,
            publish_interval: config.publish_interval,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serves clients one at a time until `stop` is set.
    pub fn run(self, exchange: Arc<StatusExchange>, timebase: TimeBase, stop: Arc<AtomicBool>) {
        info!(addr = ?self.local_addr(), "Bridge listening");

        let mut client: Option<TcpStream> = None;
        let mut session = ClientSession::default();
        let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset = 0usize;
        let mut last_publish: Option<Instant> = None;
        let mut sequence: u64 = 0;

        while !stop.load(Ordering::Relaxed) {
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            client = Some(stream);
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(err) => warn!(error = %err, "Could not configure bridge client"),
                    },
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => warn!(error = %err, "Bridge accept error"),
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        recv_buf.extend_from_slice(&temp[..n]);
                        while let Some(pos) = recv_buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = recv_buf.drain(..=pos).collect();
                            let Ok(text) = std::str::from_utf8(&line) else {
                                warn!("Ignoring non-UTF-8 bridge line");
                                continue;
                            };
                            let trimmed = text.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            match IncomingMessage::parse(trimmed) {
                                Some(msg) => handle_incoming(msg, &exchange, &mut session),
                                None => debug!(line = trimmed, "Ignoring unrecognised bridge message"),
                            }
                        }
                        if recv_buf.len() > MAX_LINE_BYTES {
                            warn!("Bridge client sent an oversized line");
                            drop_client = true;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                let due = last_publish.map_or(true, |at| at.elapsed() >= self.publish_interval);
                if !drop_client && send_buf.is_empty() && due {
                    sequence = sequence.wrapping_add(1);
                    let msg = StatusMsg::from_snapshot(&exchange.read(), sequence, timebase.unix_us());
                    match serde_json::to_string(&msg) {
                        Ok(line) => {
                            send_buf = line.into_bytes();
                            send_buf.push(b'\n');
                            send_offset = 0;
                        }
                        Err(err) => warn!(error = %err, "Failed to encode status"),
                    }
                    last_publish = Some(Instant::now());
                }

                if !drop_client && !send_buf.is_empty() {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
            }

            if drop_client {
                client = None;
                recv_buf.clear();
                send_buf.clear();
                send_offset = 0;
                last_publish = None;
                session = ClientSession::default();
                BRIDGE_CONNECTED.set(0.0);
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        BRIDGE_CONNECTED.set(0.0);
        debug!("Bridge stopped");
    }
}

fn handle_incoming(msg: IncomingMessage, exchange: &StatusExchange, session: &mut ClientSession) {
    let version = msg.protocol_version();
    if !version.is_supported() {
        warn!(
            major = version.major,
            minor = version.minor,
            "Unsupported protocol version"
        );
        return;
    }

    match msg {
        IncomingMessage::Hello(hello) => {
            session.handshake_seen = true;
            session.client_id = hello.client_id;
            info!(client_id = ?session.client_id, "Bridge handshake received");
        }
        IncomingMessage::Stop(stop) => {
            if !session.handshake_seen {
                debug!("Stop received before handshake");
            }
            warn!(
                client_id = ?session.client_id,
                reason = stop.reason.as_deref().unwrap_or("unspecified"),
                "Stop requested over bridge"
            );
            exchange.request_stop();
        }
    }
}

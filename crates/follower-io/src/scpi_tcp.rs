//! SCPI over a raw TCP socket, the way BB3 and most bench instruments expose
//! their control channel.

use follower_core::{Connector, Session, TransportError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Blocking SCPI session. Each call drives an owned single-threaded tokio
/// runtime to completion, so the follower loop stays synchronous.
#[derive(Debug)]
pub struct ScpiTcpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    /// How long to wait for each late reply when resynchronising.
    drain_window: Duration,
    // Queries that timed out may still be answered; those replies must not
    // be taken as the answer to the next query.
    pending_replies: usize,
    runtime: Runtime,
}

impl ScpiTcpSession {
    pub fn connect(address: &str, io_timeout: Duration) -> Result<Self, TransportError> {
        let address = with_default_port(address);
        let connect_error = |reason: String| TransportError::Connect {
            address: address.clone(),
            reason,
        };

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| connect_error(e.to_string()))?;

        let stream = runtime
            .block_on(async { timeout(io_timeout, TcpStream::connect(&address)).await })
            .map_err(|_| connect_error("timed out".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to disable Nagle on SCPI socket");
        }
        let (read_half, write_half) = stream.into_split();

        info!(address = %address, "Connected to SCPI instrument");
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout: io_timeout,
            drain_window: io_timeout,
            pending_replies: 0,
            runtime,
        })
    }

    /// Defaults to the I/O timeout.
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Reads and drops one line per timed-out query. A reply that has not
    /// shown up within the drain window is treated as lost.
    fn discard_stale_replies(&mut self) {
        let pending = self.pending_replies;
        let window = self.drain_window;
        let reader = &mut self.reader;
        let discarded = self.runtime.block_on(async {
            let mut discarded = 0usize;
            while discarded < pending {
                let mut line = String::new();
                match timeout(window, reader.read_line(&mut line)).await {
                    Ok(Ok(n)) if n > 0 => discarded += 1,
                    _ => break,
                }
            }
            discarded
        });
        if discarded > 0 {
            debug!(discarded, "Discarded late SCPI replies");
        }
        if discarded < pending {
            debug!(lost = pending - discarded, "Late SCPI replies never arrived");
        }
        self.pending_replies = 0;
    }
}

impl Session for ScpiTcpSession {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        if self.pending_replies > 0 {
            self.discard_stale_replies();
        }
        self.write(command)?;

        let io_timeout = self.timeout;
        let reader = &mut self.reader;
        let mut line = String::new();
        let read = self
            .runtime
            .block_on(async { timeout(io_timeout, reader.read_line(&mut line)).await });

        match read {
            Err(_) => {
                self.pending_replies += 1;
                Err(TransportError::Timeout {
                    command: command.to_string(),
                })
            }
            Ok(Err(e)) => Err(TransportError::ConnectionLost(e.to_string())),
            Ok(Ok(0)) => Err(TransportError::ConnectionLost(
                "instrument closed the connection".to_string(),
            )),
            Ok(Ok(_)) => {
                let reply = line.trim_end_matches(['\r', '\n']).to_string();
                trace!(command, reply = %reply, "SCPI query");
                Ok(reply)
            }
        }
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(b'\n');

        let io_timeout = self.timeout;
        let writer = &mut self.writer;
        let sent = self.runtime.block_on(async {
            timeout(io_timeout, async {
                writer.write_all(&frame).await?;
                writer.flush().await
            })
            .await
        });

        match sent {
            Err(_) => Err(TransportError::Timeout {
                command: command.to_string(),
            }),
            Ok(Err(e)) => Err(TransportError::ConnectionLost(e.to_string())),
            Ok(Ok(())) => {
                trace!(command, "SCPI write");
                Ok(())
            }
        }
    }
}

/// Opens [`ScpiTcpSession`]s with a fixed per-call timeout.
#[derive(Debug, Clone, Copy)]
pub struct ScpiTcpConnector {
    pub timeout: Duration,
}

impl Default for ScpiTcpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
        }
    }
}

impl Connector for ScpiTcpConnector {
    type Session = ScpiTcpSession;

    fn connect(&self, address: &str) -> Result<Self::Session, TransportError> {
        ScpiTcpSession::connect(address, self.timeout)
    }
}

fn with_default_port(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_SCPI_PORT}")
    }
}

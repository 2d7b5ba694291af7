//! Client connection handler
//!
//! One TCP connection, two phases. The op phase answers devlist/import
//! queries; a successful import adopts the connection into the URB phase,
//! where the byte stream is a sequence of 48-byte headers plus payloads.
//!
//! Reads accumulate in a buffer that is drained strictly by the sizes the
//! headers declare, so concatenated PDUs in one read and PDUs split across
//! reads both decode correctly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use protocol::{
    decode_op_header, decode_op_request, decode_urb_pdu, encode_import_reply, OpRequest,
    ProtocolError, OP_HEADER_SIZE, USBIP_VERSION,
};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use crate::engine::{Engine, ResponseSink};

const READ_CHUNK: usize = 4096;

/// Consecutive failed sends before the connection is abandoned
const MAX_SEND_FAILURES: u32 = 8;

/// Outbound half of a client connection.
///
/// Written from the network task (op replies, RET_UNLINK, synthetic
/// errors) and the completion task (RET_SUBMIT); the mutex keeps PDUs from
/// interleaving on the wire. Sends are non-blocking and best-effort: a
/// short write is tolerated and logged, persistent failure marks the sink
/// dead so the pump can abandon the connection.
pub struct TcpSink {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    failures: AtomicU32,
}

impl TcpSink {
    fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            peer,
            writer: Mutex::new(writer),
            failures: AtomicU32::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.failures.load(Ordering::Relaxed) < MAX_SEND_FAILURES
    }
}

impl ResponseSink for TcpSink {
    fn send(&self, bytes: &[u8]) {
        if !self.is_alive() {
            trace!("sink for {} is dead, dropping {} bytes", self.peer, bytes.len());
            return;
        }

        let writer = self.writer.lock().expect("sink lock poisoned");
        let mut written = 0;
        while written < bytes.len() {
            match writer.try_write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("send to {} failed: {}", self.peer, e);
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }

        if written < bytes.len() {
            warn!(
                "short write to {}: {}/{} bytes",
                self.peer,
                written,
                bytes.len()
            );
            self.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Op,
    Urb,
}

/// Per-connection pump
pub struct ClientConnection {
    engine: Arc<Engine>,
    peer: SocketAddr,
}

impl ClientConnection {
    pub fn new(engine: Arc<Engine>, peer: SocketAddr) -> Self {
        Self { engine, peer }
    }

    /// Drive the connection until EOF, a fatal protocol error, or a dead
    /// sink. Always releases engine-side state on the way out.
    pub async fn run(self, stream: TcpStream) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let sink = Arc::new(TcpSink::new(self.peer, writer));
        let sink_dyn: Arc<dyn ResponseSink> = sink.clone();

        let result = self.pump(&mut reader, &sink, &sink_dyn).await;

        // Live URBs are cancelled and their completions discarded; the
        // client that owned them is gone.
        self.engine.release_connection(&sink_dyn);

        result
    }

    async fn pump(
        &self,
        reader: &mut (impl AsyncReadExt + Unpin),
        sink: &Arc<TcpSink>,
        sink_dyn: &Arc<dyn ResponseSink>,
    ) -> Result<()> {
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut phase = Phase::Op;

        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .with_context(|| format!("read from {}", self.peer))?;
            if n == 0 {
                debug!("client {} closed the connection", self.peer);
                return Ok(());
            }
            pending.extend_from_slice(&chunk[..n]);

            if !sink.is_alive() {
                warn!("abandoning {} after repeated send failures", self.peer);
                return Ok(());
            }

            loop {
                let consumed = match phase {
                    Phase::Op => match self.step_op(&pending, sink_dyn)? {
                        Some((consumed, imported)) => {
                            if imported {
                                info!("client {} imported busid, entering URB phase", self.peer);
                                phase = Phase::Urb;
                            }
                            consumed
                        }
                        None => break,
                    },
                    Phase::Urb => match decode_urb_pdu(&pending) {
                        Ok(Some((pdu, consumed))) => {
                            self.engine.handle_urb_pdu(pdu);
                            consumed
                        }
                        Ok(None) => break,
                        Err(ProtocolError::UnknownCommand { command }) => {
                            // Framing is unknowable past this point, but the
                            // connection itself stays usable: drop the read
                            // buffer and keep listening.
                            warn!("unknown command {:#010x} from {}, dropping", command, self.peer);
                            pending.clear();
                            break;
                        }
                        Err(e) => {
                            warn!("malformed URB header from {}: {}", self.peer, e);
                            anyhow::bail!("protocol error: {}", e);
                        }
                    },
                };
                pending.drain(..consumed);
            }
        }
    }

    /// Decode and answer one op-phase request. Returns consumed bytes and
    /// whether the connection was adopted into the URB phase.
    fn step_op(
        &self,
        pending: &[u8],
        sink_dyn: &Arc<dyn ResponseSink>,
    ) -> Result<Option<(usize, bool)>> {
        if pending.len() >= OP_HEADER_SIZE {
            if let Ok(header) = decode_op_header(pending) {
                if header.version != USBIP_VERSION {
                    debug!(
                        "client {} speaks version {:#06x}, continuing anyway",
                        self.peer, header.version
                    );
                }
            }
        }

        let (request, consumed) = match decode_op_request(pending) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("bad op request from {}: {}", self.peer, e);
                anyhow::bail!("protocol error: {}", e);
            }
        };

        let (reply, matched) = self.engine.handle_op_request(&request);

        let imported = if matched && matches!(request, OpRequest::Import { .. }) {
            if self.engine.adopt_connection(sink_dyn.clone()) {
                sink_dyn.send(&reply);
                true
            } else {
                // Someone else holds the URB phase.
                sink_dyn.send(&encode_import_reply(None));
                false
            }
        } else {
            sink_dyn.send(&reply);
            false
        };

        Ok(Some((consumed, imported)))
    }
}

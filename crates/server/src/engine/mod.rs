//! USB/IP protocol engine
//!
//! The engine bridges two asynchronous, ordered streams: the TCP byte
//! stream carrying multiplexed URBs, and the USB host layer delivering
//! out-of-order transfer completions. It is deliberately free of process
//! globals: everything a transfer callback used to reach through statics
//! lives in the [`Engine`] aggregate, and completions resolve back to their
//! URB through the sequence table alone.
//!
//! Two tasks drive it: the network task feeds decoded PDUs into the
//! dispatcher, the completion task feeds transfer-done events into the
//! router. The sequence table is the only state they share.

pub mod dispatcher;
pub mod registry;
pub mod router;
pub mod sequence;
pub mod urb;

use std::sync::{Arc, Mutex, MutexGuard};

use common::HostCommand;
use protocol::OpRequest;
use tracing::{debug, trace, warn};

use registry::DeviceRegistry;
use sequence::SequenceTable;

/// Outbound byte sink for one client connection.
///
/// Implementations must tolerate being called from both the network task
/// (RET_UNLINK, synthetic errors) and the completion task (RET_SUBMIT);
/// writes are serialized so PDUs never interleave on the wire. Sending is
/// best-effort: failures are logged by the implementation, never surfaced
/// into the engine.
pub trait ResponseSink: Send + Sync {
    fn send(&self, bytes: &[u8]);
}

/// Host-side USB transfer interface consumed by the engine.
///
/// Submission must not block: it runs on the network task. Completions are
/// posted to the engine's event queue out of band, carrying the transfer's
/// token back unchanged.
pub trait UsbHost: Send + Sync {
    fn submit_control(&self, transfer: common::HostTransfer) -> common::Result<()>;
    fn submit(&self, transfer: common::HostTransfer) -> common::Result<()>;
    fn cancel(&self, token: u32);
}

/// The server aggregate: sequence table, device registry, host interface
/// and the active connection's outbound sink.
pub struct Engine {
    sequence: Mutex<SequenceTable>,
    registry: DeviceRegistry,
    host: Arc<dyn UsbHost>,
    sink: Mutex<Option<Arc<dyn ResponseSink>>>,
}

impl Engine {
    pub fn new(host: Arc<dyn UsbHost>, max_inflight_urbs: usize) -> Self {
        Self {
            sequence: Mutex::new(SequenceTable::new(max_inflight_urbs)),
            registry: DeviceRegistry::new(),
            host,
            sink: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Serve an op-phase request. Returns the reply bytes and whether the
    /// request was a successful import (the caller then adopts the
    /// connection into the URB phase).
    pub fn handle_op_request(&self, request: &OpRequest) -> (Vec<u8>, bool) {
        match request {
            OpRequest::Devlist => {
                debug!("serving OP_REQ_DEVLIST");
                (self.registry.devlist_reply(), false)
            }
            OpRequest::Import { busid } => {
                debug!("serving OP_REQ_IMPORT");
                self.registry.import_reply(busid)
            }
        }
    }

    /// Install `sink` as the URB-phase connection. Refused while another
    /// connection holds the URB phase.
    pub fn adopt_connection(&self, sink: Arc<dyn ResponseSink>) -> bool {
        let mut slot = self.lock_sink();
        if slot.is_some() {
            warn!("import refused: another connection is attached");
            return false;
        }
        *slot = Some(sink);
        true
    }

    /// Tear down a connection: every live URB is cancelled at the host and
    /// its eventual completion resolves to nothing. Only the owning
    /// connection clears the slot.
    pub fn release_connection(&self, sink: &Arc<dyn ResponseSink>) {
        {
            let mut slot = self.lock_sink();
            match &*slot {
                Some(current) if Arc::ptr_eq(current, sink) => *slot = None,
                _ => return,
            }
        }

        let orphaned = self.lock_sequence().drain();
        if !orphaned.is_empty() {
            debug!("cancelling {} in-flight URBs on teardown", orphaned.len());
        }
        for urb in orphaned {
            self.host.cancel(urb.seqnum);
        }
    }

    /// Best-effort emission on the active connection. Responses for a
    /// connection that is already gone are dropped.
    pub(crate) fn emit(&self, bytes: &[u8]) {
        match &*self.lock_sink() {
            Some(sink) => sink.send(bytes),
            None => trace!("dropping {}-byte response, no attached connection", bytes.len()),
        }
    }

    /// Queue a cancel request with the host layer.
    pub(crate) fn request_cancel(&self, token: u32) {
        self.host.cancel(token);
    }

    pub(crate) fn submit_to_host(
        &self,
        kind: common::TransferKind,
        transfer: common::HostTransfer,
    ) -> common::Result<()> {
        match kind {
            common::TransferKind::Control => self.host.submit_control(transfer),
            _ => self.host.submit(transfer),
        }
    }

    pub(crate) fn lock_sequence(&self) -> MutexGuard<'_, SequenceTable> {
        self.sequence.lock().expect("sequence table lock poisoned")
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<Arc<dyn ResponseSink>>> {
        self.sink.lock().expect("sink lock poisoned")
    }

    /// Number of URBs currently in flight.
    pub fn live_urbs(&self) -> usize {
        self.lock_sequence().live_count()
    }

    /// Whether `seqnum` was retired within the recent window.
    pub fn is_recent(&self, seqnum: u32) -> bool {
        self.lock_sequence().contains_recent(seqnum)
    }
}

/// Ask the host layer to shut down after the engine stops.
pub async fn shutdown_host(bridge: &common::UsbBridge) -> common::Result<()> {
    bridge.send_command(HostCommand::Shutdown).await
}

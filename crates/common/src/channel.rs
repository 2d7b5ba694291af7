//! Async channel bridge between the Tokio runtime and the USB thread
//!
//! USB transfers run blocking on a dedicated OS thread; the network and
//! completion tasks run under Tokio. Two bounded single-producer /
//! single-consumer queues connect them: commands flow in, completions flow
//! out. The USB side only ever enqueues completions; it never runs engine
//! code.

use async_channel::{bounded, Receiver, Sender, TrySendError};

use crate::transfer::{HostTransfer, TransferDone};

/// Queue depth for both directions; comfortably above the in-flight URB cap
const BRIDGE_DEPTH: usize = 256;

/// Commands from the engine to the USB thread
#[derive(Debug)]
pub enum HostCommand {
    /// Submit a control transfer (endpoint 0, setup packet in the buffer)
    SubmitControl(HostTransfer),

    /// Submit a bulk or interrupt transfer
    Submit(HostTransfer),

    /// Advisory cancellation of an in-flight transfer by its token
    Cancel { token: u32 },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Handle for the Tokio side (engine and network tasks)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<HostCommand>,
    completion_rx: Receiver<TransferDone>,
}

impl UsbBridge {
    /// Queue a command without blocking.
    ///
    /// The dispatcher runs on the network task and must not stall behind a
    /// slow USB thread; a full queue is reported as an error so the caller
    /// can synthesize a submit failure.
    pub fn try_send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => crate::Error::Channel("USB command queue full".into()),
            TrySendError::Closed(_) => crate::Error::Channel("USB thread gone".into()),
        })
    }

    /// Send a command, waiting for queue space. Used outside the data path
    /// (shutdown).
    pub async fn send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next completion event. Sole consumer is the completion
    /// router.
    pub async fn recv_completion(&self) -> crate::Result<TransferDone> {
        self.completion_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB thread (blocking side)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<HostCommand>,
    pub(crate) completion_tx: Sender<TransferDone>,
}

impl UsbWorker {
    /// Receive the next command, blocking the USB thread.
    pub fn recv_command(&self) -> crate::Result<HostCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking.
    pub fn try_recv_command(&self) -> Option<HostCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Post a completion to the router.
    pub fn post_completion(&self, done: TransferDone) -> crate::Result<()> {
        self.completion_tx
            .send_blocking(done)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for the USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_DEPTH);
    let (completion_tx, completion_rx) = bounded(BRIDGE_DEPTH);

    (
        UsbBridge {
            cmd_tx,
            completion_rx,
        },
        UsbWorker {
            cmd_rx,
            completion_tx,
        },
    )
}

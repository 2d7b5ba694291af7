//! USB worker thread
//!
//! Dedicated thread for executing USB transfers. It owns the open device
//! handle, dequeues commands from the channel bridge, runs each transfer
//! blocking, and posts the completion back. Nothing on this thread touches
//! engine state.

use std::collections::HashSet;

use common::{HostCommand, HostTransfer, TransferDone, TransferStatus, UsbWorker};
use rusb::{Context, DeviceHandle};
use tracing::{debug, info, trace, warn};

use super::transfers::execute_transfer;

/// Bound on remembered-but-unmatched cancel tokens
const CANCEL_SET_CAP: usize = 256;

/// USB worker thread state
pub struct HostWorkerThread {
    handle: DeviceHandle<Context>,
    worker: UsbWorker,
    /// Tokens cancelled before their transfer was executed
    cancelled: HashSet<u32>,
}

impl HostWorkerThread {
    pub fn new(handle: DeviceHandle<Context>, worker: UsbWorker) -> Self {
        Self {
            handle,
            worker,
            cancelled: HashSet::new(),
        }
    }

    /// Run the worker loop until shutdown or bridge teardown.
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            let cmd = match self.worker.recv_command() {
                Ok(cmd) => cmd,
                Err(_) => {
                    debug!("command bridge closed");
                    break;
                }
            };

            match cmd {
                HostCommand::SubmitControl(transfer) | HostCommand::Submit(transfer) => {
                    self.execute(transfer);
                }
                HostCommand::Cancel { token } => self.note_cancel(token),
                HostCommand::Shutdown => {
                    info!("USB worker shutting down");
                    break;
                }
            }
        }

        info!("USB worker thread stopped");
    }

    fn execute(&mut self, mut transfer: HostTransfer) {
        let token = transfer.token;

        // Cancellation is advisory: it only catches transfers still queued
        // behind us. Anything already executed completes normally and the
        // router drops the event.
        let (status, actual) = if self.cancelled.remove(&token) {
            trace!("skipping cancelled transfer {:#x}", token);
            (TransferStatus::Failed, 0)
        } else {
            execute_transfer(&mut self.handle, &mut transfer)
        };

        let done = TransferDone {
            token,
            status,
            buffer: transfer.buffer,
            actual,
        };

        if self.worker.post_completion(done).is_err() {
            debug!("completion bridge closed, dropping event for {:#x}", token);
        }
    }

    fn note_cancel(&mut self, token: u32) {
        if self.cancelled.len() >= CANCEL_SET_CAP {
            warn!("cancel set overflow, dropping stale entries");
            self.cancelled.clear();
        }
        self.cancelled.insert(token);
    }
}

/// Spawn the USB worker thread.
pub fn spawn_host_worker(
    handle: DeviceHandle<Context>,
    worker: UsbWorker,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || HostWorkerThread::new(handle, worker).run())
        .expect("Failed to spawn USB worker thread")
}

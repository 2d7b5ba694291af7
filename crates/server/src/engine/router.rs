//! Completion router
//!
//! Sole consumer of the transfer-done queue. Resolves each completion back
//! to its URB through the sequence table, shapes the `RET_SUBMIT`, and
//! emits it on the owning connection. Completions for unknown seqnums are
//! duplicates or unlinked URBs and are dropped along with their buffers.

use std::sync::Arc;

use common::{TransferDone, TransferStatus, UsbBridge};
use protocol::{encode_ret_submit, errno, Direction, SETUP_SIZE};
use tracing::{trace, warn};

use super::Engine;

impl Engine {
    /// Route one transfer-done event.
    pub fn handle_completion(&self, done: TransferDone) {
        let Some(urb) = self.lock_sequence().take(done.token) else {
            trace!(
                "dropping completion for unknown seqnum {:#x}",
                done.token
            );
            return;
        };

        let response = match done.status {
            TransferStatus::Completed => {
                let moved = done.actual.min(done.buffer.len());
                let payload = match urb.direction {
                    Direction::Out => &[][..],
                    Direction::In if urb.is_control() => {
                        // The host layer echoes the setup packet at the
                        // front of the buffer; the client must not see it.
                        done.buffer.get(SETUP_SIZE..moved).unwrap_or(&[])
                    }
                    Direction::In => &done.buffer[..moved],
                };
                trace!(
                    "completing seqnum {:#x} with {} bytes",
                    urb.seqnum,
                    payload.len()
                );
                encode_ret_submit(urb.seqnum, 0, 0, payload)
            }
            TransferStatus::Stalled => {
                warn!("transfer for seqnum {:#x} stalled", urb.seqnum);
                encode_ret_submit(urb.seqnum, errno::EPIPE, 1, &[])
            }
            TransferStatus::Failed => {
                warn!("transfer for seqnum {:#x} failed", urb.seqnum);
                encode_ret_submit(urb.seqnum, errno::ETIME, 1, &[])
            }
        };

        self.emit(&response);
        // `done` drops here, releasing the transfer buffer
    }
}

/// Run the completion task: dequeue transfer-done events until the host
/// side closes. USB callbacks only enqueue; all routing work happens here.
pub async fn run_completion_router(engine: Arc<Engine>, bridge: UsbBridge) {
    while let Ok(done) = bridge.recv_completion().await {
        engine.handle_completion(done);
    }
    trace!("completion queue closed, router exiting");
}

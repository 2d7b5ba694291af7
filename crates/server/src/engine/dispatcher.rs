//! URB dispatcher
//!
//! Turns decoded `CMD_SUBMIT` / `CMD_UNLINK` PDUs into host-side USB
//! transfers. Runs on the network task; everything here is non-blocking or
//! lock-bounded.

use common::{HostTransfer, TransferKind};
use protocol::{
    encode_ret_submit, encode_ret_unlink, errno, round_up_to_mps, Direction, SubmitCmd, UnlinkCmd,
    UrbPdu, SETUP_SIZE,
};
use tracing::{debug, trace, warn};

use super::sequence::InsertError;
use super::urb::{UrbRecord, UrbState};
use super::Engine;

/// Floor for control transfer buffers. Descriptor reads regularly return
/// more than the requested wLength suggests; the slack absorbs them.
const CONTROL_BUFFER_FLOOR: usize = 2048;

impl Engine {
    /// Dispatch one URB-phase PDU.
    pub fn handle_urb_pdu(&self, pdu: UrbPdu) {
        match pdu {
            UrbPdu::Submit(cmd) => self.handle_submit(cmd),
            UrbPdu::Unlink(cmd) => self.handle_unlink(cmd),
        }
    }

    /// Process a `CMD_SUBMIT`: allocate the URB, register it, and hand the
    /// transfer to the host layer.
    pub fn handle_submit(&self, mut cmd: SubmitCmd) {
        let seqnum = cmd.seqnum;

        {
            let table = self.lock_sequence();
            if table.is_live(seqnum) || table.contains_recent(seqnum) {
                trace!("dropping duplicate SUBMIT seqnum {:#x}", seqnum);
                return;
            }
        }

        // No isochronous support; reject explicitly rather than let the
        // URB hang without a response.
        if cmd.number_of_packets > 0 {
            debug!(
                "rejecting isochronous SUBMIT seqnum {:#x} ({} packets)",
                seqnum, cmd.number_of_packets
            );
            self.reject_submit(seqnum, errno::EOPNOTSUPP);
            return;
        }

        let transfer = match self.build_transfer(&mut cmd) {
            Ok(transfer) => transfer,
            Err(status) => {
                self.reject_submit(seqnum, status);
                return;
            }
        };
        let kind = transfer.kind;

        let urb = UrbRecord {
            seqnum,
            ep: cmd.ep,
            direction: cmd.direction,
            flags: cmd.transfer_flags,
            requested_length: cmd.transfer_buffer_length,
            kind,
            setup: cmd.is_control().then_some(cmd.setup),
            state: UrbState::Submitted,
        };

        let insert_result = self.lock_sequence().insert(urb);
        match insert_result {
            Ok(()) => {}
            Err(InsertError::Duplicate) => {
                trace!("dropping duplicate SUBMIT seqnum {:#x}", seqnum);
                return;
            }
            Err(InsertError::Full) => {
                warn!("in-flight URB cap reached, refusing seqnum {:#x}", seqnum);
                self.reject_submit(seqnum, errno::ENOMEM);
                return;
            }
        }

        trace!(
            "submitting seqnum {:#x} ep {} {:?} {:?} ({} bytes)",
            seqnum,
            cmd.ep,
            cmd.direction,
            kind,
            transfer.buffer.len()
        );

        if let Err(e) = self.submit_to_host(kind, transfer) {
            warn!("host refused transfer for seqnum {:#x}: {}", seqnum, e);
            // retire through take() so a phantom completion finds nothing
            let _ = self.lock_sequence().take(seqnum);
            self.emit(&encode_ret_submit(seqnum, errno::EPIPE, 0, &[]));
        }
    }

    /// Process a `CMD_UNLINK`: detach the target URB, ask the host to
    /// cancel, and answer immediately. The reply echoes the UNLINK's own
    /// seqnum, not the target's.
    pub fn handle_unlink(&self, cmd: UnlinkCmd) {
        let unlinked = self.lock_sequence().mark_unlinked(cmd.target_seqnum);

        let status = match unlinked {
            Some(_) => {
                debug!(
                    "unlinked seqnum {:#x}, requesting cancellation",
                    cmd.target_seqnum
                );
                self.request_cancel(cmd.target_seqnum);
                0
            }
            None => {
                trace!("UNLINK miss for seqnum {:#x}", cmd.target_seqnum);
                errno::ENOENT
            }
        };

        self.emit(&encode_ret_unlink(cmd.seqnum, status));
    }

    /// Size and fill the transfer buffer for a SUBMIT. Errors are the
    /// errno to synthesize into the response.
    fn build_transfer(&self, cmd: &mut SubmitCmd) -> Result<HostTransfer, i32> {
        let requested = cmd.transfer_buffer_length as usize;

        if cmd.is_control() {
            // Setup packet at offset 0, data stage behind it.
            let len = (SETUP_SIZE + requested).max(CONTROL_BUFFER_FLOOR);
            let mut buffer = vec![0u8; len];
            buffer[..SETUP_SIZE].copy_from_slice(&cmd.setup);
            if cmd.direction == Direction::Out {
                buffer[SETUP_SIZE..SETUP_SIZE + cmd.data.len()].copy_from_slice(&cmd.data);
            }
            return Ok(HostTransfer {
                token: cmd.seqnum,
                endpoint: (cmd.direction as u8) << 7,
                kind: TransferKind::Control,
                buffer,
            });
        }

        let device = self.registry().attached().ok_or(errno::EPIPE)?;
        let Some(endpoint) = device.endpoints.get(cmd.ep, cmd.direction).copied() else {
            warn!("SUBMIT for unknown endpoint {} {:?}", cmd.ep, cmd.direction);
            return Err(errno::EPIPE);
        };

        let kind = match endpoint.attributes & 0x03 {
            0x02 => TransferKind::Bulk,
            0x03 => TransferKind::Interrupt,
            _ => {
                warn!("unsupported transfer type on endpoint {}", cmd.ep);
                return Err(errno::EOPNOTSUPP);
            }
        };

        let buffer = match cmd.direction {
            // The host controller wants whole packets for IN transfers.
            Direction::In => {
                let rounded = round_up_to_mps(cmd.transfer_buffer_length, endpoint.max_packet_size);
                vec![0u8; rounded as usize]
            }
            Direction::Out => std::mem::take(&mut cmd.data),
        };

        Ok(HostTransfer {
            token: cmd.seqnum,
            endpoint: endpoint.address,
            kind,
            buffer,
        })
    }

    /// Synthesize an immediate failure response for a SUBMIT that never
    /// reached the host. The seqnum is retired so a retransmission is not
    /// answered a second time.
    fn reject_submit(&self, seqnum: u32, status: i32) {
        self.lock_sequence().remember(seqnum);
        self.emit(&encode_ret_submit(seqnum, status, 0, &[]));
    }
}

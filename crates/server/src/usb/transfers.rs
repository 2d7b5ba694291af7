//! USB transfer execution
//!
//! Blocking execution of host transfers against a rusb device handle. Runs
//! exclusively on the USB worker thread.
//!
//! Control transfers keep the 8-byte setup packet at the front of the
//! transfer buffer and report it as moved bytes, so the completion router
//! sees the same shape a host controller would deliver and strips the echo
//! itself.

use std::time::Duration;

use common::{HostTransfer, TransferKind, TransferStatus};
use rusb::{Context, DeviceHandle};
use tracing::{debug, trace, warn};

/// Default timeout for USB transfers (5 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt IN polling timeout. USB/IP clients re-submit interrupt URBs
/// continuously; one second catches rapid HID sequences without pinning
/// the worker on an idle endpoint.
const INTERRUPT_IN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Parsed control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Parse the 8 little-endian setup bytes at the front of a control
    /// transfer buffer.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Execute one transfer and report (status, bytes moved).
///
/// For control transfers the byte count includes the setup echo.
pub fn execute_transfer(
    handle: &mut DeviceHandle<Context>,
    transfer: &mut HostTransfer,
) -> (TransferStatus, usize) {
    match transfer.kind {
        TransferKind::Control => execute_control(handle, transfer),
        TransferKind::Bulk => execute_bulk(handle, transfer),
        TransferKind::Interrupt => execute_interrupt(handle, transfer),
    }
}

fn execute_control(
    handle: &mut DeviceHandle<Context>,
    transfer: &mut HostTransfer,
) -> (TransferStatus, usize) {
    let Some(setup) = SetupPacket::parse(&transfer.buffer) else {
        warn!("control transfer without setup packet");
        return (TransferStatus::Failed, 0);
    };

    trace!(
        "control transfer: request_type={:#04x} request={:#04x} value={:#06x} index={:#06x} length={}",
        setup.request_type,
        setup.request,
        setup.value,
        setup.index,
        setup.length
    );

    let data_end = (8 + setup.length as usize).min(transfer.buffer.len());
    let data = &mut transfer.buffer[8..data_end];

    let result = if setup.is_in() {
        handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            DEFAULT_TIMEOUT,
        )
    } else {
        handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            DEFAULT_TIMEOUT,
        )
    };

    let result = match result {
        // Stalled control endpoint: clear the halt and retry once. This
        // happens when a previous command was not fully processed.
        Err(rusb::Error::Pipe) => {
            warn!("control pipe error, clearing stall on EP0 and retrying");
            let ep0 = if setup.is_in() { 0x80 } else { 0x00 };
            if let Err(e) = handle.clear_halt(ep0) {
                warn!("failed to clear halt on EP0: {}", e);
            }
            if setup.is_in() {
                handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    DEFAULT_TIMEOUT,
                )
            } else {
                handle.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    DEFAULT_TIMEOUT,
                )
            }
        }
        other => other,
    };

    match result {
        Ok(n) => {
            trace!("control transfer moved {} bytes", n);
            (TransferStatus::Completed, 8 + n)
        }
        Err(rusb::Error::Pipe) => (TransferStatus::Stalled, 0),
        Err(e) => {
            warn!("control transfer failed: {}", e);
            (TransferStatus::Failed, 0)
        }
    }
}

fn execute_bulk(
    handle: &mut DeviceHandle<Context>,
    transfer: &mut HostTransfer,
) -> (TransferStatus, usize) {
    let endpoint = transfer.endpoint;

    if transfer.is_in() {
        match handle.read_bulk(endpoint, &mut transfer.buffer, DEFAULT_TIMEOUT) {
            Ok(n) => (TransferStatus::Completed, n),
            // No data pending is normal for polled bulk IN endpoints; an
            // empty success keeps the client re-submitting.
            Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => {
                trace!("bulk IN timeout on endpoint {:#04x}", endpoint);
                (TransferStatus::Completed, 0)
            }
            Err(rusb::Error::Pipe) => {
                // Common for mass storage after SCSI errors: clear the
                // stall and retry once.
                warn!("bulk IN pipe error on {:#04x}, clearing stall", endpoint);
                if handle.clear_halt(endpoint).is_err() {
                    return (TransferStatus::Stalled, 0);
                }
                match handle.read_bulk(endpoint, &mut transfer.buffer, DEFAULT_TIMEOUT) {
                    Ok(n) => (TransferStatus::Completed, n),
                    Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => {
                        (TransferStatus::Completed, 0)
                    }
                    Err(rusb::Error::Pipe) => (TransferStatus::Stalled, 0),
                    Err(e) => {
                        warn!("bulk IN failed after clearing stall: {}", e);
                        (TransferStatus::Failed, 0)
                    }
                }
            }
            Err(e) => {
                warn!("bulk IN failed: {}", e);
                (TransferStatus::Failed, 0)
            }
        }
    } else {
        match handle.write_bulk(endpoint, &transfer.buffer, DEFAULT_TIMEOUT) {
            Ok(n) => (TransferStatus::Completed, n),
            Err(rusb::Error::Pipe) => {
                warn!("bulk OUT pipe error on {:#04x}, clearing stall", endpoint);
                if handle.clear_halt(endpoint).is_err() {
                    return (TransferStatus::Stalled, 0);
                }
                match handle.write_bulk(endpoint, &transfer.buffer, DEFAULT_TIMEOUT) {
                    Ok(n) => (TransferStatus::Completed, n),
                    Err(rusb::Error::Pipe) => (TransferStatus::Stalled, 0),
                    Err(e) => {
                        warn!("bulk OUT failed after clearing stall: {}", e);
                        (TransferStatus::Failed, 0)
                    }
                }
            }
            Err(e) => {
                warn!("bulk OUT failed: {}", e);
                (TransferStatus::Failed, 0)
            }
        }
    }
}

fn execute_interrupt(
    handle: &mut DeviceHandle<Context>,
    transfer: &mut HostTransfer,
) -> (TransferStatus, usize) {
    let endpoint = transfer.endpoint;

    if transfer.is_in() {
        match handle.read_interrupt(endpoint, &mut transfer.buffer, INTERRUPT_IN_TIMEOUT) {
            Ok(n) => {
                if n > 0 {
                    trace!(
                        "interrupt IN ep={:#04x} len={} data={:02x?}",
                        endpoint,
                        n,
                        &transfer.buffer[..n.min(16)]
                    );
                }
                (TransferStatus::Completed, n)
            }
            // Idle HID endpoint; the client re-submits on empty data.
            Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => (TransferStatus::Completed, 0),
            Err(rusb::Error::Pipe) => (TransferStatus::Stalled, 0),
            Err(e) => {
                warn!("interrupt IN failed: {}", e);
                (TransferStatus::Failed, 0)
            }
        }
    } else {
        match handle.write_interrupt(endpoint, &transfer.buffer, DEFAULT_TIMEOUT) {
            Ok(n) => {
                debug!("interrupt OUT moved {} bytes", n);
                (TransferStatus::Completed, n)
            }
            Err(rusb::Error::Pipe) => (TransferStatus::Stalled, 0),
            Err(e) => {
                warn!("interrupt OUT failed: {}", e);
                (TransferStatus::Failed, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setup_packet() {
        // GET_DESCRIPTOR(DEVICE), 18 bytes
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::parse(&bytes).unwrap();
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 18);
        assert!(setup.is_in());
    }

    #[test]
    fn test_parse_setup_packet_out() {
        // SET_CONFIGURATION(1)
        let bytes = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = SetupPacket::parse(&bytes).unwrap();
        assert!(!setup.is_in());
        assert_eq!(setup.value, 1);
        assert_eq!(setup.length, 0);
    }

    #[test]
    fn test_parse_setup_requires_eight_bytes() {
        assert!(SetupPacket::parse(&[0x80, 0x06]).is_none());
    }
}

//! USB host subsystem
//!
//! Hybrid sync-async architecture: libusb transfers are blocking, so they
//! run on a dedicated worker thread that owns the device handle. The engine
//! talks to it through the channel bridge; [`BridgeHost`] adapts that
//! bridge to the engine's [`UsbHost`](crate::engine::UsbHost) seam.

pub mod device;
pub mod transfers;
pub mod worker;

pub use device::{attach_device, list_devices, AttachedDevice, DeviceFilter, DeviceKind};
pub use worker::spawn_host_worker;

use common::{HostCommand, HostTransfer, UsbBridge};
use tracing::warn;

use crate::engine::UsbHost;

/// Engine-facing handle that forwards transfers to the USB worker thread.
pub struct BridgeHost {
    bridge: UsbBridge,
}

impl BridgeHost {
    pub fn new(bridge: UsbBridge) -> Self {
        Self { bridge }
    }
}

impl UsbHost for BridgeHost {
    fn submit_control(&self, transfer: HostTransfer) -> common::Result<()> {
        self.bridge
            .try_send_command(HostCommand::SubmitControl(transfer))
    }

    fn submit(&self, transfer: HostTransfer) -> common::Result<()> {
        self.bridge.try_send_command(HostCommand::Submit(transfer))
    }

    fn cancel(&self, token: u32) {
        // Cancellation is advisory; a full queue just means the transfer
        // completes normally and the router drops its completion.
        if let Err(e) = self.bridge.try_send_command(HostCommand::Cancel { token }) {
            warn!("could not queue cancel for seqnum {:#x}: {}", token, e);
        }
    }
}

//! Device registry
//!
//! Publishes the single attached device and serves the op-phase queries.
//! The record is built once at attach and replaced wholesale on re-attach,
//! so readers only ever see a complete device.

use std::sync::{Arc, RwLock};

use protocol::{encode_devlist_reply, encode_import_reply, DeviceRecord};
use tracing::{debug, info};

#[derive(Default)]
pub struct DeviceRegistry {
    attached: RwLock<Option<Arc<DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a freshly attached device.
    pub fn publish(&self, record: DeviceRecord) {
        info!(
            "exporting device {:04x}:{:04x} as busid {}",
            record.vendor_id, record.product_id, record.busid
        );
        *self.attached.write().expect("registry lock poisoned") = Some(Arc::new(record));
    }

    /// Drop the exported device (detach or teardown).
    pub fn clear(&self) {
        *self.attached.write().expect("registry lock poisoned") = None;
    }

    pub fn attached(&self) -> Option<Arc<DeviceRecord>> {
        self.attached.read().expect("registry lock poisoned").clone()
    }

    /// Build the OP_REP_DEVLIST reply: zero devices when nothing is
    /// attached, one full record otherwise.
    pub fn devlist_reply(&self) -> Vec<u8> {
        encode_devlist_reply(self.attached().as_deref())
    }

    /// Build the OP_REP_IMPORT reply for the requested busid. Returns the
    /// reply bytes and whether the import matched.
    pub fn import_reply(&self, busid: &[u8]) -> (Vec<u8>, bool) {
        let attached = self.attached();
        let matched = attached
            .as_deref()
            .is_some_and(|record| record.matches_busid(busid));

        if !matched {
            debug!(
                "import refused for busid {:?}",
                String::from_utf8_lossy(busid.split(|&b| b == 0).next().unwrap_or(&[]))
            );
        }

        let exported = if matched { attached.as_deref() } else { None };
        (encode_import_reply(exported), matched)
    }
}

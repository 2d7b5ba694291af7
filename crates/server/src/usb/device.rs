//! Device attach and descriptor ingestion
//!
//! Opens the physical device, reads its descriptors through rusb, claims
//! its interfaces, and builds the immutable [`DeviceRecord`] the registry
//! exports. A claim failure is logged and the interface left unusable; it
//! does not abort the attach.

use common::{Error, Result};
use protocol::{DeviceRecord, DeviceSpeed, EndpointMap, EndpointRecord, InterfaceRecord};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

/// Path reported in devlist/import replies
const EXPORT_PATH: &str = "/sys/devices/platform/usbip-host/1-1";
/// The single exported bus identifier
const EXPORT_BUSID: &str = "1-1";

const USB_CLASS_HUB: u8 = 0x09;

/// VID:PID selector from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Coarse classification of the attached device, for operator logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Unknown,
    /// CDC-ACM virtual serial port
    Serial,
    /// Mass storage, SCSI bulk-only transport
    Storage,
    /// HID (keyboard, mouse, scanner)
    Hid,
}

/// An opened, claimed device ready for export
pub struct AttachedDevice {
    pub handle: DeviceHandle<Context>,
    pub record: DeviceRecord,
    pub kind: DeviceKind,
}

/// One row of `--list-device` output
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub speed: rusb::Speed,
}

/// Enumerate candidate devices without opening them.
pub fn list_devices() -> Result<Vec<DeviceSummary>> {
    let context = Context::new().map_err(usb_err)?;
    let mut out = Vec::new();
    for device in context.devices().map_err(usb_err)?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        out.push(DeviceSummary {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus_number: device.bus_number(),
            address: device.address(),
            speed: device.speed(),
        });
    }
    Ok(out)
}

/// Open the device selected by `filter` (or the first non-hub device) and
/// build its export record.
pub fn attach_device(filter: Option<DeviceFilter>) -> Result<AttachedDevice> {
    let context = Context::new().map_err(usb_err)?;
    let device = select_device(&context, filter)?;
    let descriptor = device.device_descriptor().map_err(usb_err)?;

    info!(
        "attaching {:04x}:{:04x} (bus {:03} device {:03})",
        descriptor.vendor_id(),
        descriptor.product_id(),
        device.bus_number(),
        device.address()
    );

    let mut handle = device.open().map_err(usb_err)?;
    // Not supported on every platform; claiming still works without it.
    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        debug!("auto-detach of kernel drivers unavailable: {}", e);
    }

    let config = device.active_config_descriptor().map_err(usb_err)?;

    let mut interfaces = Vec::with_capacity(config.num_interfaces() as usize);
    let mut endpoints = EndpointMap::new();

    for interface in config.interfaces() {
        let Some(alt) = interface.descriptors().next() else {
            continue;
        };
        interfaces.push(InterfaceRecord {
            class: alt.class_code(),
            subclass: alt.sub_class_code(),
            protocol: alt.protocol_code(),
        });

        for endpoint in alt.endpoint_descriptors() {
            endpoints.insert(EndpointRecord {
                address: endpoint.address(),
                max_packet_size: endpoint.max_packet_size(),
                attributes: transfer_type_bits(endpoint.transfer_type()),
            });
        }

        if let Err(e) = handle.claim_interface(interface.number()) {
            // The endpoint map keeps the entries; transfers on them will
            // fail at the host and surface as transfer errors.
            warn!("failed to claim interface {}: {}", interface.number(), e);
        }
    }

    let kind = detect_device_kind(&interfaces);

    let record = DeviceRecord {
        path: EXPORT_PATH.to_string(),
        busid: EXPORT_BUSID.to_string(),
        busnum: 1,
        devnum: 1,
        speed: map_speed(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: version_to_bcd(descriptor.device_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value: config.number(),
        num_configurations: descriptor.num_configurations(),
        interfaces,
        endpoints,
    };

    info!("attached as {:?} device, busid {}", kind, record.busid);

    Ok(AttachedDevice {
        handle,
        record,
        kind,
    })
}

fn select_device(context: &Context, filter: Option<DeviceFilter>) -> Result<Device<Context>> {
    for device in context.devices().map_err(usb_err)?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let wanted = match filter {
            Some(f) => {
                descriptor.vendor_id() == f.vendor_id && descriptor.product_id() == f.product_id
            }
            None => descriptor.class_code() != USB_CLASS_HUB,
        };
        if wanted {
            return Ok(device);
        }
    }
    Err(Error::Usb("no exportable USB device found".into()))
}

/// Classify the device from its interface classes.
fn detect_device_kind(interfaces: &[InterfaceRecord]) -> DeviceKind {
    let mut kind = DeviceKind::Unknown;
    for intf in interfaces {
        match (intf.class, intf.subclass, intf.protocol) {
            // CDC control or CDC data
            (0x02, 0x02, _) | (0x0a, 0x00, _) => kind = DeviceKind::Serial,
            // SCSI transparent command set, bulk-only transport
            (0x08, 0x06, 0x50) => kind = DeviceKind::Storage,
            (0x03, _, _) => kind = DeviceKind::Hid,
            _ => {}
        }
    }
    kind
}

fn map_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        // The export record only distinguishes low/full/high; faster
        // devices are announced as high speed.
        _ => DeviceSpeed::High,
    }
}

fn transfer_type_bits(transfer_type: rusb::TransferType) -> u8 {
    match transfer_type {
        rusb::TransferType::Control => 0x00,
        rusb::TransferType::Isochronous => 0x01,
        rusb::TransferType::Bulk => 0x02,
        rusb::TransferType::Interrupt => 0x03,
    }
}

fn version_to_bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

fn usb_err(e: rusb::Error) -> Error {
    Error::Usb(e.to_string())
}

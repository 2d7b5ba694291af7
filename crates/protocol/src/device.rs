//! Exported-device records
//!
//! The device record is built once when the physical device is attached and
//! is immutable afterwards. It carries everything the op phase serializes:
//! the 312-byte device block shared by `OP_REP_DEVLIST` and `OP_REP_IMPORT`,
//! the interface list (devlist only), and the endpoint map the dispatcher
//! consults for `wMaxPacketSize` round-up.

use byteorder::{BigEndian, ByteOrder};

use crate::pdu::Direction;

/// Size of the device block inside devlist/import replies
pub const DEVICE_BLOCK_SIZE: usize = 312;
/// Size of one interface entry in a devlist reply
pub const INTERFACE_ENTRY_SIZE: usize = 4;

const PATH_SIZE: usize = 256;
const BUSID_FIELD_SIZE: usize = 32;

/// Device speed as encoded in the device block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low = 1,
    Full = 2,
    High = 3,
}

/// One interface as listed in a devlist reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// One endpoint descriptor as needed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRecord {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    pub max_packet_size: u16,
    /// bmAttributes (transfer type in the low two bits)
    pub attributes: u8,
}

/// Endpoint lookup table, one slot per endpoint number and direction.
///
/// Populated once at attach; read-only afterwards, so lookups need no
/// synchronization.
#[derive(Debug, Clone, Default)]
pub struct EndpointMap {
    slots: [[Option<EndpointRecord>; 2]; 16],
}

impl EndpointMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an endpoint under its number and direction, both derived from
    /// `bEndpointAddress`. Out-of-range numbers are ignored.
    pub fn insert(&mut self, record: EndpointRecord) {
        let num = (record.address & 0x0f) as usize;
        let dir = usize::from(record.address & 0x80 != 0);
        self.slots[num][dir] = Some(record);
    }

    pub fn get(&self, ep: u8, direction: Direction) -> Option<&EndpointRecord> {
        if ep > 15 {
            return None;
        }
        self.slots[ep as usize][direction as usize].as_ref()
    }

    pub fn max_packet_size(&self, ep: u8, direction: Direction) -> Option<u16> {
        self.get(ep, direction).map(|r| r.max_packet_size)
    }
}

/// The exported device, immutable after attach
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Sysfs-style path reported to clients, NUL-padded to 256 bytes
    pub path: String,
    /// Bus identifier, NUL-padded to 32 bytes
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceRecord>,
    pub endpoints: EndpointMap,
}

impl DeviceRecord {
    /// Whether `busid` (NUL-padded wire bytes) names this device.
    pub fn matches_busid(&self, busid: &[u8]) -> bool {
        let requested = busid.split(|&b| b == 0).next().unwrap_or(&[]);
        requested == self.busid.as_bytes()
    }

    /// Append the 312-byte device block.
    pub fn encode_block(&self, out: &mut Vec<u8>) {
        push_padded(out, self.path.as_bytes(), PATH_SIZE);
        push_padded(out, self.busid.as_bytes(), BUSID_FIELD_SIZE);

        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, self.busnum);
        out.extend_from_slice(&word);
        BigEndian::write_u32(&mut word, self.devnum);
        out.extend_from_slice(&word);
        BigEndian::write_u32(&mut word, self.speed as u32);
        out.extend_from_slice(&word);

        let mut half = [0u8; 2];
        BigEndian::write_u16(&mut half, self.vendor_id);
        out.extend_from_slice(&half);
        BigEndian::write_u16(&mut half, self.product_id);
        out.extend_from_slice(&half);
        BigEndian::write_u16(&mut half, self.bcd_device);
        out.extend_from_slice(&half);

        out.push(self.device_class);
        out.push(self.device_subclass);
        out.push(self.device_protocol);
        out.push(self.configuration_value);
        out.push(self.num_configurations);
        out.push(self.interfaces.len() as u8);
    }

    /// Append the 4-byte-per-interface list used by devlist replies.
    pub fn encode_interfaces(&self, out: &mut Vec<u8>) {
        for intf in &self.interfaces {
            out.push(intf.class);
            out.push(intf.subclass);
            out.push(intf.protocol);
            out.push(0);
        }
    }
}

/// Round `len` up to the next multiple of the endpoint's max packet size.
///
/// IN transfers must be submitted to the host controller in whole packets;
/// a short final packet still needs buffer room for a full one.
pub fn round_up_to_mps(len: u32, mps: u16) -> u32 {
    if mps == 0 {
        return len;
    }
    let mps = u32::from(mps);
    len.div_ceil(mps) * mps
}

fn push_padded(out: &mut Vec<u8>, bytes: &[u8], width: usize) {
    let take = bytes.len().min(width);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + (width - take), 0);
}

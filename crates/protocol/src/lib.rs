//! USB/IP wire protocol for rust-usbip
//!
//! This crate defines the USB/IP v1.11 PDU types and the codec that maps
//! them to and from wire bytes, as documented in the
//! [Linux kernel](https://docs.kernel.org/usb/usbip_protocol.html).
//! It is a pure data crate with no sockets and no USB: bytes in, structs
//! out, and back.
//!
//! # Example
//!
//! ```
//! use protocol::{decode_urb_pdu, encode_ret_submit, UrbPdu};
//!
//! // A 48-byte CMD_SUBMIT header for an IN transfer on endpoint 0
//! let mut wire = vec![0u8; 48];
//! wire[3] = 0x01; // command = CMD_SUBMIT
//! wire[7] = 0x2a; // seqnum = 42
//! wire[15] = 0x01; // direction = IN
//!
//! let (pdu, consumed) = decode_urb_pdu(&wire).unwrap().unwrap();
//! assert_eq!(consumed, 48);
//! assert_eq!(pdu.seqnum(), 42);
//!
//! // The matching completion
//! let reply = encode_ret_submit(42, 0, 0, b"data");
//! assert_eq!(reply.len(), 52);
//! ```

pub mod codec;
pub mod device;
pub mod error;
pub mod pdu;

pub use codec::{
    decode_op_header, decode_op_request, decode_submit, decode_unlink, decode_urb_pdu,
    encode_devlist_reply, encode_import_reply, encode_ret_submit, encode_ret_unlink,
};
pub use device::{
    round_up_to_mps, DeviceRecord, DeviceSpeed, EndpointMap, EndpointRecord, InterfaceRecord,
    DEVICE_BLOCK_SIZE,
};
pub use error::{ProtocolError, Result};
pub use pdu::{
    errno, Direction, OpHeader, OpRequest, SubmitCmd, UnlinkCmd, UrbPdu, BUSID_SIZE, CMD_SUBMIT,
    CMD_UNLINK, HEADER_SIZE, MAX_URB_PAYLOAD, OP_HEADER_SIZE, OP_REP_DEVLIST, OP_REP_IMPORT,
    OP_REQ_DEVLIST, OP_REQ_IMPORT, RET_SUBMIT, RET_UNLINK, SETUP_SIZE, USBIP_VERSION,
};

//! Wire codec for USB/IP PDUs
//!
//! Bijective mapping between on-wire bytes and the in-memory PDU structs in
//! [`crate::pdu`]. All multi-byte integers are big-endian on the wire and
//! converted here; everything past this module works in host byte order.
//!
//! Decoding is incremental: several PDUs may arrive concatenated in one TCP
//! read, and a PDU may arrive split across reads. The `decode_*` entry
//! points therefore take the unconsumed buffer and return `Ok(None)` when
//! more bytes are needed, or `Ok(Some((pdu, consumed)))` where `consumed` is
//! derived strictly from header-declared sizes.

use byteorder::{BigEndian, ByteOrder};

use crate::device::DeviceRecord;
use crate::error::{ProtocolError, Result};
use crate::pdu::{
    Direction, OpHeader, OpRequest, SubmitCmd, UnlinkCmd, UrbPdu, BUSID_SIZE, CMD_SUBMIT,
    CMD_UNLINK, HEADER_SIZE, MAX_ENDPOINT, MAX_URB_PAYLOAD, OP_HEADER_SIZE, OP_REP_DEVLIST,
    OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, RET_SUBMIT, RET_UNLINK, SETUP_SIZE,
    USBIP_VERSION,
};

/// Decode the fixed 8-byte op-phase header.
///
/// Versions other than [`USBIP_VERSION`] are decoded as-is; version policy
/// belongs to the caller.
pub fn decode_op_header(bytes: &[u8]) -> Result<OpHeader> {
    if bytes.len() < OP_HEADER_SIZE {
        return Err(ProtocolError::ShortPayload {
            expected: OP_HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    Ok(OpHeader {
        version: BigEndian::read_u16(&bytes[0..2]),
        code: BigEndian::read_u16(&bytes[2..4]),
        status: BigEndian::read_u32(&bytes[4..8]),
    })
}

/// Decode one op-phase request from the front of `buf`.
///
/// Returns `Ok(None)` until the request is complete in the buffer.
pub fn decode_op_request(buf: &[u8]) -> Result<Option<(OpRequest, usize)>> {
    if buf.len() < OP_HEADER_SIZE {
        return Ok(None);
    }
    let header = decode_op_header(buf)?;

    match header.code {
        OP_REQ_DEVLIST => Ok(Some((OpRequest::Devlist, OP_HEADER_SIZE))),
        OP_REQ_IMPORT => {
            let total = OP_HEADER_SIZE + BUSID_SIZE;
            if buf.len() < total {
                return Ok(None);
            }
            let mut busid = [0u8; BUSID_SIZE];
            busid.copy_from_slice(&buf[OP_HEADER_SIZE..total]);
            Ok(Some((OpRequest::Import { busid }, total)))
        }
        code => Err(ProtocolError::UnknownOp { code }),
    }
}

/// Decode one URB-phase PDU from the front of `buf`.
///
/// The consumed length is `48 + transfer_buffer_length` for an OUT SUBMIT
/// and 48 for everything else, so a stream of concatenated PDUs is walked
/// by header-declared sizes alone. Partial trailing bytes yield `Ok(None)`
/// and stay in the buffer for the next read.
pub fn decode_urb_pdu(buf: &[u8]) -> Result<Option<(UrbPdu, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let command = BigEndian::read_u32(&buf[0..4]);
    match command {
        CMD_SUBMIT => decode_submit(buf),
        CMD_UNLINK => decode_unlink(buf).map(Some),
        command => Err(ProtocolError::UnknownCommand { command }),
    }
}

/// Decode a `CMD_SUBMIT`, header plus OUT payload.
pub fn decode_submit(buf: &[u8]) -> Result<Option<(UrbPdu, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let seqnum = BigEndian::read_u32(&buf[4..8]);
    let devid = BigEndian::read_u32(&buf[8..12]);
    let direction = Direction::from_wire(BigEndian::read_u32(&buf[12..16]))?;
    let ep = BigEndian::read_u32(&buf[16..20]);
    if ep > MAX_ENDPOINT {
        return Err(ProtocolError::MalformedHeader {
            detail: "endpoint out of range",
        });
    }

    let transfer_flags = BigEndian::read_u32(&buf[20..24]);
    let transfer_buffer_length = BigEndian::read_u32(&buf[24..28]);
    if transfer_buffer_length as usize > MAX_URB_PAYLOAD {
        return Err(ProtocolError::MalformedHeader {
            detail: "transfer buffer length exceeds cap",
        });
    }
    let start_frame = BigEndian::read_u32(&buf[28..32]);
    let number_of_packets = BigEndian::read_u32(&buf[32..36]);
    let interval = BigEndian::read_u32(&buf[36..40]);
    let mut setup = [0u8; SETUP_SIZE];
    setup.copy_from_slice(&buf[40..48]);

    // OUT carries the payload inline; IN carries none.
    let (data, consumed) = match direction {
        Direction::Out => {
            let total = HEADER_SIZE + transfer_buffer_length as usize;
            if buf.len() < total {
                return Ok(None);
            }
            (buf[HEADER_SIZE..total].to_vec(), total)
        }
        Direction::In => (Vec::new(), HEADER_SIZE),
    };

    Ok(Some((
        UrbPdu::Submit(SubmitCmd {
            seqnum,
            devid,
            direction,
            ep: ep as u8,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
            data,
        }),
        consumed,
    )))
}

/// Decode a `CMD_UNLINK`; always exactly 48 bytes.
pub fn decode_unlink(buf: &[u8]) -> Result<(UrbPdu, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::ShortPayload {
            expected: HEADER_SIZE,
            actual: buf.len(),
        });
    }

    Ok((
        UrbPdu::Unlink(UnlinkCmd {
            seqnum: BigEndian::read_u32(&buf[4..8]),
            devid: BigEndian::read_u32(&buf[8..12]),
            target_seqnum: BigEndian::read_u32(&buf[20..24]),
        }),
        HEADER_SIZE,
    ))
}

/// Encode an `OP_REP_DEVLIST`. `device` is `None` when nothing is attached,
/// which yields the 12-byte zero-count reply.
pub fn encode_devlist_reply(device: Option<&DeviceRecord>) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + 312 + 4 * 4);
    push_op_header(&mut out, OP_REP_DEVLIST, 0);
    push_u32(&mut out, device.map_or(0, |_| 1));
    if let Some(record) = device {
        record.encode_block(&mut out);
        record.encode_interfaces(&mut out);
    }
    out
}

/// Encode an `OP_REP_IMPORT`. A mismatched or absent device produces the
/// 8-byte failure reply with status 1 (ENODEV).
pub fn encode_import_reply(device: Option<&DeviceRecord>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 312);
    match device {
        Some(record) => {
            push_op_header(&mut out, OP_REP_IMPORT, 0);
            record.encode_block(&mut out);
        }
        None => push_op_header(&mut out, OP_REP_IMPORT, 1),
    }
    out
}

/// Encode a `RET_SUBMIT` for `seqnum`.
///
/// The header is always 48 bytes; `payload` is appended for successful IN
/// transfers and must be empty otherwise. `actual_length` mirrors the
/// payload length, and `start_frame` / `number_of_packets` / padding are
/// zeroed (no isochronous support).
pub fn encode_ret_submit(seqnum: u32, status: i32, error_count: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    push_urb_header(&mut out, RET_SUBMIT, seqnum);
    push_u32(&mut out, status as u32);
    push_u32(&mut out, payload.len() as u32);
    push_u32(&mut out, 0); // start_frame
    push_u32(&mut out, 0); // number_of_packets
    push_u32(&mut out, error_count);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(payload);
    out
}

/// Encode a 48-byte `RET_UNLINK` echoing the UNLINK's own seqnum.
pub fn encode_ret_unlink(seqnum: u32, status: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    push_urb_header(&mut out, RET_UNLINK, seqnum);
    push_u32(&mut out, status as u32);
    out.extend_from_slice(&[0u8; 24]);
    out
}

fn push_op_header(out: &mut Vec<u8>, code: u16, status: u32) {
    let mut half = [0u8; 2];
    BigEndian::write_u16(&mut half, USBIP_VERSION);
    out.extend_from_slice(&half);
    BigEndian::write_u16(&mut half, code);
    out.extend_from_slice(&half);
    push_u32(out, status);
}

// Responses zero devid, direction and ep, matching the kernel's stub driver.
fn push_urb_header(out: &mut Vec<u8>, command: u32, seqnum: u32) {
    push_u32(out, command);
    push_u32(out, seqnum);
    push_u32(out, 0); // devid
    push_u32(out, 0); // direction
    push_u32(out, 0); // ep
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, value);
    out.extend_from_slice(&word);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::errno;

    fn submit_bytes(seqnum: u32, direction: u32, ep: u32, length: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, CMD_SUBMIT);
        push_u32(&mut buf, seqnum);
        push_u32(&mut buf, 0); // devid
        push_u32(&mut buf, direction);
        push_u32(&mut buf, ep);
        push_u32(&mut buf, 0); // transfer_flags
        push_u32(&mut buf, length);
        push_u32(&mut buf, 0); // start_frame
        push_u32(&mut buf, 0); // number_of_packets
        push_u32(&mut buf, 0); // interval
        buf.extend_from_slice(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn test_decode_submit_in() {
        let buf = submit_bytes(0x100, 1, 0, 18, &[]);
        let (pdu, consumed) = decode_urb_pdu(&buf).unwrap().unwrap();
        assert_eq!(consumed, 48);
        let UrbPdu::Submit(cmd) = pdu else {
            panic!("expected SUBMIT");
        };
        assert_eq!(cmd.seqnum, 0x100);
        assert_eq!(cmd.direction, Direction::In);
        assert_eq!(cmd.ep, 0);
        assert_eq!(cmd.transfer_buffer_length, 18);
        assert_eq!(cmd.setup, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert!(cmd.data.is_empty());
        assert!(cmd.is_control());
    }

    #[test]
    fn test_decode_submit_out_consumes_payload() {
        let payload = vec![0xAB; 64];
        let buf = submit_bytes(0x200, 0, 1, 64, &payload);
        let (pdu, consumed) = decode_urb_pdu(&buf).unwrap().unwrap();
        assert_eq!(consumed, 48 + 64);
        let UrbPdu::Submit(cmd) = pdu else {
            panic!("expected SUBMIT");
        };
        assert_eq!(cmd.data, payload);
    }

    #[test]
    fn test_decode_submit_out_waits_for_payload() {
        let payload = vec![0xAB; 64];
        let mut buf = submit_bytes(0x200, 0, 1, 64, &payload);
        buf.truncate(48 + 10);
        assert_eq!(decode_urb_pdu(&buf).unwrap(), None);
    }

    #[test]
    fn test_decode_partial_header() {
        let buf = submit_bytes(1, 1, 0, 0, &[]);
        assert_eq!(decode_urb_pdu(&buf[..20]).unwrap(), None);
    }

    #[test]
    fn test_concatenated_pdus_advance_by_declared_sizes() {
        let mut stream = submit_bytes(1, 0, 1, 4, &[1, 2, 3, 4]);
        stream.extend_from_slice(&submit_bytes(2, 1, 1, 512, &[]));

        let (first, consumed) = decode_urb_pdu(&stream).unwrap().unwrap();
        assert_eq!(consumed, 52);
        assert_eq!(first.seqnum(), 1);

        let (second, consumed) = decode_urb_pdu(&stream[52..]).unwrap().unwrap();
        assert_eq!(consumed, 48);
        assert_eq!(second.seqnum(), 2);
    }

    #[test]
    fn test_decode_rejects_bad_endpoint() {
        let buf = submit_bytes(1, 1, 16, 0, &[]);
        assert!(matches!(
            decode_urb_pdu(&buf),
            Err(ProtocolError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_direction() {
        let buf = submit_bytes(1, 2, 0, 0, &[]);
        assert!(matches!(
            decode_urb_pdu(&buf),
            Err(ProtocolError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_transfer() {
        let buf = submit_bytes(1, 1, 1, (MAX_URB_PAYLOAD + 1) as u32, &[]);
        assert!(matches!(
            decode_urb_pdu(&buf),
            Err(ProtocolError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_decode_unlink() {
        let mut buf = Vec::new();
        push_u32(&mut buf, CMD_UNLINK);
        push_u32(&mut buf, 0x301);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 0x300); // seqnum_to_unlink
        buf.extend_from_slice(&[0u8; 24]);

        let (pdu, consumed) = decode_urb_pdu(&buf).unwrap().unwrap();
        assert_eq!(consumed, 48);
        let UrbPdu::Unlink(cmd) = pdu else {
            panic!("expected UNLINK");
        };
        assert_eq!(cmd.seqnum, 0x301);
        assert_eq!(cmd.target_seqnum, 0x300);
    }

    #[test]
    fn test_decode_unknown_command() {
        let mut buf = vec![0u8; 48];
        buf[3] = 0x7f;
        assert_eq!(
            decode_urb_pdu(&buf),
            Err(ProtocolError::UnknownCommand { command: 0x7f })
        );
    }

    #[test]
    fn test_decode_op_requests() {
        let devlist = [0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00];
        let (req, consumed) = decode_op_request(&devlist).unwrap().unwrap();
        assert_eq!(req, OpRequest::Devlist);
        assert_eq!(consumed, 8);

        let mut import = vec![0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00];
        let mut busid = [0u8; 32];
        busid[..3].copy_from_slice(b"1-1");
        import.extend_from_slice(&busid);

        let (req, consumed) = decode_op_request(&import).unwrap().unwrap();
        assert_eq!(req, OpRequest::Import { busid });
        assert_eq!(consumed, 40);

        // import body not complete yet
        assert_eq!(decode_op_request(&import[..20]).unwrap(), None);
    }

    #[test]
    fn test_decode_op_header_foreign_version() {
        let bytes = [0x01, 0x06, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00];
        let header = decode_op_header(&bytes).unwrap();
        assert_eq!(header.version, 0x0106);
        assert_eq!(header.code, OP_REQ_DEVLIST);
    }

    #[test]
    fn test_ret_submit_success_layout() {
        let payload = [0x12u8; 18];
        let out = encode_ret_submit(0x100, 0, 0, &payload);
        assert_eq!(out.len(), 66);
        assert_eq!(&out[0..4], &[0, 0, 0, 3]); // command
        assert_eq!(&out[4..8], &[0, 0, 1, 0]); // seqnum
        assert_eq!(&out[20..24], &[0, 0, 0, 0]); // status
        assert_eq!(&out[24..28], &[0, 0, 0, 0x12]); // actual_length
        assert_eq!(&out[28..40], &[0u8; 12]); // start_frame, packets, error_count
        assert_eq!(&out[48..], &payload);
    }

    #[test]
    fn test_ret_submit_failure_layout() {
        let out = encode_ret_submit(7, errno::ETIME, 1, &[]);
        assert_eq!(out.len(), 48);
        assert_eq!(&out[20..24], &(-62i32).to_be_bytes());
        assert_eq!(&out[24..28], &[0, 0, 0, 0]); // actual_length
        assert_eq!(&out[36..40], &[0, 0, 0, 1]); // error_count
    }

    #[test]
    fn test_ret_unlink_layout() {
        let out = encode_ret_unlink(0x301, 0);
        assert_eq!(out.len(), 48);
        assert_eq!(&out[0..4], &[0, 0, 0, 4]);
        assert_eq!(&out[4..8], &[0, 0, 3, 1]);
        assert_eq!(&out[20..24], &[0, 0, 0, 0]);

        let out = encode_ret_unlink(0x301, errno::ENOENT);
        assert_eq!(&out[20..24], &(-2i32).to_be_bytes());
    }
}

/// Round-trip and framing properties over arbitrary PDUs
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn encode_submit(cmd: &SubmitCmd) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, CMD_SUBMIT);
        push_u32(&mut out, cmd.seqnum);
        push_u32(&mut out, cmd.devid);
        push_u32(&mut out, cmd.direction as u32);
        push_u32(&mut out, cmd.ep as u32);
        push_u32(&mut out, cmd.transfer_flags);
        push_u32(&mut out, cmd.transfer_buffer_length);
        push_u32(&mut out, cmd.start_frame);
        push_u32(&mut out, cmd.number_of_packets);
        push_u32(&mut out, cmd.interval);
        out.extend_from_slice(&cmd.setup);
        out.extend_from_slice(&cmd.data);
        out
    }

    fn submit_strategy() -> impl Strategy<Value = SubmitCmd> {
        (
            any::<u32>(),
            any::<u32>(),
            0u8..=15,
            any::<u32>(),
            prop::collection::vec(any::<u8>(), 0..256),
            any::<[u8; 8]>(),
            prop::bool::ANY,
        )
            .prop_map(
                |(seqnum, devid, ep, transfer_flags, data, setup, is_in)| {
                    let (direction, transfer_buffer_length, data) = if is_in {
                        (Direction::In, data.len() as u32, Vec::new())
                    } else {
                        (Direction::Out, data.len() as u32, data)
                    };
                    SubmitCmd {
                        seqnum,
                        devid,
                        direction,
                        ep,
                        transfer_flags,
                        transfer_buffer_length,
                        start_frame: 0,
                        number_of_packets: 0,
                        interval: 0,
                        setup,
                        data,
                    }
                },
            )
    }

    proptest! {
        /// Encoding then decoding a SUBMIT yields the original structure.
        #[test]
        fn prop_submit_roundtrip(cmd in submit_strategy()) {
            let wire = encode_submit(&cmd);
            let (decoded, consumed) = decode_urb_pdu(&wire).unwrap().unwrap();
            prop_assert_eq!(consumed, wire.len());
            prop_assert_eq!(decoded, UrbPdu::Submit(cmd));
        }

        /// Any strict prefix of a PDU decodes to "need more bytes",
        /// never to a wrong PDU or an error.
        #[test]
        fn prop_prefix_never_misparses(cmd in submit_strategy(), cut in 1usize..48) {
            let wire = encode_submit(&cmd);
            let cut = cut.min(wire.len() - 1);
            prop_assert_eq!(decode_urb_pdu(&wire[..cut]).unwrap(), None);
        }

        /// RET_SUBMIT headers are always exactly 48 bytes before payload and
        /// echo the seqnum unchanged.
        #[test]
        fn prop_ret_submit_header(seqnum in any::<u32>(), payload in prop::collection::vec(any::<u8>(), 0..128)) {
            let out = encode_ret_submit(seqnum, 0, 0, &payload);
            prop_assert_eq!(out.len(), 48 + payload.len());
            prop_assert_eq!(BigEndian::read_u32(&out[4..8]), seqnum);
            prop_assert_eq!(BigEndian::read_u32(&out[24..28]) as usize, payload.len());
        }
    }
}

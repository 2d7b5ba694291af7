//! In-flight URB state

use common::TransferKind;
use protocol::Direction;

/// Lifecycle of a URB after the dispatcher accepted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbState {
    /// Host transfer in flight
    Submitted,
    /// Detached by CMD_UNLINK; the late completion is dropped
    Unlinked,
}

/// One accepted URB, owned by the sequence table while its host transfer
/// is in flight.
///
/// The transfer buffer itself travels with the host transfer and comes back
/// in the completion event; the record keeps only what the router needs to
/// shape the response.
#[derive(Debug)]
pub struct UrbRecord {
    pub seqnum: u32,
    pub ep: u8,
    pub direction: Direction,
    pub flags: u32,
    pub requested_length: u32,
    pub kind: TransferKind,
    /// Control setup packet; `None` for non-control URBs
    pub setup: Option<[u8; 8]>,
    pub state: UrbState,
}

impl UrbRecord {
    pub fn is_control(&self) -> bool {
        self.kind == TransferKind::Control
    }
}

//! Host-side transfer types
//!
//! A [`HostTransfer`] is one unit of work handed to the USB thread; a
//! [`TransferDone`] is the matching completion posted back. The `token`
//! (the URB seqnum) is the only link between the two sides: completions
//! never carry pointers, so a late or duplicate completion resolves to
//! nothing instead of to freed state.

/// Transfer class, selected from the endpoint descriptor at dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Endpoint 0; the buffer starts with the 8-byte setup packet
    Control,
    Bulk,
    Interrupt,
}

/// One USB transfer submitted to the host layer
#[derive(Debug)]
pub struct HostTransfer {
    /// URB seqnum, returned unchanged in the completion
    pub token: u32,
    /// Endpoint address including the direction bit (0x80 = IN)
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Owned transfer buffer. OUT: pre-filled payload (control transfers
    /// carry the setup packet at offset 0). IN: zeroed, sized to the
    /// rounded-up request.
    pub buffer: Vec<u8>,
}

impl HostTransfer {
    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

/// Outcome of a host transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Endpoint stalled; reported distinctly so the client sees -EPIPE
    Stalled,
    /// Any other device-side failure, including timeout
    Failed,
}

/// Completion event posted from the USB thread
#[derive(Debug)]
pub struct TransferDone {
    pub token: u32,
    pub status: TransferStatus,
    /// The transfer buffer, with IN data filled in
    pub buffer: Vec<u8>,
    /// Bytes the host layer moved. For control transfers this includes
    /// the 8-byte setup echo at the front of the buffer.
    pub actual: usize,
}

//! Protocol error types

use thiserror::Error;

/// Errors produced while decoding USB/IP PDUs
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A header field failed validation
    #[error("malformed header: {detail}")]
    MalformedHeader { detail: &'static str },

    /// The buffer ended before the declared payload
    #[error("short payload: expected {expected} bytes, got {actual}")]
    ShortPayload { expected: usize, actual: usize },

    /// URB-phase command code is not SUBMIT or UNLINK
    #[error("unknown command: {command:#010x}")]
    UnknownCommand { command: u32 },

    /// Op-phase code is not DEVLIST or IMPORT
    #[error("unknown operation: {code:#06x}")]
    UnknownOp { code: u16 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

//! Common utilities for rust-usbip
//!
//! This crate provides the plumbing shared across the server: error
//! handling, logging setup, the host-transfer types, and the async channel
//! bridge that connects the Tokio runtime to the blocking USB thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod transfer;

pub use channel::{create_usb_bridge, HostCommand, UsbBridge, UsbWorker};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use transfer::{HostTransfer, TransferDone, TransferKind, TransferStatus};

//! Server internals for rust-usbip
//!
//! Exposed as a library so integration tests can drive the protocol engine
//! directly; the shipped binary lives in `main.rs`.

pub mod config;
pub mod engine;
pub mod network;
pub mod usb;
